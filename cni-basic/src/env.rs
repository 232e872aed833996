use std::path::PathBuf;

use cni_plugin::Command;

use crate::config::validate_ifname;
use crate::error::AppError;
use crate::types::{NamespaceRef, owner_key};

/// What the container runtime asked for, as read from `CNI_*` variables.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub command: Command,
    pub container_id: String,
    pub netns: Option<NamespaceRef>,
    pub ifname: String,
    pub args: Vec<(String, String)>,
    pub path: Vec<PathBuf>,
}

impl InvocationContext {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Only `CNI_COMMAND` is read strictly here. Everything else is checked
    /// by [`InvocationContext::validate`], which VERSION never calls.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let command = match lookup("CNI_COMMAND").as_deref() {
            None | Some("") => {
                return Err(AppError::InvalidEnvironment(
                    "CNI_COMMAND is not set".to_string(),
                ));
            }
            Some("ADD") => Command::Add,
            Some("DEL") => Command::Del,
            Some("CHECK") => Command::Check,
            Some("VERSION") => Command::Version,
            Some(other) => return Err(AppError::UnsupportedCommand(other.to_string())),
        };

        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        Ok(Self {
            command,
            container_id: non_empty("CNI_CONTAINERID").unwrap_or_default(),
            netns: non_empty("CNI_NETNS").map(NamespaceRef::new),
            ifname: non_empty("CNI_IFNAME").unwrap_or_default(),
            args: non_empty("CNI_ARGS")
                .map(|args| parse_args(&args))
                .unwrap_or_default(),
            path: non_empty("CNI_PATH")
                .map(|p| p.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect())
                .unwrap_or_default(),
        })
    }

    /// Checks the variables ADD, DEL and CHECK depend on. DEL tolerates a
    /// missing namespace so that cleanup works after the sandbox is gone.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.container_id.is_empty() {
            return Err(AppError::InvalidEnvironment(
                "CNI_CONTAINERID is not set".to_string(),
            ));
        }
        if self.ifname.is_empty() {
            return Err(AppError::InvalidEnvironment(
                "CNI_IFNAME is not set".to_string(),
            ));
        }
        validate_ifname("CNI_IFNAME", &self.ifname)
            .map_err(|e| AppError::InvalidEnvironment(e.to_string()))?;
        if self.netns.is_none() && !matches!(self.command, Command::Del) {
            return Err(AppError::InvalidEnvironment("CNI_NETNS is not set".to_string()));
        }
        Ok(())
    }

    pub fn owner(&self) -> String {
        owner_key(&self.container_id, &self.ifname)
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// `CNI_ARGS` is a `;`-separated list of `KEY=VALUE` pairs. Malformed
/// entries are skipped.
fn parse_args(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

pub fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Add => "ADD",
        Command::Del => "DEL",
        Command::Check => "CHECK",
        Command::Version => "VERSION",
    }
}
