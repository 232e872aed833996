use cni_plugin::{error::CniError, reply::ErrorReply};
use libipam::PoolError;
use semver::Version;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Cni(#[from] CniError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Incompatible CNI version {0}")]
    IncompatibleVersion(Version),

    #[error("Unsupported field {field}: {reason}")]
    UnsupportedField { field: &'static str, reason: String },

    #[error("Unknown container: {0}")]
    UnknownContainer(String),

    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("TopologyError: {0}")]
    Topology(String),

    #[error("Check failed: {0}")]
    CheckFailed(String),
}

impl AppError {
    pub(crate) fn topology(context: impl std::fmt::Display) -> impl FnOnce(anyhow::Error) -> Self {
        move |e| AppError::Topology(format!("{context}: {e:#}"))
    }

    /// The numeric code placed in the error reply. Errors raised by the
    /// `cni_plugin` crate carry their own code, see [`CniError::into_reply`].
    pub fn code(&self) -> i32 {
        match self {
            AppError::Cni(_) => 100,
            AppError::Pool(e) => match e {
                PoolError::Configuration(_) => 7,
                PoolError::Storage { .. } | PoolError::Corrupt { .. } => 11,
                PoolError::Exhausted(_) => 110,
                PoolError::NotAllocated { .. } | PoolError::AlreadyAllocated { .. } => 111,
            },
            AppError::IncompatibleVersion(_) => 1,
            AppError::UnsupportedField { .. } => 2,
            AppError::UnknownContainer(_) => 3,
            AppError::InvalidEnvironment(_) | AppError::UnsupportedCommand(_) => 4,
            AppError::InvalidConfig(_) => 7,
            AppError::Topology(_) => 112,
            AppError::CheckFailed(_) => 113,
        }
    }

    pub fn into_reply(self, cni_version: Version) -> ErrorReply<'static> {
        if let AppError::Cni(e) = self {
            return e.into_reply(cni_version);
        }
        let code = self.code();
        let msg = match &self {
            AppError::Cni(_) => "CNI error",
            AppError::Pool(PoolError::Configuration(_)) => "Invalid pool configuration",
            AppError::Pool(PoolError::Storage { .. }) => "Pool storage failure",
            AppError::Pool(PoolError::Corrupt { .. }) => "Pool state is corrupt",
            AppError::Pool(PoolError::Exhausted(_)) => "Address pool exhausted",
            AppError::Pool(PoolError::NotAllocated { .. }) => "Address not allocated",
            AppError::Pool(PoolError::AlreadyAllocated { .. }) => "Address already allocated",
            AppError::IncompatibleVersion(_) => "Incompatible CNI version",
            AppError::UnsupportedField { .. } => "Unsupported field",
            AppError::UnknownContainer(_) => "Unknown container",
            AppError::InvalidEnvironment(_) => "Invalid environment variables",
            AppError::UnsupportedCommand(_) => "Unsupported command",
            AppError::InvalidConfig(_) => "Invalid configuration",
            AppError::Topology(_) => "TopologyError",
            AppError::CheckFailed(_) => "Check failed",
        };
        ErrorReply {
            cni_version,
            code,
            msg,
            details: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn version() -> Version {
        Version::new(1, 1, 0)
    }

    #[test]
    fn test_codes_follow_the_cni_table() {
        assert_eq!(AppError::IncompatibleVersion(version()).code(), 1);
        assert_eq!(
            AppError::UnsupportedField {
                field: "vlan",
                reason: "not implemented".into()
            }
            .code(),
            2
        );
        assert_eq!(AppError::UnknownContainer("c1".into()).code(), 3);
        assert_eq!(AppError::UnsupportedCommand("FOO".into()).code(), 4);
        assert_eq!(AppError::InvalidConfig("bad".into()).code(), 7);
        assert_eq!(
            AppError::from(PoolError::Exhausted("net".into())).code(),
            110
        );
        assert_eq!(
            AppError::from(PoolError::NotAllocated {
                pool: "net".into(),
                address: Ipv4Addr::new(10, 0, 0, 2)
            })
            .code(),
            111
        );
    }

    #[test]
    fn test_reply_carries_details() {
        let reply = AppError::Topology("create veth pair: File exists".into()).into_reply(version());
        assert_eq!(reply.code, 112);
        assert_eq!(reply.msg, "TopologyError");
        assert!(reply.details.contains("File exists"));
        assert_eq!(reply.cni_version, version());
    }
}
