use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use cni_plugin::config::NetworkConfig;
use ipnetwork::Ipv4Network;
use macaddr::MacAddr6;
use rtnetlink::LinkMessageBuilder;
use semver::Version;
use serde::{Deserialize, Serialize};

/// Bridge network configuration as read from stdin, extending `NetworkConfig`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeNetConf {
    #[serde(flatten)]
    pub net_conf: NetworkConfig,

    #[serde(rename = "bridge", default, skip_serializing_if = "Option::is_none")]
    pub br_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(
        rename = "isDefaultGateway",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub is_default_gw: Option<bool>,
    #[serde(rename = "dataDir", default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    // Recognised only to be rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<serde_json::Value>,
    #[serde(rename = "vlanTrunk", default, skip_serializing_if = "Option::is_none")]
    pub vlan_trunk: Option<serde_json::Value>,
}

/// A validated network configuration. Immutable for one invocation.
#[derive(Clone, Debug)]
pub struct NetConf {
    pub cni_version: Version,
    pub name: String,
    pub bridge: String,
    pub subnet: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub mtu: u32,
    pub is_default_gw: bool,
    pub data_dir: PathBuf,
    /// Raw `dns` section; echoed back in success replies.
    pub dns: Option<serde_json::Value>,
    pub nameservers: Vec<IpAddr>,
}

impl NetConf {
    pub fn prefix(&self) -> u8 {
        self.subnet.prefix()
    }
}

/// Bridge structure representing a virtual network bridge.
#[derive(Debug, Clone)]
pub struct Bridge {
    pub name: String,
    pub mtu: u32,
}

impl Bridge {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mtu: 1500,
        }
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// The bridge is created down; activation is a separate step.
    pub fn into_builder(self) -> LinkMessageBuilder<rtnetlink::LinkBridge> {
        LinkMessageBuilder::<rtnetlink::LinkBridge>::new(&self.name).mtu(self.mtu)
    }
}

/// A container network namespace, identified by its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceRef {
    path: PathBuf,
}

impl NamespaceRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The owning process for `/proc/<pid>/ns/net` paths. Links can be moved
    /// by pid without opening the namespace file.
    pub fn pid(&self) -> Option<u32> {
        self.path
            .to_str()?
            .strip_prefix("/proc/")?
            .strip_suffix("/ns/net")?
            .parse()
            .ok()
    }
}

impl std::fmt::Display for NamespaceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Snapshot of a network interface, valid only within the current invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    pub name: String,
    pub index: u32,
    pub mac: Option<MacAddr6>,
    pub kind: Option<String>,
    pub controller: Option<u32>,
    /// `None` for the host namespace.
    pub netns: Option<NamespaceRef>,
}

impl LinkHandle {
    pub fn is_bridge(&self) -> bool {
        self.kind.as_deref() == Some("bridge")
    }
}

/// Key under which an allocation is recorded in the pool.
pub fn owner_key(container_id: &str, ifname: &str) -> String {
    format!("{container_id}/{ifname}")
}
