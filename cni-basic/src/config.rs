use std::net::IpAddr;
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use libipam::AddressRange;
use semver::Version;
use serde_json::Value;

use crate::error::AppError;
use crate::types::{BridgeNetConf, NetConf};

pub const BRIDGE_DEFAULT_NAME: &str = "cni0";
pub const DEFAULT_MTU: u32 = 1500;
pub const DEFAULT_DATA_DIR: &str = "/var/lib/cni/networks";

/// Versions of the CNI protocol this plugin speaks.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["0.4.0", "1.0.0", "1.1.0"];
/// Reported by VERSION and used for replies when no config could be read.
pub const CURRENT_VERSION: &str = "1.1.0";

// Linux IFNAMSIZ minus the trailing NUL.
const MAX_IFNAME_LEN: usize = 15;

pub fn current_version() -> Version {
    Version::new(1, 1, 0)
}

pub fn supported_versions() -> Vec<Version> {
    SUPPORTED_VERSIONS
        .iter()
        .filter_map(|v| Version::parse(v).ok())
        .collect()
}

/// Best-effort extraction of `cniVersion` for error replies, before the
/// configuration has been validated.
pub fn peek_version(raw: &[u8]) -> Version {
    serde_json::from_slice::<Value>(raw)
        .ok()
        .and_then(|v| v.get("cniVersion")?.as_str().map(str::to_string))
        .and_then(|v| Version::parse(&v).ok())
        .unwrap_or_else(current_version)
}

/// Checks that `name` can be used as a Linux interface name.
pub fn validate_ifname(field: &str, name: &str) -> Result<(), AppError> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN {
        return Err(AppError::InvalidConfig(format!(
            "{field} {name:?} must be 1 to {MAX_IFNAME_LEN} bytes long"
        )));
    }
    if name == "." || name == ".." || name.contains(['/', ':']) || name.contains(char::is_whitespace)
    {
        return Err(AppError::InvalidConfig(format!(
            "{field} {name:?} is not a valid interface name"
        )));
    }
    Ok(())
}

/// Parses and validates the network configuration read from stdin.
///
/// Missing `bridge` and `mtu` are filled with defaults before decoding, the
/// gateway defaults to the first host of the subnet, and the pool directory
/// is taken from `dataDir`, then `ipam.dataDir`, then [`DEFAULT_DATA_DIR`].
pub fn load_netconf(raw: &[u8]) -> Result<NetConf, AppError> {
    let mut json_value: Value = serde_json::from_slice(raw)
        .map_err(|e| AppError::InvalidConfig(format!("failed to parse network configuration: {e}")))?;
    if !json_value.is_object() {
        return Err(AppError::InvalidConfig(
            "network configuration must be a JSON object".to_string(),
        ));
    }

    if json_value.get("bridge").is_none() {
        json_value["bridge"] = serde_json::json!(BRIDGE_DEFAULT_NAME);
    }
    if json_value.get("mtu").is_none() {
        json_value["mtu"] = serde_json::json!(DEFAULT_MTU);
    }
    let ipam_data_dir = json_value
        .pointer("/ipam/dataDir")
        .and_then(Value::as_str)
        .map(PathBuf::from);
    let dns = json_value.get("dns").cloned();
    let ip_masq = json_value.get("ipMasq").and_then(Value::as_bool) == Some(true);

    let bridge_conf: BridgeNetConf = serde_json::from_value(json_value)
        .map_err(|e| AppError::InvalidConfig(format!("failed to decode network configuration: {e}")))?;

    let cni_version = bridge_conf.net_conf.cni_version.clone();
    if !supported_versions().contains(&cni_version) {
        return Err(AppError::IncompatibleVersion(cni_version));
    }

    if bridge_conf.vlan.is_some() {
        return Err(AppError::UnsupportedField {
            field: "vlan",
            reason: "VLAN tagging is not supported".to_string(),
        });
    }
    if bridge_conf.vlan_trunk.is_some() {
        return Err(AppError::UnsupportedField {
            field: "vlanTrunk",
            reason: "VLAN trunking is not supported".to_string(),
        });
    }
    if ip_masq {
        return Err(AppError::UnsupportedField {
            field: "ipMasq",
            reason: "masquerading is not supported".to_string(),
        });
    }

    let name = bridge_conf.net_conf.name.clone();
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(AppError::InvalidConfig(format!(
            "network name {name:?} cannot be used as a file name"
        )));
    }

    let bridge = bridge_conf
        .br_name
        .clone()
        .unwrap_or_else(|| BRIDGE_DEFAULT_NAME.to_string());
    validate_ifname("bridge", &bridge)?;

    let mtu = bridge_conf.mtu.unwrap_or(DEFAULT_MTU);
    if !(68..=65535).contains(&mtu) {
        return Err(AppError::InvalidConfig(format!(
            "mtu {mtu} must be between 68 and 65535"
        )));
    }

    let subnet = match bridge_conf.subnet.as_deref() {
        None | Some("") => {
            return Err(AppError::InvalidConfig("subnet is required".to_string()));
        }
        Some(subnet) => match subnet.parse::<IpNetwork>() {
            Ok(IpNetwork::V4(net)) => net,
            Ok(IpNetwork::V6(_)) => {
                return Err(AppError::UnsupportedField {
                    field: "subnet",
                    reason: format!("{subnet} is IPv6, only IPv4 is supported"),
                });
            }
            Err(e) => {
                return Err(AppError::InvalidConfig(format!(
                    "invalid subnet {subnet}: {e}"
                )));
            }
        },
    };

    let gateway = match bridge_conf.gateway.as_deref() {
        None | Some("") => None,
        Some(gateway) => match gateway.parse::<IpAddr>() {
            Ok(IpAddr::V4(gw)) => Some(gw),
            Ok(IpAddr::V6(_)) => {
                return Err(AppError::UnsupportedField {
                    field: "gateway",
                    reason: format!("{gateway} is IPv6, only IPv4 is supported"),
                });
            }
            Err(e) => {
                return Err(AppError::InvalidConfig(format!(
                    "invalid gateway {gateway}: {e}"
                )));
            }
        },
    };
    let range = AddressRange::new(subnet, gateway)
        .map_err(|e| AppError::InvalidConfig(e.to_string()))?;

    let nameservers = match dns.as_ref().and_then(|d| d.get("nameservers")) {
        None | Some(Value::Null) => Vec::new(),
        Some(list) => parse_nameservers(list)?,
    };

    let data_dir = bridge_conf
        .data_dir
        .clone()
        .or(ipam_data_dir)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

    Ok(NetConf {
        cni_version,
        name,
        bridge,
        subnet,
        gateway: range.gateway(),
        mtu,
        is_default_gw: bridge_conf.is_default_gw.unwrap_or(false),
        data_dir,
        dns,
        nameservers,
    })
}

fn parse_nameservers(list: &Value) -> Result<Vec<IpAddr>, AppError> {
    let entries = list.as_array().ok_or_else(|| {
        AppError::InvalidConfig("dns.nameservers must be a list of addresses".to_string())
    })?;
    entries
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .and_then(|s| s.parse::<IpAddr>().ok())
                .ok_or_else(|| {
                    AppError::InvalidConfig(format!("invalid dns nameserver {entry}"))
                })
        })
        .collect()
}
