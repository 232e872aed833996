use std::net::IpAddr;

use crate::ip::link::get_handle;

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use log::debug;
use netlink_packet_route::{
    AddressFamily,
    address::{AddressAttribute, AddressMessage, AddressScope},
};

/// An address configured on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    pub ipnet: IpNetwork,
    pub label: String,
    pub scope: AddressScope,
    pub link_index: u32,
}

/// Adds an address to a link in the calling thread's namespace.
///
/// # Arguments
/// * `index` - The index of the network interface.
/// * `address` - The address to add.
/// * `prefix_len` - The prefix length of the address.
///
/// # Returns
/// * `Ok(())` on success.
/// * `Err(anyhow::Error)` on failure, including when the address exists.
pub async fn addr_add(index: u32, address: IpAddr, prefix_len: u8) -> anyhow::Result<()> {
    let handle = get_handle()?;
    debug!("ip addr add {address}/{prefix_len} dev #{index}");
    handle
        .address()
        .add(index, address, prefix_len)
        .execute()
        .await?;
    Ok(())
}

/// Lists the addresses of one family configured on a link.
///
/// # Arguments
/// * `index` - The index of the network interface.
/// * `family` - The address family to keep, e.g. `AddressFamily::Inet`.
///
/// # Returns
/// * `Ok(Vec<Addr>)` with the addresses, possibly empty.
/// * `Err(anyhow::Error)` if the dump fails.
pub async fn addr_list(index: u32, family: AddressFamily) -> anyhow::Result<Vec<Addr>> {
    let handle = get_handle()?;
    let mut stream = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();

    let mut addresses = Vec::new();
    while let Some(msg) = stream.try_next().await? {
        if msg.header.family != family {
            continue;
        }
        if let Some(addr) = Addr::from_message(&msg)? {
            addresses.push(addr);
        }
    }

    Ok(addresses)
}

impl Addr {
    /// Prefers `IFA_LOCAL` over `IFA_ADDRESS`; they only differ on
    /// point-to-point links, where the latter is the peer.
    fn from_message(msg: &AddressMessage) -> anyhow::Result<Option<Self>> {
        let prefix = msg.header.prefix_len;
        let mut address = None;
        let mut local = None;
        let mut label = String::new();

        for attr in &msg.attributes {
            match attr {
                AddressAttribute::Address(ip) => address = Some(*ip),
                AddressAttribute::Local(ip) => local = Some(*ip),
                AddressAttribute::Label(l) => label = l.clone(),
                _ => {}
            }
        }

        let Some(ip) = local.or(address) else {
            return Ok(None);
        };
        Ok(Some(Addr {
            ipnet: IpNetwork::new(ip, prefix)?,
            label,
            scope: msg.header.scope,
            link_index: msg.header.index,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_from_message_prefers_local() {
        let mut msg = AddressMessage::default();
        msg.header.family = AddressFamily::Inet;
        msg.header.prefix_len = 24;
        msg.header.index = 4;
        msg.attributes = vec![
            AddressAttribute::Address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9))),
            AddressAttribute::Local(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
            AddressAttribute::Label("eth0".to_string()),
        ];

        let addr = Addr::from_message(&msg).unwrap().unwrap();
        assert_eq!(addr.ipnet, "10.0.0.2/24".parse::<IpNetwork>().unwrap());
        assert_eq!(addr.label, "eth0");
        assert_eq!(addr.link_index, 4);
    }

    #[test]
    fn test_from_message_without_address() {
        let msg = AddressMessage::default();
        assert!(Addr::from_message(&msg).unwrap().is_none());
    }
}
