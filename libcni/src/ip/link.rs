use std::net::IpAddr;
use std::os::fd::RawFd;

use anyhow::anyhow;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use log::debug;
use macaddr::MacAddr6;
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkInfo, LinkMessage};
use nix::errno::Errno;
use rtnetlink::{Handle, RouteMessageBuilder, new_connection};

/// Establishes an rtnetlink connection in the calling thread's namespace.
pub fn get_handle() -> anyhow::Result<Handle> {
    let (connection, handle, _) =
        new_connection().map_err(|e| anyhow!("Failed to create rtnetlink connection: {}", e))?;
    tokio::spawn(connection);
    Ok(handle)
}

/// The kernel answers a lookup of an unknown link name with `-ENODEV`.
fn is_not_found(e: &rtnetlink::Error) -> bool {
    matches!(
        e,
        rtnetlink::Error::NetlinkError(msg) if msg.raw_code() == -(Errno::ENODEV as i32)
    )
}

/// Looks a link up by name.
///
/// # Arguments
/// * `name` - The name of the network interface.
///
/// # Returns
/// * `Ok(Some(LinkMessage))` if found.
/// * `Ok(None)` if the interface does not exist.
/// * `Err(anyhow::Error)` if the lookup itself fails.
pub async fn find_link(name: &str) -> anyhow::Result<Option<LinkMessage>> {
    let handle = get_handle()?;
    let mut links = handle.link().get().match_name(name.to_string()).execute();

    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(anyhow!("Failed to look up link {}: {}", name, e)),
    }
}

/// Retrieves a link by name.
///
/// # Arguments
/// * `name` - The name of the network interface.
///
/// # Returns
/// * `Ok(LinkMessage)` if found.
/// * `Err(anyhow::Error)` if the interface does not exist or the lookup fails.
pub async fn link_by_name(name: &str) -> anyhow::Result<LinkMessage> {
    find_link(name)
        .await?
        .ok_or_else(|| anyhow!("Link with name {} not found", name))
}

/// Lists every link whose controller (bridge master) is `index`.
///
/// # Arguments
/// * `index` - The index of the controlling link, normally a bridge.
///
/// # Returns
/// * `Ok(Vec<LinkMessage>)` with the ports, possibly empty.
/// * `Err(anyhow::Error)` if the link dump fails.
pub async fn links_with_controller(index: u32) -> anyhow::Result<Vec<LinkMessage>> {
    let handle = get_handle()?;
    let mut links = handle.link().get().execute();

    let mut ports = Vec::new();
    while let Some(link) = links.try_next().await? {
        if link_controller(&link) == Some(index) {
            ports.push(link);
        }
    }
    Ok(ports)
}

/// Adds a network link.
///
/// # Arguments
/// * `msg` - The link message describing the new link.
///
/// # Returns
/// * `Ok(())` on success.
/// * `Err(anyhow::Error)` on failure, including when the name is taken.
pub async fn add_link(msg: LinkMessage) -> anyhow::Result<()> {
    let handle = get_handle()?;
    handle.link().add(msg).execute().await?;
    Ok(())
}

/// Applies a link configuration change.
///
/// # Arguments
/// * `msg` - The link message carrying the index and the changed fields.
///
/// # Returns
/// * `Ok(())` on success.
/// * `Err(anyhow::Error)` on failure.
pub async fn set_link(msg: LinkMessage) -> anyhow::Result<()> {
    let handle = get_handle()?;
    handle.link().set(msg).execute().await?;
    Ok(())
}

/// Deletes a link. Deleting one end of a veth pair removes both.
///
/// # Arguments
/// * `link` - The link to delete; only its index is used.
///
/// # Returns
/// * `Ok(())` on success.
/// * `Err(anyhow::Error)` on failure.
pub async fn del_link(link: &LinkMessage) -> anyhow::Result<()> {
    let handle = get_handle()?;
    handle.link().del(link.header.index).execute().await?;
    Ok(())
}

/// Brings a link administratively up.
///
/// # Arguments
/// * `link` - The link to activate.
///
/// # Returns
/// * `Ok(())` on success.
/// * `Err(anyhow::Error)` on failure.
pub async fn link_set_up(link: &LinkMessage) -> anyhow::Result<()> {
    let mut msg = LinkMessage::default();

    msg.header.index = link.header.index;
    msg.header.flags |= LinkFlags::Up;
    msg.header.change_mask |= LinkFlags::Up;

    set_link(msg)
        .await
        .map_err(|e| anyhow!("Failed to set up: {}", e))
}

/// Enslaves `link` to `master` (normally a bridge).
pub async fn link_set_master(link: &LinkMessage, master: &LinkMessage) -> anyhow::Result<()> {
    let mut msg = LinkMessage::default();
    msg.header.index = link.header.index;
    msg.attributes
        .push(LinkAttribute::Controller(master.header.index));

    set_link(msg)
        .await
        .map_err(|e| anyhow!("Failed to set master: {}", e))
}

/// Renames a link. The kernel refuses this while the link is up.
pub async fn link_set_name(link: &LinkMessage, name: &str) -> anyhow::Result<()> {
    let mut msg = LinkMessage::default();
    msg.header.index = link.header.index;
    msg.attributes.push(LinkAttribute::IfName(name.to_string()));

    set_link(msg)
        .await
        .map_err(|e| anyhow!("Failed to rename link to {}: {}", name, e))
}

/// Where a link should be moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsTarget {
    /// The namespace of a process already living in it.
    Pid(u32),
    /// An open namespace file; must stay open until the call returns.
    Fd(RawFd),
}

/// Moves `link` into another network namespace. The link disappears from
/// the caller's namespace and keeps its name in the target.
pub async fn link_set_netns(link: &LinkMessage, target: NsTarget) -> anyhow::Result<()> {
    let mut msg = LinkMessage::default();
    msg.header.index = link.header.index;
    msg.attributes.push(match target {
        NsTarget::Pid(pid) => LinkAttribute::NetNsPid(pid),
        NsTarget::Fd(fd) => LinkAttribute::NetNsFd(fd),
    });

    set_link(msg)
        .await
        .map_err(|e| anyhow!("Failed to move link to netns {:?}: {}", target, e))
}

/// Adds a route in the calling thread's namespace.
///
/// # Arguments
/// * `dst` - The destination network, `0.0.0.0/0` for a default route.
/// * `gw` - The next hop.
///
/// # Returns
/// * `Ok(())` on success.
/// * `Err(anyhow::Error)` on failure.
pub async fn route_add(dst: IpNetwork, gw: IpAddr) -> anyhow::Result<()> {
    let handle = get_handle()?;

    let builder = RouteMessageBuilder::<IpAddr>::new()
        .destination_prefix(dst.ip(), dst.prefix())?
        .gateway(gw)?;
    debug!("route_builder:{:?}", builder);
    handle.route().add(builder.build()).execute().await?;

    Ok(())
}

/// Extracts the hardware address of a link, if it is a 6-byte MAC.
pub fn get_mac_address(attributes: &[LinkAttribute]) -> Option<MacAddr6> {
    attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(mac) if mac.len() == 6 => {
            Some(MacAddr6::new(mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]))
        }
        _ => None,
    })
}

pub fn link_name(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

pub fn link_controller(link: &LinkMessage) -> Option<u32> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Controller(index) => Some(*index),
        _ => None,
    })
}

/// The `IFLA_INFO_KIND` of a link, e.g. `bridge` or `veth`.
pub fn link_kind(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::LinkInfo(infos) => infos.iter().find_map(|info| match info {
            LinkInfo::Kind(kind) => Some(kind.to_string()),
            _ => None,
        }),
        _ => None,
    })
}
