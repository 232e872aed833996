use std::net::{IpAddr, Ipv4Addr};

use anyhow::anyhow;
use ipnetwork::{IpNetwork, Ipv4Network};
use libcni::{
    ip::{
        addr, link,
        link::NsTarget,
        veth::{self, Veth},
    },
    ns::netns::{self, Netns},
};
use log::{debug, info};
use netlink_packet_route::{AddressFamily, link::LinkMessage};

use crate::types::{Bridge, LinkHandle, NamespaceRef};

/// Kernel link operations the plugin needs. Handles carry the namespace
/// they live in; `None` means the host namespace.
#[allow(async_fn_in_trait)]
pub trait NetOps {
    async fn find_link(
        &self,
        name: &str,
        netns: Option<&NamespaceRef>,
    ) -> anyhow::Result<Option<LinkHandle>>;

    /// Creates a bridge, left administratively down.
    async fn create_bridge(&self, name: &str, mtu: u32) -> anyhow::Result<LinkHandle>;

    /// Creates a veth pair in the host namespace. Returns `(name, peer)`.
    async fn create_veth(
        &self,
        name: &str,
        peer: &str,
        mtu: u32,
    ) -> anyhow::Result<(LinkHandle, LinkHandle)>;

    /// Moves a host link into `netns` and renames it to `new_name` there.
    async fn move_to_netns(
        &self,
        link: &LinkHandle,
        netns: &NamespaceRef,
        new_name: &str,
    ) -> anyhow::Result<LinkHandle>;

    async fn set_master(&self, port: &LinkHandle, bridge: &LinkHandle) -> anyhow::Result<()>;

    async fn set_up(&self, link: &LinkHandle) -> anyhow::Result<()>;

    async fn addresses(&self, link: &LinkHandle) -> anyhow::Result<Vec<Ipv4Network>>;

    async fn add_address(&self, link: &LinkHandle, address: Ipv4Network) -> anyhow::Result<()>;

    async fn add_default_route(&self, link: &LinkHandle, gateway: Ipv4Addr) -> anyhow::Result<()>;

    async fn delete_link(&self, link: &LinkHandle) -> anyhow::Result<()>;

    /// Names of the links enslaved to `bridge`.
    async fn bridge_ports(&self, bridge: &LinkHandle) -> anyhow::Result<Vec<String>>;

    fn netns_exists(&self, netns: &NamespaceRef) -> bool;
}

/// [`NetOps`] over rtnetlink. Container-side calls switch the thread into
/// the target namespace for their duration, so this must run on a
/// current-thread runtime.
pub struct NetlinkOps {
    host: Netns,
}

impl NetlinkOps {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self { host: Netns::get()? })
    }

    fn open(&self, netns: &NamespaceRef) -> anyhow::Result<Netns> {
        Netns::get_from_path(netns.path())?
            .ok_or_else(|| anyhow!("network namespace {} does not exist", netns))
    }

    async fn in_netns<T, F>(&self, netns: Option<&NamespaceRef>, exec: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match netns {
            None => exec.await,
            Some(ns) => {
                let target = self.open(ns)?;
                netns::exec_netns(&self.host, &target, exec).await
            }
        }
    }
}

fn message(link: &LinkHandle) -> LinkMessage {
    let mut msg = LinkMessage::default();
    msg.header.index = link.index;
    msg
}

fn handle(msg: &LinkMessage, netns: Option<&NamespaceRef>) -> LinkHandle {
    LinkHandle {
        name: link::link_name(msg).unwrap_or_default(),
        index: msg.header.index,
        mac: link::get_mac_address(&msg.attributes),
        kind: link::link_kind(msg),
        controller: link::link_controller(msg),
        netns: netns.cloned(),
    }
}

impl NetOps for NetlinkOps {
    async fn find_link(
        &self,
        name: &str,
        netns: Option<&NamespaceRef>,
    ) -> anyhow::Result<Option<LinkHandle>> {
        let found = self.in_netns(netns, link::find_link(name)).await?;
        Ok(found.map(|msg| handle(&msg, netns)))
    }

    async fn create_bridge(&self, name: &str, mtu: u32) -> anyhow::Result<LinkHandle> {
        let bridge = Bridge::new(name).mtu(mtu);
        if let Err(e) = link::add_link(bridge.into_builder().build()).await {
            // Another invocation may have won the race.
            if !e.to_string().contains("File exists") {
                return Err(anyhow!("Failed to create bridge {}: {}", name, e));
            }
            debug!("bridge {name} appeared concurrently");
        }
        let msg = link::link_by_name(name).await?;
        Ok(handle(&msg, None))
    }

    async fn create_veth(
        &self,
        name: &str,
        peer: &str,
        mtu: u32,
    ) -> anyhow::Result<(LinkHandle, LinkHandle)> {
        let (end, peer_end) = veth::create_veth_pair(Veth::new(name, peer).mtu(mtu)).await?;
        Ok((handle(&end, None), handle(&peer_end, None)))
    }

    async fn move_to_netns(
        &self,
        link: &LinkHandle,
        netns: &NamespaceRef,
        new_name: &str,
    ) -> anyhow::Result<LinkHandle> {
        let msg = message(link);
        match netns.pid() {
            Some(pid) => link::link_set_netns(&msg, NsTarget::Pid(pid)).await?,
            None => {
                let target = self.open(netns)?;
                link::link_set_netns(&msg, NsTarget::Fd(target.as_raw_fd())).await?;
            }
        }
        info!("moved {} into {}", link.name, netns);

        let moved = self
            .in_netns(Some(netns), async {
                let moved = link::link_by_name(&link.name).await?;
                if link.name != new_name {
                    link::link_set_name(&moved, new_name).await?;
                }
                link::link_by_name(new_name).await
            })
            .await?;
        Ok(handle(&moved, Some(netns)))
    }

    async fn set_master(&self, port: &LinkHandle, bridge: &LinkHandle) -> anyhow::Result<()> {
        link::link_set_master(&message(port), &message(bridge)).await
    }

    async fn set_up(&self, link: &LinkHandle) -> anyhow::Result<()> {
        self.in_netns(link.netns.as_ref(), link::link_set_up(&message(link)))
            .await
    }

    async fn addresses(&self, link: &LinkHandle) -> anyhow::Result<Vec<Ipv4Network>> {
        let addrs = self
            .in_netns(
                link.netns.as_ref(),
                addr::addr_list(link.index, AddressFamily::Inet),
            )
            .await?;
        Ok(addrs
            .into_iter()
            .filter_map(|a| match a.ipnet {
                IpNetwork::V4(net) => Some(net),
                IpNetwork::V6(_) => None,
            })
            .collect())
    }

    async fn add_address(&self, link: &LinkHandle, address: Ipv4Network) -> anyhow::Result<()> {
        self.in_netns(
            link.netns.as_ref(),
            addr::addr_add(link.index, IpAddr::V4(address.ip()), address.prefix()),
        )
        .await
    }

    async fn add_default_route(&self, link: &LinkHandle, gateway: Ipv4Addr) -> anyhow::Result<()> {
        let default = IpNetwork::V4(Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)?);
        self.in_netns(
            link.netns.as_ref(),
            link::route_add(default, IpAddr::V4(gateway)),
        )
        .await
    }

    async fn delete_link(&self, link: &LinkHandle) -> anyhow::Result<()> {
        self.in_netns(link.netns.as_ref(), link::del_link(&message(link)))
            .await
    }

    async fn bridge_ports(&self, bridge: &LinkHandle) -> anyhow::Result<Vec<String>> {
        let ports = link::links_with_controller(bridge.index).await?;
        Ok(ports.iter().filter_map(link::link_name).collect())
    }

    fn netns_exists(&self, netns: &NamespaceRef) -> bool {
        matches!(Netns::get_from_path(netns.path()), Ok(Some(_)))
    }
}
