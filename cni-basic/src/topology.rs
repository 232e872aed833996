use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use libipam::AddressPool;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::netops::NetOps;
use crate::types::{LinkHandle, NamespaceRef};

/// Result of [`TopologyBuilder::ensure_bridge`].
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    pub link: LinkHandle,
    /// False when the bridge already existed.
    pub created: bool,
}

/// The two ends of a container's veth pair once wired up.
#[derive(Debug, Clone)]
pub struct AttachedPair {
    pub container: LinkHandle,
    pub host: LinkHandle,
}

/// What DEL needs to find and remove a container's wiring.
#[derive(Debug, Clone)]
pub struct Teardown<'a> {
    pub bridge: &'a str,
    pub ifname: &'a str,
    pub peer: &'a str,
    pub netns: Option<&'a NamespaceRef>,
    pub owner: &'a str,
}

/// Host-side veth name for a container interface: `veth` followed by 11 hex
/// digits of a SHA-256 over `container_id/ifname`, 15 bytes in total.
pub fn peer_name(container_id: &str, ifname: &str) -> String {
    format!("veth{}", &digest(container_id, ifname)[..11])
}

/// Name the container end carries in the host namespace until it is moved.
/// Avoids clashing with host interfaces that share the container's ifname.
pub fn staging_name(container_id: &str, ifname: &str) -> String {
    format!("tmp{}", &digest(container_id, ifname)[..12])
}

fn digest(container_id: &str, ifname: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(container_id.as_bytes());
    hasher.update(b"/");
    hasher.update(ifname.as_bytes());
    hex::encode(hasher.finalize())
}

/// Drives the kernel into the bridge/veth layout. Steps are not rolled back
/// here; callers that need atomicity keep their own undo list.
pub struct TopologyBuilder<'a, N: NetOps> {
    ops: &'a N,
}

impl<'a, N: NetOps> TopologyBuilder<'a, N> {
    pub fn new(ops: &'a N) -> Self {
        Self { ops }
    }

    pub async fn host_link(&self, name: &str) -> Result<Option<LinkHandle>, AppError> {
        self.ops
            .find_link(name, None)
            .await
            .map_err(AppError::topology(format!("look up {name}")))
    }

    /// Returns the named bridge, creating and activating it if absent. An
    /// existing bridge is returned as is.
    pub async fn ensure_bridge(&self, name: &str, mtu: u32) -> Result<BridgeHandle, AppError> {
        if let Some(link) = self.host_link(name).await? {
            if !link.is_bridge() {
                return Err(AppError::Topology(format!(
                    "{name} already exists but is not a bridge"
                )));
            }
            debug!("reusing bridge {name} (index {})", link.index);
            return Ok(BridgeHandle {
                link,
                created: false,
            });
        }

        let link = self
            .ops
            .create_bridge(name, mtu)
            .await
            .map_err(AppError::topology(format!("create bridge {name}")))?;
        if let Err(e) = self.ops.set_up(&link).await {
            // A bridge left down would be reused as is by later invocations.
            if let Err(del) = self.ops.delete_link(&link).await {
                warn!("failed to remove inactive bridge {name}: {del:#}");
            }
            return Err(AppError::topology(format!("activate bridge {name}"))(e));
        }
        info!("created bridge {name} (index {}, mtu {mtu})", link.index);
        Ok(BridgeHandle {
            link,
            created: true,
        })
    }

    /// Wires a container into `bridge`: create the veth pair, move one end
    /// into `netns` as `ifname`, enslave the other end, bring both up. Stops
    /// at the first failing step.
    pub async fn attach_container(
        &self,
        bridge: &LinkHandle,
        staging: &str,
        peer: &str,
        ifname: &str,
        netns: &NamespaceRef,
        mtu: u32,
    ) -> Result<AttachedPair, AppError> {
        let (container_end, host) = self
            .ops
            .create_veth(staging, peer, mtu)
            .await
            .map_err(AppError::topology(format!("create veth pair {staging}/{peer}")))?;

        let container = self
            .ops
            .move_to_netns(&container_end, netns, ifname)
            .await
            .map_err(AppError::topology(format!("move {staging} into {netns}")))?;

        self.ops
            .set_master(&host, bridge)
            .await
            .map_err(AppError::topology(format!("attach {peer} to {}", bridge.name)))?;

        self.ops
            .set_up(&container)
            .await
            .map_err(AppError::topology(format!("bring up {ifname} in {netns}")))?;
        self.ops
            .set_up(&host)
            .await
            .map_err(AppError::topology(format!("bring up {peer}")))?;

        info!(
            "attached {ifname}@{netns} to {} via {peer}",
            bridge.name
        );
        Ok(AttachedPair { container, host })
    }

    /// Puts the gateway address on the bridge unless it is already there.
    /// Any other address of the same subnet on the bridge is a conflict.
    pub async fn assign_gateway_address(
        &self,
        bridge: &LinkHandle,
        gateway: Ipv4Addr,
        prefix: u8,
    ) -> Result<(), AppError> {
        let wanted = Ipv4Network::new(gateway, prefix)
            .map_err(|e| AppError::InvalidConfig(format!("gateway {gateway}/{prefix}: {e}")))?;
        let existing = self
            .ops
            .addresses(bridge)
            .await
            .map_err(AppError::topology(format!("list addresses of {}", bridge.name)))?;

        if existing.contains(&wanted) {
            debug!("{} already carries {wanted}", bridge.name);
            return Ok(());
        }
        if let Some(other) = existing
            .iter()
            .find(|a| a.contains(gateway) || wanted.contains(a.ip()))
        {
            return Err(AppError::Topology(format!(
                "{} has address {other}, which conflicts with gateway {wanted}",
                bridge.name
            )));
        }

        self.ops
            .add_address(bridge, wanted)
            .await
            .map_err(AppError::topology(format!("add {wanted} to {}", bridge.name)))?;
        info!("assigned gateway {wanted} to {}", bridge.name);
        Ok(())
    }

    pub async fn assign_container_address(
        &self,
        container: &LinkHandle,
        address: Ipv4Addr,
        prefix: u8,
    ) -> Result<(), AppError> {
        let net = Ipv4Network::new(address, prefix)
            .map_err(|e| AppError::InvalidConfig(format!("address {address}/{prefix}: {e}")))?;
        self.ops
            .add_address(container, net)
            .await
            .map_err(AppError::topology(format!("add {net} to {}", container.name)))?;
        debug!("assigned {net} to {}", container.name);
        Ok(())
    }

    pub async fn add_default_route(
        &self,
        container: &LinkHandle,
        gateway: Ipv4Addr,
    ) -> Result<(), AppError> {
        self.ops
            .add_default_route(container, gateway)
            .await
            .map_err(AppError::topology(format!(
                "add default route via {gateway} on {}",
                container.name
            )))
    }

    /// Removes a host link if it exists. Deleting either end of a veth
    /// pair removes both.
    pub async fn remove_host_link(&self, name: &str) -> Result<bool, AppError> {
        let Some(link) = self.host_link(name).await? else {
            return Ok(false);
        };
        self.ops
            .delete_link(&link)
            .await
            .map_err(AppError::topology(format!("delete {name}")))?;
        Ok(true)
    }

    /// Deletes the bridge if nothing is attached to it any more.
    pub async fn remove_bridge_if_unused(&self, name: &str) -> Result<bool, AppError> {
        let Some(bridge) = self.host_link(name).await? else {
            return Ok(false);
        };
        if !bridge.is_bridge() {
            return Ok(false);
        }
        let ports = self
            .ops
            .bridge_ports(&bridge)
            .await
            .map_err(AppError::topology(format!("list ports of {name}")))?;
        if !ports.is_empty() {
            debug!("keeping bridge {name}, still attached: {ports:?}");
            return Ok(false);
        }
        self.ops
            .delete_link(&bridge)
            .await
            .map_err(AppError::topology(format!("delete bridge {name}")))?;
        info!("removed unused bridge {name}");
        Ok(true)
    }

    /// Reverses an ADD. Missing pieces are skipped, so repeating it is safe.
    ///
    /// The address is released from `pool` by owner; allocations made
    /// before owners were recorded are found through the addresses still
    /// configured on the container interface.
    pub async fn teardown(&self, pool: &AddressPool, req: &Teardown<'_>) -> Result<(), AppError> {
        let mut configured = Vec::new();

        if let Some(netns) = req.netns.filter(|ns| self.ops.netns_exists(ns)) {
            let found = self
                .ops
                .find_link(req.ifname, Some(netns))
                .await
                .map_err(AppError::topology(format!("look up {} in {netns}", req.ifname)))?;
            if let Some(link) = found {
                configured = self
                    .ops
                    .addresses(&link)
                    .await
                    .map_err(AppError::topology(format!("list addresses of {}", req.ifname)))?;
                self.ops
                    .delete_link(&link)
                    .await
                    .map_err(AppError::topology(format!("delete {} in {netns}", req.ifname)))?;
                info!("removed {} from {netns}", req.ifname);
            }
        }

        if self.remove_host_link(req.peer).await? {
            info!("removed host peer {}", req.peer);
        }

        match pool.release_for(req.owner)? {
            Some(address) => info!("released {address} held by {}", req.owner),
            None => {
                let subnet = pool.range().subnet();
                for net in configured
                    .iter()
                    .filter(|n| n.prefix() == subnet.prefix() && subnet.contains(n.ip()))
                {
                    if pool.is_allocated(net.ip()) {
                        pool.release(net.ip())?;
                        info!("released {} found on {}", net.ip(), req.ifname);
                    }
                }
            }
        }

        self.remove_bridge_if_unused(req.bridge).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNet;

    fn netns() -> NamespaceRef {
        NamespaceRef::new("/var/run/netns/c1")
    }

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_peer_name() {
        let a = peer_name("0123456789abcdef", "eth0");
        assert_eq!(a.len(), 15);
        assert!(a.starts_with("veth"));
        assert_eq!(a, peer_name("0123456789abcdef", "eth0"));
        assert_ne!(a, peer_name("0123456789abcdef", "eth1"));
        assert_ne!(a, peer_name("0123456789abcdee", "eth0"));
        assert_eq!(staging_name("c1", "eth0").len(), 15);
    }

    #[tokio::test]
    async fn test_ensure_bridge_is_idempotent() {
        let fake = FakeNet::default();
        let topo = TopologyBuilder::new(&fake);

        let first = topo.ensure_bridge("cni0", 1500).await.unwrap();
        let second = topo.ensure_bridge("cni0", 9000).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.link.index, second.link.index);
        assert_eq!(fake.count("create_bridge"), 1);
        assert!(fake.is_up("cni0", None));
        assert_eq!(fake.mtu("cni0", None), Some(1500));
    }

    #[tokio::test]
    async fn test_ensure_bridge_rejects_non_bridge() {
        let fake = FakeNet::default();
        fake.add_link("cni0", "dummy");
        let err = TopologyBuilder::new(&fake)
            .ensure_bridge("cni0", 1500)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Topology(_)));
    }

    #[tokio::test]
    async fn test_ensure_bridge_removes_bridge_it_could_not_activate() {
        let fake = FakeNet::default();
        fake.fail_on("set_up");
        let err = TopologyBuilder::new(&fake)
            .ensure_bridge("cni0", 1500)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 112);
        assert!(!fake.exists("cni0", None));
    }

    #[tokio::test]
    async fn test_attach_runs_steps_in_order() {
        let fake = FakeNet::default();
        fake.add_namespace(&netns());
        let topo = TopologyBuilder::new(&fake);
        let bridge = topo.ensure_bridge("cni0", 1500).await.unwrap().link;
        fake.clear_calls();

        let pair = topo
            .attach_container(&bridge, "tmp000", "veth000", "eth0", &netns(), 1500)
            .await
            .unwrap();

        assert_eq!(
            fake.calls(),
            vec![
                "create_veth tmp000/veth000",
                "move_to_netns tmp000 -> eth0",
                "set_master veth000 cni0",
                "set_up eth0",
                "set_up veth000",
            ]
        );
        assert_eq!(pair.container.name, "eth0");
        assert_eq!(pair.container.netns, Some(netns()));
        assert!(fake.is_up("eth0", Some(&netns())));
        assert!(fake.is_up("veth000", None));
        assert_eq!(fake.ports("cni0"), vec!["veth000".to_string()]);
    }

    #[tokio::test]
    async fn test_attach_stops_at_first_failure() {
        let fake = FakeNet::default();
        fake.add_namespace(&netns());
        let topo = TopologyBuilder::new(&fake);
        let bridge = topo.ensure_bridge("cni0", 1500).await.unwrap().link;
        fake.clear_calls();
        fake.fail_on("move_to_netns");

        let err = topo
            .attach_container(&bridge, "tmp000", "veth000", "eth0", &netns(), 1500)
            .await
            .unwrap_err();

        assert_eq!(err.code(), 112);
        assert_eq!(fake.count("set_master"), 0);
        assert_eq!(fake.count("set_up"), 0);
        assert!(fake.exists("veth000", None));
    }

    #[tokio::test]
    async fn test_gateway_address_is_idempotent() {
        let fake = FakeNet::default();
        let topo = TopologyBuilder::new(&fake);
        let bridge = topo.ensure_bridge("cni0", 1500).await.unwrap().link;
        let gw = Ipv4Addr::new(10, 0, 0, 1);

        topo.assign_gateway_address(&bridge, gw, 24).await.unwrap();
        topo.assign_gateway_address(&bridge, gw, 24).await.unwrap();

        assert_eq!(fake.count("add_address"), 1);
        assert_eq!(fake.addresses_of("cni0", None), vec![net("10.0.0.1/24")]);
    }

    #[tokio::test]
    async fn test_gateway_address_conflict() {
        let fake = FakeNet::default();
        let topo = TopologyBuilder::new(&fake);
        let bridge = topo.ensure_bridge("cni0", 1500).await.unwrap().link;
        topo.assign_gateway_address(&bridge, Ipv4Addr::new(10, 0, 0, 254), 24)
            .await
            .unwrap();

        let err = topo
            .assign_gateway_address(&bridge, Ipv4Addr::new(10, 0, 0, 1), 24)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Topology(_)));

        // Unrelated subnets may share the bridge.
        topo.assign_gateway_address(&bridge, Ipv4Addr::new(172, 16, 0, 1), 16)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_teardown_releases_and_removes_empty_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let pool = AddressPool::new("mynet", "10.0.0.0/24", dir.path()).unwrap();
        let fake = FakeNet::default();
        fake.add_namespace(&netns());
        let topo = TopologyBuilder::new(&fake);

        let bridge = topo.ensure_bridge("cni0", 1500).await.unwrap().link;
        let pair = topo
            .attach_container(&bridge, "tmp000", "veth000", "eth0", &netns(), 1500)
            .await
            .unwrap();
        let address = pool.allocate_for("c1/eth0").unwrap();
        topo.assign_container_address(&pair.container, address, 24)
            .await
            .unwrap();

        let ns = netns();
        let req = Teardown {
            bridge: "cni0",
            ifname: "eth0",
            peer: "veth000",
            netns: Some(&ns),
            owner: "c1/eth0",
        };
        topo.teardown(&pool, &req).await.unwrap();

        assert!(!pool.is_allocated(address));
        assert!(!fake.exists("eth0", Some(&netns())));
        assert!(!fake.exists("veth000", None));
        assert!(!fake.exists("cni0", None));

        // Nothing left to do the second time around.
        topo.teardown(&pool, &req).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_keeps_shared_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let pool = AddressPool::new("mynet", "10.0.0.0/24", dir.path()).unwrap();
        let other = NamespaceRef::new("/var/run/netns/c2");
        let fake = FakeNet::default();
        fake.add_namespace(&netns());
        fake.add_namespace(&other);
        let topo = TopologyBuilder::new(&fake);

        let bridge = topo.ensure_bridge("cni0", 1500).await.unwrap().link;
        topo.attach_container(&bridge, "tmp1", "veth1", "eth0", &netns(), 1500)
            .await
            .unwrap();
        topo.attach_container(&bridge, "tmp2", "veth2", "eth0", &other, 1500)
            .await
            .unwrap();

        let ns = netns();
        let req = Teardown {
            bridge: "cni0",
            ifname: "eth0",
            peer: "veth1",
            netns: Some(&ns),
            owner: "c1/eth0",
        };
        topo.teardown(&pool, &req).await.unwrap();

        assert!(fake.exists("cni0", None));
        assert_eq!(fake.ports("cni0"), vec!["veth2".to_string()]);
    }

    #[tokio::test]
    async fn test_teardown_falls_back_to_configured_address() {
        let dir = tempfile::tempdir().unwrap();
        let pool = AddressPool::new("mynet", "10.0.0.0/24", dir.path()).unwrap();
        let fake = FakeNet::default();
        fake.add_namespace(&netns());
        let topo = TopologyBuilder::new(&fake);

        let bridge = topo.ensure_bridge("cni0", 1500).await.unwrap().link;
        let pair = topo
            .attach_container(&bridge, "tmp000", "veth000", "eth0", &netns(), 1500)
            .await
            .unwrap();
        let address = pool.allocate().unwrap();
        topo.assign_container_address(&pair.container, address, 24)
            .await
            .unwrap();

        let ns = netns();
        let req = Teardown {
            bridge: "cni0",
            ifname: "eth0",
            peer: "veth000",
            netns: Some(&ns),
            owner: "c1/eth0",
        };
        topo.teardown(&pool, &req).await.unwrap();
        assert_eq!(pool.allocated_count(), 0);
    }
}
