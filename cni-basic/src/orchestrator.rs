use std::net::{IpAddr, Ipv4Addr};

use cni_plugin::{
    Command,
    error::CniError,
    macaddr::MacAddr,
    reply::{Interface, Ip, Route, SuccessReply, VersionReply},
};
use ipnetwork::{IpNetwork, Ipv4Network};
use libipam::{AddressPool, PoolGuard};
use log::{debug, error, info, warn};
use semver::Version;

use crate::config::{self, load_netconf};
use crate::env::{InvocationContext, command_name};
use crate::error::AppError;
use crate::netops::NetOps;
use crate::topology::{Teardown, TopologyBuilder, peer_name, staging_name};
use crate::types::{LinkHandle, NamespaceRef, NetConf};

/// Successful outcome of one invocation.
#[derive(Debug)]
pub enum Reply {
    Success(SuccessReply),
    Version(VersionReply),
}

/// A failed invocation and the protocol version to report it under.
#[derive(Debug)]
pub struct Failure {
    pub cni_version: Version,
    pub error: AppError,
}

/// Work to reverse when ADD fails part way.
#[derive(Debug)]
enum Undo {
    Bridge(String),
    HostPeer(String),
}

/// Routes a command to its handler. Each call runs in isolation; all
/// state shared between invocations lives in the kernel and the pool file.
pub struct Orchestrator<N: NetOps> {
    ops: N,
}

impl<N: NetOps> Orchestrator<N> {
    pub fn new(ops: N) -> Self {
        Self { ops }
    }

    pub fn ops(&self) -> &N {
        &self.ops
    }

    pub async fn dispatch(&self, ctx: &InvocationContext, stdin: &[u8]) -> Result<Reply, Failure> {
        if let Command::Version = ctx.command {
            return Ok(Reply::Version(version_reply(stdin)));
        }

        let fail = |error: AppError| Failure {
            cni_version: config::peek_version(stdin),
            error,
        };
        ctx.validate().map_err(fail)?;
        let conf = load_netconf(stdin).map_err(fail)?;
        info!(
            "{} network={} container={} ifname={}",
            command_name(&ctx.command),
            conf.name,
            ctx.container_id,
            ctx.ifname
        );
        if let (Some(namespace), Some(pod)) =
            (ctx.arg("K8S_POD_NAMESPACE"), ctx.arg("K8S_POD_NAME"))
        {
            debug!("container {} belongs to pod {namespace}/{pod}", ctx.container_id);
        }

        let result = match ctx.command {
            Command::Add => self.cmd_add(&conf, ctx).await.map(Reply::Success),
            Command::Del => self.cmd_del(&conf, ctx).await.map(Reply::Success),
            Command::Check => self.cmd_check(&conf, ctx).await.map(Reply::Success),
            Command::Version => Ok(Reply::Version(version_reply(stdin))),
        };
        result.map_err(|error| Failure {
            cni_version: conf.cni_version.clone(),
            error,
        })
    }

    async fn cmd_add(&self, conf: &NetConf, ctx: &InvocationContext) -> Result<SuccessReply, AppError> {
        let netns = required_netns(ctx)?;
        if !self.ops.netns_exists(netns) {
            return Err(AppError::UnknownContainer(format!(
                "network namespace {netns} does not exist"
            )));
        }

        let pool = open_pool(conf)?;
        let session = pool.lock()?;
        let mut undo = Vec::new();

        let reply = match self.add_steps(conf, ctx, netns, &session, &mut undo).await {
            Ok(reply) => reply,
            Err(e) => {
                self.rollback(undo).await;
                return Err(e);
            }
        };
        if let Err(e) = session.commit() {
            self.rollback(undo).await;
            return Err(e.into());
        }
        Ok(reply)
    }

    async fn add_steps(
        &self,
        conf: &NetConf,
        ctx: &InvocationContext,
        netns: &NamespaceRef,
        pool: &PoolGuard<'_>,
        undo: &mut Vec<Undo>,
    ) -> Result<SuccessReply, AppError> {
        let topology = TopologyBuilder::new(&self.ops);
        let prefix = conf.prefix();

        let bridge = topology.ensure_bridge(&conf.bridge, conf.mtu).await?;
        if bridge.created {
            undo.push(Undo::Bridge(conf.bridge.clone()));
        }

        let peer = peer_name(&ctx.container_id, &ctx.ifname);
        if topology.host_link(&peer).await?.is_some() {
            return Err(AppError::Topology(format!(
                "{peer} already exists, {} looks attached already",
                ctx.owner()
            )));
        }
        undo.push(Undo::HostPeer(peer.clone()));
        let staging = staging_name(&ctx.container_id, &ctx.ifname);
        let pair = topology
            .attach_container(&bridge.link, &staging, &peer, &ctx.ifname, netns, conf.mtu)
            .await?;

        topology
            .assign_gateway_address(&bridge.link, conf.gateway, prefix)
            .await?;

        let address = pool.allocate_for(&ctx.owner())?;
        info!("allocated {address}/{prefix} to {}", ctx.owner());
        topology
            .assign_container_address(&pair.container, address, prefix)
            .await?;

        if conf.is_default_gw {
            topology.add_default_route(&pair.container, conf.gateway).await?;
        }

        success_reply(conf, &bridge.link, &pair.container, netns, address)
    }

    /// Best effort: every step is attempted even if an earlier one fails.
    async fn rollback(&self, undo: Vec<Undo>) {
        let topology = TopologyBuilder::new(&self.ops);
        for step in undo.into_iter().rev() {
            debug!("rolling back {step:?}");
            let result = match &step {
                Undo::HostPeer(name) => topology.remove_host_link(name).await.map(|_| ()),
                Undo::Bridge(name) => topology.remove_bridge_if_unused(name).await.map(|_| ()),
            };
            if let Err(e) = result {
                warn!("rollback of {step:?} failed: {e}");
            }
        }
    }

    async fn cmd_del(&self, conf: &NetConf, ctx: &InvocationContext) -> Result<SuccessReply, AppError> {
        let pool = open_pool(conf)?;
        let session = pool.lock()?;
        let peer = peer_name(&ctx.container_id, &ctx.ifname);
        let owner = ctx.owner();

        let req = Teardown {
            bridge: &conf.bridge,
            ifname: &ctx.ifname,
            peer: &peer,
            netns: ctx.netns.as_ref(),
            owner: &owner,
        };
        TopologyBuilder::new(&self.ops)
            .teardown(&session, &req)
            .await?;
        session.commit()?;

        Ok(SuccessReply {
            cni_version: conf.cni_version.clone(),
            interfaces: Vec::new(),
            ips: Vec::new(),
            routes: Vec::new(),
            dns: Default::default(),
            specific: Default::default(),
        })
    }

    /// Compares the kernel and the pool with what ADD would have produced.
    /// Never modifies either.
    async fn cmd_check(&self, conf: &NetConf, ctx: &InvocationContext) -> Result<SuccessReply, AppError> {
        let netns = required_netns(ctx)?;
        if !self.ops.netns_exists(netns) {
            return Err(AppError::UnknownContainer(format!(
                "network namespace {netns} does not exist"
            )));
        }
        let pool = open_pool(conf)?;
        let session = pool.lock()?;

        let container = self
            .ops
            .find_link(&ctx.ifname, Some(netns))
            .await
            .map_err(AppError::topology(format!("look up {} in {netns}", ctx.ifname)))?
            .ok_or_else(|| {
                AppError::UnknownContainer(format!("no interface {} in {netns}", ctx.ifname))
            })?;

        let topology = TopologyBuilder::new(&self.ops);
        let bridge = topology
            .host_link(&conf.bridge)
            .await?
            .filter(LinkHandle::is_bridge)
            .ok_or_else(|| AppError::CheckFailed(format!("bridge {} is missing", conf.bridge)))?;

        let peer = peer_name(&ctx.container_id, &ctx.ifname);
        match topology.host_link(&peer).await? {
            Some(host) if host.controller == Some(bridge.index) => {}
            Some(_) => {
                return Err(AppError::CheckFailed(format!(
                    "{peer} is not attached to {}",
                    conf.bridge
                )));
            }
            None => return Err(AppError::CheckFailed(format!("host peer {peer} is missing"))),
        }

        let address = session.address_of(&ctx.owner()).ok_or_else(|| {
            AppError::CheckFailed(format!("no address recorded for {}", ctx.owner()))
        })?;

        let expected = Ipv4Network::new(address, conf.prefix())
            .map_err(|e| AppError::CheckFailed(e.to_string()))?;
        let configured = self
            .ops
            .addresses(&container)
            .await
            .map_err(AppError::topology(format!("list addresses of {}", ctx.ifname)))?;
        if !configured.contains(&expected) {
            return Err(AppError::CheckFailed(format!(
                "{} should carry {expected}, found {configured:?}",
                ctx.ifname
            )));
        }

        debug!("{} is consistent", ctx.owner());
        success_reply(conf, &bridge, &container, netns, address)
    }
}

fn required_netns(ctx: &InvocationContext) -> Result<&NamespaceRef, AppError> {
    ctx.netns
        .as_ref()
        .ok_or_else(|| AppError::InvalidEnvironment("CNI_NETNS is not set".to_string()))
}

fn open_pool(conf: &NetConf) -> Result<AddressPool, AppError> {
    let pool = AddressPool::new(&conf.name, &conf.subnet.to_string(), &conf.data_dir)?
        .with_gateway(conf.gateway)?;
    Ok(pool)
}

fn version_reply(stdin: &[u8]) -> VersionReply {
    VersionReply {
        cni_version: config::peek_version(stdin),
        supported_versions: config::supported_versions(),
    }
}

fn success_reply(
    conf: &NetConf,
    bridge: &LinkHandle,
    container: &LinkHandle,
    netns: &NamespaceRef,
    address: Ipv4Addr,
) -> Result<SuccessReply, AppError> {
    let interfaces = vec![
        Interface {
            name: bridge.name.clone(),
            mac: bridge.mac.map(MacAddr::from),
            sandbox: Default::default(),
        },
        Interface {
            name: container.name.clone(),
            mac: container.mac.map(MacAddr::from),
            sandbox: netns.path().to_path_buf().into(),
        },
    ];
    let network = Ipv4Network::new(address, conf.prefix())
        .map_err(|e| AppError::InvalidConfig(e.to_string()))?;
    let ips = vec![Ip {
        interface: Some(1),
        address: IpNetwork::V4(network),
        gateway: Some(IpAddr::V4(conf.gateway)),
    }];
    let routes = if conf.is_default_gw {
        let default = Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
            .map_err(|e| AppError::InvalidConfig(e.to_string()))?;
        vec![Route {
            dst: IpNetwork::V4(default),
            gw: Some(IpAddr::V4(conf.gateway)),
        }]
    } else {
        Vec::new()
    };
    let dns = match &conf.dns {
        Some(dns) => serde_json::from_value(dns.clone()).map_err(CniError::from)?,
        None => Default::default(),
    };

    Ok(SuccessReply {
        cni_version: conf.cni_version.clone(),
        interfaces,
        ips,
        routes,
        dns,
        specific: Default::default(),
    })
}

/// Logs a failure the way it will be reported on stdout.
pub fn log_failure(failure: &Failure) {
    error!(
        "error (code {}): {}",
        failure.error.code(),
        failure.error
    );
}
