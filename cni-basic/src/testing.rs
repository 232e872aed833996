//! In-memory [`NetOps`] for unit tests.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{anyhow, bail};
use ipnetwork::Ipv4Network;
use macaddr::MacAddr6;
use nix::fcntl::{Flock, FlockArg};

use crate::netops::NetOps;
use crate::types::{LinkHandle, NamespaceRef};

#[derive(Debug, Clone)]
struct FakeLink {
    name: String,
    index: u32,
    kind: String,
    mtu: u32,
    up: bool,
    controller: Option<u32>,
    peer: Option<u32>,
    netns: Option<NamespaceRef>,
    addresses: Vec<Ipv4Network>,
    routes: Vec<Ipv4Addr>,
}

impl FakeLink {
    fn handle(&self) -> LinkHandle {
        LinkHandle {
            name: self.name.clone(),
            index: self.index,
            mac: Some(MacAddr6::new(0x02, 0, 0, 0, 0, self.index as u8)),
            kind: Some(self.kind.clone()),
            controller: self.controller,
            netns: self.netns.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    links: Vec<FakeLink>,
    next_index: u32,
    namespaces: HashSet<NamespaceRef>,
    failing: HashSet<String>,
    calls: Vec<String>,
    watched_lock: Option<PathBuf>,
    lock_seen: Vec<bool>,
}

impl State {
    fn record(&mut self, op: &str, detail: String) -> anyhow::Result<()> {
        self.calls.push(format!("{op} {detail}"));
        if self.failing.contains(op) {
            bail!("injected failure in {op}");
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, kind: &str, mtu: u32, netns: Option<NamespaceRef>) -> u32 {
        self.next_index += 1;
        self.links.push(FakeLink {
            name: name.to_string(),
            index: self.next_index,
            kind: kind.to_string(),
            mtu,
            up: false,
            controller: None,
            peer: None,
            netns,
            addresses: Vec::new(),
            routes: Vec::new(),
        });
        self.next_index
    }

    fn find(&self, name: &str, netns: Option<&NamespaceRef>) -> Option<&FakeLink> {
        self.links
            .iter()
            .find(|l| l.name == name && l.netns.as_ref() == netns)
    }

    fn by_index(&mut self, index: u32) -> anyhow::Result<&mut FakeLink> {
        self.links
            .iter_mut()
            .find(|l| l.index == index)
            .ok_or_else(|| anyhow!("no link with index {index}"))
    }

    fn check_namespace(&self, netns: Option<&NamespaceRef>) -> anyhow::Result<()> {
        match netns {
            Some(ns) if !self.namespaces.contains(ns) => {
                bail!("network namespace {ns} does not exist")
            }
            _ => Ok(()),
        }
    }
}

/// Links, namespaces and injected failures live behind a `RefCell`; no
/// borrow is held across an await point.
#[derive(Debug, Default)]
pub struct FakeNet {
    state: RefCell<State>,
}

impl FakeNet {
    pub fn add_namespace(&self, netns: &NamespaceRef) {
        self.state.borrow_mut().namespaces.insert(netns.clone());
    }

    pub fn remove_namespace(&self, netns: &NamespaceRef) {
        let mut state = self.state.borrow_mut();
        state.namespaces.remove(netns);
        // The kernel destroys every link left in a dying namespace, and
        // with it the host end of each veth.
        let doomed: Vec<u32> = state
            .links
            .iter()
            .filter(|l| l.netns.as_ref() == Some(netns))
            .flat_map(|l| [Some(l.index), l.peer])
            .flatten()
            .collect();
        state.links.retain(|l| !doomed.contains(&l.index));
    }

    /// Creates a host link outside of any recorded call.
    pub fn add_link(&self, name: &str, kind: &str) {
        self.state.borrow_mut().insert(name, kind, 1500, None);
    }

    /// Makes every later call of `op` fail.
    pub fn fail_on(&self, op: &str) {
        self.state.borrow_mut().failing.insert(op.to_string());
    }

    /// From now on, every lookup records whether some other open file
    /// description holds an exclusive `flock` on `path`.
    pub fn watch_lock(&self, path: impl Into<PathBuf>) {
        self.state.borrow_mut().watched_lock = Some(path.into());
    }

    pub fn lock_observations(&self) -> Vec<bool> {
        self.state.borrow().lock_seen.clone()
    }

    fn observe_lock(&self) {
        let mut state = self.state.borrow_mut();
        let Some(path) = state.watched_lock.clone() else {
            return;
        };
        let held = match File::open(&path) {
            Ok(file) => Flock::lock(file, FlockArg::LockExclusiveNonblock).is_err(),
            Err(_) => false,
        };
        state.lock_seen.push(held);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn count(&self, op: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    pub fn exists(&self, name: &str, netns: Option<&NamespaceRef>) -> bool {
        self.state.borrow().find(name, netns).is_some()
    }

    pub fn is_up(&self, name: &str, netns: Option<&NamespaceRef>) -> bool {
        self.state.borrow().find(name, netns).is_some_and(|l| l.up)
    }

    pub fn mtu(&self, name: &str, netns: Option<&NamespaceRef>) -> Option<u32> {
        self.state.borrow().find(name, netns).map(|l| l.mtu)
    }

    pub fn addresses_of(&self, name: &str, netns: Option<&NamespaceRef>) -> Vec<Ipv4Network> {
        self.state
            .borrow()
            .find(name, netns)
            .map(|l| l.addresses.clone())
            .unwrap_or_default()
    }

    pub fn routes_of(&self, name: &str, netns: Option<&NamespaceRef>) -> Vec<Ipv4Addr> {
        self.state
            .borrow()
            .find(name, netns)
            .map(|l| l.routes.clone())
            .unwrap_or_default()
    }

    /// Removes an address behind the plugin's back.
    pub fn strip_addresses(&self, name: &str, netns: Option<&NamespaceRef>) {
        let mut state = self.state.borrow_mut();
        if let Some(link) = state
            .links
            .iter_mut()
            .find(|l| l.name == name && l.netns.as_ref() == netns)
        {
            link.addresses.clear();
        }
    }

    pub fn ports(&self, bridge: &str) -> Vec<String> {
        let state = self.state.borrow();
        let Some(index) = state.find(bridge, None).map(|b| b.index) else {
            return Vec::new();
        };
        state
            .links
            .iter()
            .filter(|l| l.controller == Some(index))
            .map(|l| l.name.clone())
            .collect()
    }
}

impl NetOps for FakeNet {
    async fn find_link(
        &self,
        name: &str,
        netns: Option<&NamespaceRef>,
    ) -> anyhow::Result<Option<LinkHandle>> {
        self.observe_lock();
        let state = self.state.borrow();
        state.check_namespace(netns)?;
        Ok(state.find(name, netns).map(FakeLink::handle))
    }

    async fn create_bridge(&self, name: &str, mtu: u32) -> anyhow::Result<LinkHandle> {
        let mut state = self.state.borrow_mut();
        state.record("create_bridge", name.to_string())?;
        if state.find(name, None).is_some() {
            bail!("{name}: File exists");
        }
        let index = state.insert(name, "bridge", mtu, None);
        Ok(state.by_index(index)?.handle())
    }

    async fn create_veth(
        &self,
        name: &str,
        peer: &str,
        mtu: u32,
    ) -> anyhow::Result<(LinkHandle, LinkHandle)> {
        let mut state = self.state.borrow_mut();
        state.record("create_veth", format!("{name}/{peer}"))?;
        if state.find(name, None).is_some() || state.find(peer, None).is_some() {
            bail!("{name}/{peer}: File exists");
        }
        let a = state.insert(name, "veth", mtu, None);
        let b = state.insert(peer, "veth", mtu, None);
        state.by_index(a)?.peer = Some(b);
        state.by_index(b)?.peer = Some(a);
        let end = state.by_index(a)?.handle();
        let peer_end = state.by_index(b)?.handle();
        Ok((end, peer_end))
    }

    async fn move_to_netns(
        &self,
        link: &LinkHandle,
        netns: &NamespaceRef,
        new_name: &str,
    ) -> anyhow::Result<LinkHandle> {
        let mut state = self.state.borrow_mut();
        state.record("move_to_netns", format!("{} -> {new_name}", link.name))?;
        state.check_namespace(Some(netns))?;
        if state.find(new_name, Some(netns)).is_some() {
            bail!("{new_name} already exists in {netns}");
        }
        let moved = state.by_index(link.index)?;
        moved.netns = Some(netns.clone());
        moved.name = new_name.to_string();
        Ok(moved.handle())
    }

    async fn set_master(&self, port: &LinkHandle, bridge: &LinkHandle) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.record("set_master", format!("{} {}", port.name, bridge.name))?;
        state.by_index(bridge.index)?;
        state.by_index(port.index)?.controller = Some(bridge.index);
        Ok(())
    }

    async fn set_up(&self, link: &LinkHandle) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.record("set_up", link.name.clone())?;
        state.by_index(link.index)?.up = true;
        Ok(())
    }

    async fn addresses(&self, link: &LinkHandle) -> anyhow::Result<Vec<Ipv4Network>> {
        self.observe_lock();
        let mut state = self.state.borrow_mut();
        Ok(state.by_index(link.index)?.addresses.clone())
    }

    async fn add_address(&self, link: &LinkHandle, address: Ipv4Network) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.record("add_address", format!("{} {address}", link.name))?;
        let target = state.by_index(link.index)?;
        if target.addresses.contains(&address) {
            bail!("{address} on {}: File exists", link.name);
        }
        target.addresses.push(address);
        Ok(())
    }

    async fn add_default_route(&self, link: &LinkHandle, gateway: Ipv4Addr) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.record("add_default_route", format!("{} {gateway}", link.name))?;
        state.by_index(link.index)?.routes.push(gateway);
        Ok(())
    }

    async fn delete_link(&self, link: &LinkHandle) -> anyhow::Result<()> {
        let mut state = self.state.borrow_mut();
        state.record("delete_link", link.name.clone())?;
        let target = state.by_index(link.index)?;
        let (index, peer) = (target.index, target.peer);
        state
            .links
            .retain(|l| l.index != index && Some(l.index) != peer);
        for l in state.links.iter_mut() {
            if l.controller == Some(index) {
                l.controller = None;
            }
        }
        Ok(())
    }

    async fn bridge_ports(&self, bridge: &LinkHandle) -> anyhow::Result<Vec<String>> {
        let state = self.state.borrow();
        Ok(state
            .links
            .iter()
            .filter(|l| l.controller == Some(bridge.index))
            .map(|l| l.name.clone())
            .collect())
    }

    fn netns_exists(&self, netns: &NamespaceRef) -> bool {
        self.state.borrow().namespaces.contains(netns)
    }
}
