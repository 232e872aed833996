use crate::ip::link;

use log::info;
use netlink_packet_route::link::{InfoData, InfoKind, InfoVeth, LinkMessage};
use rtnetlink::{LinkMessageBuilder, LinkUnspec, LinkVeth};

/// A veth pair to be created in the caller's namespace: `name` is the end
/// that will later move into a container, `peer` stays behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Veth {
    pub name: String,
    pub peer: String,
    pub mtu: u32,
}

impl Veth {
    pub fn new(name: &str, peer: &str) -> Self {
        Self {
            name: name.to_string(),
            peer: peer.to_string(),
            mtu: 1500,
        }
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Both ends are created down; callers bring them up once they are
    /// wired into place.
    pub fn into_message(self) -> LinkMessage {
        let peer_msg = LinkMessageBuilder::<LinkUnspec>::new()
            .name(self.peer)
            .mtu(self.mtu)
            .build();

        LinkMessageBuilder::<LinkVeth>::new_with_info_kind(InfoKind::Veth)
            .name(self.name)
            .mtu(self.mtu)
            .set_info_data(InfoData::Veth(InfoVeth::Peer(peer_msg)))
            .build()
    }
}

/// Creates the pair and returns the fresh link messages of both ends.
pub async fn create_veth_pair(veth: Veth) -> anyhow::Result<(LinkMessage, LinkMessage)> {
    info!(
        "Creating veth pair: name={}, peer={}, mtu={}",
        veth.name, veth.peer, veth.mtu
    );
    let (name, peer) = (veth.name.clone(), veth.peer.clone());

    link::add_link(veth.into_message())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to add veth pair {}/{}: {}", name, peer, e))?;

    let end = link::link_by_name(&name).await?;
    let peer_end = link::link_by_name(&peer).await?;
    Ok((end, peer_end))
}
