use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::error::PoolError;

/// The allocatable part of a subnet.
///
/// Slots are the host addresses in ascending order with the network
/// address, the broadcast address and the gateway removed, so a subnet with
/// `h` host bits has `2^h - 3` slots. With the gateway on the first host,
/// slot `i` is `network + i + 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    subnet: Ipv4Network,
    gateway: Ipv4Addr,
}

impl AddressRange {
    pub fn new(subnet: Ipv4Network, gateway: Option<Ipv4Addr>) -> Result<Self, PoolError> {
        if subnet.prefix() > 30 {
            return Err(PoolError::Configuration(format!(
                "network {subnet} too small to allocate from"
            )));
        }
        if subnet.ip() != subnet.network() {
            return Err(PoolError::Configuration(format!(
                "network {subnet} has host bits set, the network address is {}",
                subnet.network()
            )));
        }

        let network = u32::from(subnet.network());
        let broadcast = u32::from(subnet.broadcast());
        let gateway = gateway.unwrap_or_else(|| Ipv4Addr::from(network + 1));
        let gw = u32::from(gateway);
        if gw <= network || gw >= broadcast {
            return Err(PoolError::Configuration(format!(
                "gateway {gateway} is not a host address of {subnet}"
            )));
        }

        Ok(Self { subnet, gateway })
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn prefix(&self) -> u8 {
        self.subnet.prefix()
    }

    pub fn total(&self) -> usize {
        (1usize << (32 - u32::from(self.subnet.prefix()))) - 3
    }

    pub fn address(&self, index: usize) -> Option<Ipv4Addr> {
        if index >= self.total() {
            return None;
        }
        let mut host = u32::from(self.subnet.network()) + 1 + index as u32;
        if host >= u32::from(self.gateway) {
            host += 1;
        }
        Some(Ipv4Addr::from(host))
    }

    pub fn index(&self, address: Ipv4Addr) -> Option<usize> {
        let network = u32::from(self.subnet.network());
        let broadcast = u32::from(self.subnet.broadcast());
        let gateway = u32::from(self.gateway);
        let host = u32::from(address);
        if host <= network || host >= broadcast || host == gateway {
            return None;
        }
        let mut index = (host - network - 1) as usize;
        if host > gateway {
            index -= 1;
        }
        Some(index)
    }
}
