//! IPv4 subnet arithmetic shared by the interface and route tables.

use std::fmt;
use std::net::Ipv4Addr;

/// A network address with its mask, stored as host-order integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    network: u32,
    mask: u32,
    prefix_len: u8,
}

impl Subnet {
    /// Build from a dotted mask. Returns `None` if the mask is not a run of
    /// leading one bits.
    pub fn from_mask(addr: Ipv4Addr, mask: Ipv4Addr) -> Option<Self> {
        let mask = u32::from(mask);
        let prefix_len = mask.leading_ones();
        if mask.checked_shl(prefix_len).unwrap_or(0) != 0 {
            return None;
        }
        Some(Self::from_parts(addr, mask, prefix_len as u8))
    }

    /// Build from a prefix length. Returns `None` above 32.
    pub fn from_prefix(addr: Ipv4Addr, prefix_len: u8) -> Option<Self> {
        if prefix_len > 32 {
            return None;
        }
        Some(Self::from_parts(addr, prefix_mask(prefix_len), prefix_len))
    }

    fn from_parts(addr: Ipv4Addr, mask: u32, prefix_len: u8) -> Self {
        Self {
            network: u32::from(addr) & mask,
            mask,
            prefix_len,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask == self.network
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len)
    }
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - prefix_len)
    }
}
