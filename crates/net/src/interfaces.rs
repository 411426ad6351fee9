//! Table of IPv4 subnets the gateway serves directly on Econet networks.

use crate::error::NetError;
use crate::rules;
use crate::subnet::Subnet;
use econet_core::EconetAddr;
use std::net::Ipv4Addr;
use std::path::Path;

/// One local interface: our station on an Econet network and the IPv4
/// subnet it answers for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceEntry {
    pub network: u8,
    pub station: u8,
    pub ip: Ipv4Addr,
    pub subnet: Subnet,
}

impl InterfaceEntry {
    pub fn econet_addr(&self) -> EconetAddr {
        EconetAddr::new(self.network, self.station)
    }

    pub fn mask(&self) -> Ipv4Addr {
        self.subnet.mask()
    }

    pub fn prefix_len(&self) -> u8 {
        self.subnet.prefix_len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InterfaceTable {
    entries: Vec<InterfaceEntry>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `<network> <station> <ipv4> <subnetmask>` lines.
    pub fn parse(text: &str) -> Result<Self, NetError> {
        let mut table = Self::new();
        for line in rules::lines(text) {
            line.expect_fields(4, 4)?;
            let network = line.parse(0, "network number")?;
            let station = line.parse(1, "station number")?;
            let ip = line.ip(2, "interface address")?;
            let mask = line.ip(3, "subnet mask")?;
            table
                .add_interface(network, station, ip, mask)
                .map_err(|e| line.error(e.to_string()))?;
        }
        Ok(table)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, NetError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn add_interface(
        &mut self,
        network: u8,
        station: u8,
        ip: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> Result<(), NetError> {
        let subnet = Subnet::from_mask(ip, mask)
            .ok_or(NetError::InvalidSubnetMask(mask))?;
        self.entries.push(InterfaceEntry {
            network,
            station,
            ip,
            subnet,
        });
        Ok(())
    }

    /// First interface whose subnet contains `ip`.
    pub fn get_interface_for(&self, ip: Ipv4Addr) -> Result<&InterfaceEntry, NetError> {
        self.entries
            .iter()
            .find(|entry| entry.subnet.contains(ip))
            .ok_or(NetError::AddressNotFound(ip))
    }

    /// True if `ip` is one of our own interface addresses.
    pub fn is_local_ip(&self, ip: Ipv4Addr) -> bool {
        self.entries.iter().any(|entry| entry.ip == ip)
    }

    pub fn entries(&self) -> &[InterfaceEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
