//! Cache mapping IPv4 addresses to the Econet stations that own them.
//!
//! Entries are learned from inbound traffic and address resolution packets.
//! Expired entries stay visible until [`AddressCache::housekeeping`] runs.

use crate::error::NetError;
use econet_core::EconetAddr;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Lifetime of a learned mapping unless refreshed.
pub const DEFAULT_ADDRESS_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheEntry {
    addr: EconetAddr,
    expires: Instant,
}

/// Snapshot row returned by [`AddressCache::dump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressCacheEntry {
    pub ip: Ipv4Addr,
    pub network: u8,
    pub station: u8,
    pub expires: Instant,
}

/// IP to Econet address cache with TTL expiry.
#[derive(Debug, Default)]
pub struct AddressCache {
    entries: HashMap<Ipv4Addr, CacheEntry>,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the mapping for `ip`.
    pub fn add_entry(&mut self, network: u8, station: u8, ip: Ipv4Addr, ttl: Duration) {
        let addr = EconetAddr::new(network, station);
        let expires = Instant::now() + ttl;
        match self.entries.insert(ip, CacheEntry { addr, expires }) {
            Some(previous) if previous.addr != addr => {
                debug!("ARP cache: {ip} moved from {} to {addr}", previous.addr);
            }
            Some(_) => trace!("ARP cache: refreshed {ip} -> {addr}"),
            None => debug!("ARP cache: learned {ip} -> {addr}"),
        }
    }

    pub fn get_station(&self, ip: Ipv4Addr) -> Result<u8, NetError> {
        self.get_network_and_station(ip).map(|(_, station)| station)
    }

    pub fn get_network(&self, ip: Ipv4Addr) -> Result<u8, NetError> {
        self.get_network_and_station(ip).map(|(network, _)| network)
    }

    pub fn get_network_and_station(&self, ip: Ipv4Addr) -> Result<(u8, u8), NetError> {
        self.entries
            .get(&ip)
            .map(|entry| (entry.addr.network, entry.addr.station))
            .ok_or(NetError::AddressNotFound(ip))
    }

    pub fn get_addr(&self, ip: Ipv4Addr) -> Result<EconetAddr, NetError> {
        self.get_network_and_station(ip)
            .map(|(network, station)| EconetAddr::new(network, station))
    }

    /// Inverse lookup: the IP most recently learned for a station.
    pub fn get_ip(&self, network: u8, station: u8) -> Option<Ipv4Addr> {
        let addr = EconetAddr::new(network, station);
        self.entries
            .iter()
            .filter(|(_, entry)| entry.addr == addr)
            .max_by_key(|(_, entry)| entry.expires)
            .map(|(ip, _)| *ip)
    }

    /// Remove entries whose expiry has passed.
    pub fn housekeeping(&mut self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!("ARP cache: expired {removed} entries");
        }
    }

    /// All entries sorted by IP address.
    pub fn dump(&self) -> Vec<AddressCacheEntry> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(ip, entry)| AddressCacheEntry {
                ip: *ip,
                network: entry.addr.network,
                station: entry.addr.station,
                expires: entry.expires,
            })
            .collect();
        entries.sort_by_key(|entry| entry.ip);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
