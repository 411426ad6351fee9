//! Static IPv4 route table with longest-prefix, lowest-metric selection.

use crate::error::NetError;
use crate::rules;
use crate::subnet::Subnet;
use std::net::Ipv4Addr;
use std::path::Path;

/// Metric used when a route does not give one.
pub const DEFAULT_METRIC: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub subnet: Subnet,
    pub gateway: Ipv4Addr,
    pub metric: u32,
}

impl RouteEntry {
    pub fn prefix_len(&self) -> u8 {
        self.subnet.prefix_len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `<network>/<subnetmask|prefix> <gateway> [<metric>]` lines.
    pub fn parse(text: &str) -> Result<Self, NetError> {
        let mut table = Self::new();
        for line in rules::lines(text) {
            line.expect_fields(2, 3)?;
            let destination = line.fields[0];
            let (network, mask) = destination
                .split_once('/')
                .ok_or_else(|| line.error(format!("expected network/mask, found '{destination}'")))?;
            let network: Ipv4Addr = network
                .parse()
                .map_err(|_| line.error(format!("invalid network '{network}'")))?;
            let subnet = parse_mask(network, mask)
                .ok_or_else(|| line.error(format!("invalid subnet mask '{mask}'")))?;
            let gateway = line.ip(1, "gateway")?;
            let metric = match line.fields.get(2) {
                Some(_) => Some(line.parse(2, "metric")?),
                None => None,
            };
            table.insert(subnet, gateway, metric);
        }
        Ok(table)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, NetError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn add_route(
        &mut self,
        network: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Ipv4Addr,
        metric: Option<u32>,
    ) -> Result<(), NetError> {
        let subnet = Subnet::from_mask(network, mask)
            .ok_or(NetError::InvalidSubnetMask(mask))?;
        self.insert(subnet, gateway, metric);
        Ok(())
    }

    fn insert(&mut self, subnet: Subnet, gateway: Ipv4Addr, metric: Option<u32>) {
        self.entries.push(RouteEntry {
            subnet,
            gateway,
            metric: metric.unwrap_or(DEFAULT_METRIC),
        });
    }

    /// Best route for `ip`: most specific prefix, then lowest metric.
    pub fn get_route(&self, ip: Ipv4Addr) -> Option<&RouteEntry> {
        let mut candidates: Vec<&RouteEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.subnet.contains(ip))
            .collect();
        candidates.sort_by(|a, b| {
            b.prefix_len()
                .cmp(&a.prefix_len())
                .then(a.metric.cmp(&b.metric))
        });
        candidates.into_iter().next()
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_mask(network: Ipv4Addr, mask: &str) -> Option<Subnet> {
    if mask.contains('.') {
        Subnet::from_mask(network, mask.parse().ok()?)
    } else {
        Subnet::from_prefix(network, mask.parse().ok()?)
    }
}
