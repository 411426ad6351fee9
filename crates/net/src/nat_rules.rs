//! Static destination NAT rules.
//!
//! A rule maps an external (IP, port) that Econet clients connect to onto
//! an internal (IP, port) the gateway actually dials.

use crate::error::NetError;
use crate::rules;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatRule {
    pub external_ip: Ipv4Addr,
    pub internal_ip: Ipv4Addr,
    pub external_port: u16,
    pub internal_port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct NatTable {
    rules: Vec<NatRule>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `<external-ip> <internal-ip> <external-port> <internal-port>` lines.
    pub fn parse(text: &str) -> Result<Self, NetError> {
        let mut table = Self::new();
        for line in rules::lines(text) {
            line.expect_fields(4, 4)?;
            table.add_rule(NatRule {
                external_ip: line.ip(0, "external address")?,
                internal_ip: line.ip(1, "internal address")?,
                external_port: line.parse(2, "external port")?,
                internal_port: line.parse(3, "internal port")?,
            });
        }
        Ok(table)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, NetError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn add_rule(&mut self, rule: NatRule) {
        self.rules.push(rule);
    }

    /// True if any rule rewrites traffic to `ip`.
    pub fn is_nat_target(&self, ip: Ipv4Addr) -> bool {
        self.rules.iter().any(|rule| rule.external_ip == ip)
    }

    /// Internal endpoint for a connection to `ip:port`.
    ///
    /// A rule for the exact (ip, port) wins. Otherwise the port is kept and
    /// only the address is rewritten, using the first rule for `ip`.
    pub fn translate(&self, ip: Ipv4Addr, port: u16) -> Option<SocketAddrV4> {
        let exact = self
            .rules
            .iter()
            .find(|rule| rule.external_ip == ip && rule.external_port == port);
        if let Some(rule) = exact {
            return Some(SocketAddrV4::new(rule.internal_ip, rule.internal_port));
        }
        self.rules
            .iter()
            .find(|rule| rule.external_ip == ip)
            .map(|rule| SocketAddrV4::new(rule.internal_ip, port))
    }

    pub fn rules(&self) -> &[NatRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
