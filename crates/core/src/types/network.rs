use crate::error::{Error, Result};
use crate::types::EconetAddr;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

/// Default UDP port for AUN traffic.
pub const DEFAULT_AUN_PORT: u16 = 32768;

/// Top-level gateway configuration, normally read from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub aun: AunConfig,
    pub tables: TablesConfig,
    pub flows: FlowConfig,
}

/// AUN (Econet over UDP) transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AunConfig {
    /// UDP address to listen on.
    /// Default: 0.0.0.0:32768
    pub listen: SocketAddr,
    /// Econet address of the gateway itself.
    /// Default: 0.254
    pub local: EconetAddr,
    /// Known AUN stations: Econet address -> UDP endpoint.
    pub stations: Vec<StationConfig>,
}

impl Default for AunConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_AUN_PORT)),
            local: EconetAddr::new(0, 254),
            stations: Vec::new(),
        }
    }
}

/// Mapping of one Econet station onto its AUN UDP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    pub address: EconetAddr,
    pub endpoint: SocketAddr,
}

/// Paths to the flat rule files loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TablesConfig {
    /// `<network> <station> <ipv4> <subnetmask>` per line.
    pub interfaces: Option<PathBuf>,
    /// `<network>/<subnetmask or prefix> <gateway> [<metric>]` per line.
    pub routes: Option<PathBuf>,
    /// `<external-ip> <internal-ip> <external-port> <internal-port>` per line.
    pub nat: Option<PathBuf>,
}

/// Timers and limits for address learning and connection tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Lifetime of a learned IP -> Econet mapping.
    /// Default: 3600
    pub address_ttl_secs: u64,
    /// Idle time after which a tracked connection is closed.
    /// Default: 120
    pub idle_timeout_secs: u64,
    /// Upper bound on an outbound connect.
    /// Default: 30
    pub connect_timeout_secs: u64,
    /// Interval of the housekeeping sweep.
    /// Default: 10
    pub housekeeping_interval_secs: u64,
    /// Maximum number of tracked plus dialing connections.
    /// Default: 1024
    pub max_flows: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            address_ttl_secs: 3600,
            idle_timeout_secs: 120,
            connect_timeout_secs: 30,
            housekeeping_interval_secs: 10,
            max_flows: 1024,
        }
    }
}

impl FlowConfig {
    pub fn address_ttl(&self) -> Duration {
        Duration::from_secs(self.address_ttl_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }
}

impl GatewayConfig {
    /// Check values that serde cannot reject on its own.
    pub fn validate(&self) -> Result<()> {
        if self.flows.max_flows == 0 {
            return Err(Error::InvalidConfig(
                "flows.max_flows must be at least 1".to_string(),
            ));
        }
        if self.flows.idle_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "flows.idle_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.flows.housekeeping_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "flows.housekeeping_interval_secs must be at least 1".to_string(),
            ));
        }

        let mut addresses = HashSet::new();
        let mut endpoints = HashSet::new();
        for station in &self.aun.stations {
            if station.address == self.aun.local {
                return Err(Error::InvalidConfig(format!(
                    "station {} clashes with the gateway's own address",
                    station.address
                )));
            }
            if !addresses.insert(station.address) {
                return Err(Error::InvalidConfig(format!(
                    "station {} is listed more than once",
                    station.address
                )));
            }
            if !endpoints.insert(station.endpoint) {
                return Err(Error::InvalidConfig(format!(
                    "endpoint {} is mapped to more than one station",
                    station.endpoint
                )));
            }
        }

        Ok(())
    }
}
