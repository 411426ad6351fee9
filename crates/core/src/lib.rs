pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    AunConfig, DEFAULT_AUN_PORT, EconetAddr, EconetPacket, FLAG_ARP_REPLY, FLAG_ARP_REQUEST,
    FLAG_IP_DATAGRAM, FlowConfig, GatewayConfig, PORT_IP, StationConfig, TablesConfig,
};
