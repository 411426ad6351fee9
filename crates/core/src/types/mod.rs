mod econet;
mod network;

pub use econet::{
    EconetAddr, EconetPacket, FLAG_ARP_REPLY, FLAG_ARP_REQUEST, FLAG_IP_DATAGRAM, PORT_IP,
};
pub use network::{
    AunConfig, DEFAULT_AUN_PORT, FlowConfig, GatewayConfig, StationConfig, TablesConfig,
};
