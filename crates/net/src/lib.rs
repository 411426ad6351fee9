pub mod addr_cache;
pub mod aun;
mod checksum;
pub mod conntrack;
pub mod dialer;
mod error;
pub mod gateway;
pub mod interfaces;
pub mod ipv4;
pub mod nat_rules;
pub mod packet_io;
pub mod resolver;
pub mod routes;
mod rules;
pub mod subnet;
pub mod tcp;

pub use addr_cache::{AddressCache, AddressCacheEntry, DEFAULT_ADDRESS_TTL};
pub use aun::{AunFrame, AunTransport, AunType};
pub use conntrack::{
    ConnectionTracker, Disposition, FlowEvent, FlowKey, FlowSnapshot, FlowState, Reply, TCP_MSS,
};
pub use dialer::{BoxConnection, Connection, Dialer, TcpDialer};
pub use error::NetError;
pub use gateway::{Gateway, GatewayTables};
pub use interfaces::{InterfaceEntry, InterfaceTable};
pub use ipv4::{Ipv4Datagram, Ipv4Header};
pub use nat_rules::{NatRule, NatTable};
pub use packet_io::{ChannelIo, ChannelPeer, PacketIo};
pub use resolver::AddressResolver;
pub use routes::{DEFAULT_METRIC, RouteEntry, RouteTable};
pub use subnet::Subnet;
pub use tcp::{TcpFlags, TcpOption, TcpSegment};
