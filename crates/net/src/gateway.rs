//! The IPv4 service of the gateway.
//!
//! [`Gateway`] receives every Econet packet addressed to the IP port,
//! learns station addresses from them, answers address resolution for our
//! own interfaces and hands TCP to the [`ConnectionTracker`]. Replies are
//! pulled with [`Gateway::next_reply`]; [`Gateway::run`] ties it all to a
//! [`PacketIo`].

use crate::addr_cache::AddressCache;
use crate::conntrack::{ConnectionTracker, Disposition, FlowEvent};
use crate::dialer::Dialer;
use crate::error::NetError;
use crate::interfaces::InterfaceTable;
use crate::ipv4::Ipv4Datagram;
use crate::nat_rules::NatTable;
use crate::packet_io::PacketIo;
use crate::resolver::AddressResolver;
use crate::routes::RouteTable;
use crate::tcp::TcpSegment;
use econet_core::{
    EconetAddr, EconetPacket, FLAG_ARP_REPLY, FLAG_ARP_REQUEST, FLAG_IP_DATAGRAM, FlowConfig,
    PORT_IP, TablesConfig,
};
use smoltcp::wire::IpProtocol;
use std::collections::VecDeque;
use std::future::poll_fn;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Length of an address-resolution payload: sender IP then target IP.
const ARP_PAYLOAD_LEN: usize = 8;

/// Interface, route and NAT tables, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct GatewayTables {
    pub interfaces: InterfaceTable,
    pub routes: RouteTable,
    pub nat: NatTable,
}

impl GatewayTables {
    /// Load each configured rule file; missing entries give empty tables.
    pub fn load(config: &TablesConfig) -> Result<Self, NetError> {
        let mut tables = Self::default();
        if let Some(path) = &config.interfaces {
            tables.interfaces = InterfaceTable::load(path)?;
        }
        if let Some(path) = &config.routes {
            tables.routes = RouteTable::load(path)?;
        }
        if let Some(path) = &config.nat {
            tables.nat = NatTable::load(path)?;
        }
        Ok(tables)
    }
}

pub struct Gateway {
    /// Our station address when no interface matches
    local: EconetAddr,
    cache: AddressCache,
    interfaces: InterfaceTable,
    routes: RouteTable,
    tracker: ConnectionTracker,
    /// Address-resolution replies, sent before tracker replies
    outbound: VecDeque<EconetPacket>,
    address_ttl: Duration,
    housekeeping_interval: Duration,
}

impl Gateway {
    pub fn new(
        local: EconetAddr,
        tables: GatewayTables,
        dialer: Arc<dyn Dialer>,
        config: &FlowConfig,
    ) -> Self {
        Self {
            local,
            cache: AddressCache::new(),
            interfaces: tables.interfaces,
            routes: tables.routes,
            tracker: ConnectionTracker::new(tables.nat, dialer).with_config(config),
            outbound: VecDeque::new(),
            address_ttl: config.address_ttl(),
            housekeeping_interval: config.housekeeping_interval(),
        }
    }

    /// Handle one inbound Econet packet.
    ///
    /// Returns what the connection tracker did with it, or `None` if the
    /// packet never reached the tracker.
    pub fn handle_packet(&mut self, packet: &EconetPacket) -> Option<Disposition> {
        if packet.port != PORT_IP {
            tracing::trace!("Gateway: ignoring port {:#04x} from {}", packet.port, packet.src);
            return None;
        }

        match packet.flags {
            FLAG_IP_DATAGRAM => self.handle_datagram(packet),
            FLAG_ARP_REQUEST | FLAG_ARP_REPLY => {
                self.handle_arp(packet);
                None
            }
            flags => {
                tracing::debug!("Gateway: unknown IP port flags {flags:#04x} from {}", packet.src);
                None
            }
        }
    }

    fn handle_datagram(&mut self, packet: &EconetPacket) -> Option<Disposition> {
        let datagram = match Ipv4Datagram::decode(&packet.payload) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::debug!("Gateway: dropping datagram from {}: {e}", packet.src);
                return None;
            }
        };
        let header = datagram.header();

        if !datagram.checksum_valid() {
            tracing::trace!("Gateway: bad IPv4 header checksum from {}", header.src);
        }

        self.cache.add_entry(
            packet.src.network,
            packet.src.station,
            header.src,
            self.address_ttl,
        );

        if header.is_fragment() {
            tracing::debug!("Gateway: dropping fragment {} -> {}", header.src, header.dst);
            return None;
        }

        if header.protocol != IpProtocol::Tcp {
            tracing::debug!(
                "Gateway: dropping {} datagram {} -> {}",
                header.protocol,
                header.src,
                header.dst
            );
            return None;
        }

        let segment = match TcpSegment::decode(datagram.payload()) {
            Ok(segment) => segment,
            Err(e) => {
                tracing::debug!("Gateway: dropping segment from {}: {e}", header.src);
                return None;
            }
        };

        let disposition = self.tracker.process(packet.src, &datagram, &segment);
        tracing::trace!(
            "Gateway: {}:{} -> {}:{} {:?}",
            header.src,
            segment.src_port,
            header.dst,
            segment.dst_port,
            disposition
        );
        Some(disposition)
    }

    fn handle_arp(&mut self, packet: &EconetPacket) {
        let Some((sender, target)) = parse_arp(&packet.payload) else {
            tracing::debug!(
                "Gateway: short address resolution packet ({} bytes) from {}",
                packet.payload.len(),
                packet.src
            );
            return;
        };

        if !sender.is_unspecified() {
            self.cache
                .add_entry(packet.src.network, packet.src.station, sender, self.address_ttl);
        }

        if packet.flags != FLAG_ARP_REQUEST || !self.interfaces.is_local_ip(target) {
            return;
        }
        let Ok(interface) = self.interfaces.get_interface_for(target) else {
            return;
        };

        tracing::debug!("Gateway: answering who-has {target} from {sender}");
        let mut payload = Vec::with_capacity(ARP_PAYLOAD_LEN);
        payload.extend_from_slice(&target.octets());
        payload.extend_from_slice(&sender.octets());
        self.outbound.push_back(EconetPacket {
            port: PORT_IP,
            flags: FLAG_ARP_REPLY,
            src: interface.econet_addr(),
            dst: packet.src,
            payload,
        });
    }

    /// Next packet to send back to the Econet side.
    pub fn next_reply(&mut self) -> Option<EconetPacket> {
        if let Some(packet) = self.outbound.pop_front() {
            return Some(packet);
        }

        let reply = self.tracker.next_reply()?;
        let resolver = self.resolver();
        let dst = resolver.resolve(reply.client_ip).unwrap_or(reply.peer);
        let src = resolver.source_for(reply.client_ip).unwrap_or(self.local);
        Some(EconetPacket::ip_datagram(src, dst, reply.datagram))
    }

    /// Expire address cache entries and close idle flows.
    pub fn housekeeping(&mut self) {
        self.cache.housekeeping();
        self.tracker.housekeeping();
    }

    /// Wait for the next dial or relay event.
    pub async fn next_flow_event(&mut self) -> Option<FlowEvent> {
        self.tracker.next_event().await
    }

    pub fn handle_flow_event(&mut self, event: FlowEvent) {
        self.tracker.handle_event(event);
    }

    pub fn resolver(&self) -> AddressResolver<'_> {
        AddressResolver::new(&self.cache, &self.interfaces, &self.routes)
    }

    pub fn address_cache(&self) -> &AddressCache {
        &self.cache
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Serve packets from `io` until it fails.
    pub async fn run<I: PacketIo>(&mut self, mut io: I) -> Result<(), NetError> {
        let mut housekeeping = tokio::time::interval(self.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Gateway: serving {} interfaces, {} routes, {} NAT rules",
            self.interfaces.entries().len(),
            self.routes.entries().len(),
            self.tracker.nat().rules().len()
        );

        loop {
            tokio::select! {
                result = poll_fn(|cx| io.poll_recv(cx)) => match result {
                    Ok(packet) => {
                        self.handle_packet(&packet);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        return Err(NetError::Connection(format!("packet transport closed: {e}")));
                    }
                    Err(e) => {
                        tracing::warn!("Gateway: receive failed: {e}");
                    }
                },
                Some(event) = self.tracker.next_event() => {
                    self.tracker.handle_event(event);
                }
                _ = housekeeping.tick() => {
                    self.housekeeping();
                }
            }

            while let Some(packet) = self.next_reply() {
                if let Err(e) = io.send(&packet) {
                    tracing::warn!("Gateway: failed to send reply to {}: {e}", packet.dst);
                }
            }
        }
    }
}

/// Split an address-resolution payload into (sender, target).
fn parse_arp(payload: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let bytes: &[u8; ARP_PAYLOAD_LEN] = payload.get(..ARP_PAYLOAD_LEN)?.try_into().ok()?;
    Some((
        Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
        Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]),
    ))
}
