//! TCP connection tracking and proxying for Econet clients.
//!
//! Clients speak TCP to an external address that a NAT rule maps onto an
//! internal host. The tracker terminates that TCP session itself: it dials the
//! internal host on the first SYN, relays payload bytes over the resulting
//! connection and synthesizes every segment the client receives.
//!
//! All flow state is owned by [`ConnectionTracker`]. Each connected flow has a
//! relay task that owns the socket; the two sides talk only through channels,
//! and every event the relay sends back is tagged with its flow id so events
//! from a closed flow are discarded.

use crate::dialer::{BoxConnection, Dialer};
use crate::ipv4::{Ipv4Datagram, Ipv4Header};
use crate::nat_rules::NatTable;
use crate::tcp::{TcpFlags, TcpOption, TcpSegment};
use econet_core::{EconetAddr, FlowConfig};
use smoltcp::wire::{IpProtocol, TcpSeqNumber};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Flows idle for longer than this are closed by housekeeping.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default limit on tracked plus dialing flows.
pub const DEFAULT_MAX_FLOWS: usize = 1024;

/// IPv4 MTU used for IP over Econet.
pub const ECONET_IP_MTU: usize = 1280;

/// Largest segment payload we send and advertise.
/// MSS = MTU - IP header - TCP header
pub const TCP_MSS: u16 = (ECONET_IP_MTU - 20 - 20) as u16;

/// Bytes a flow may have queued towards upstream. What is left of it is the
/// window advertised to the client.
const RECV_WINDOW: usize = 8192;

/// How long a flow closed by the client is kept to answer a retransmitted FIN.
const CLOSED_FLOW_LINGER: Duration = Duration::from_secs(30);

/// Capacity of the relay -> tracker event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

const RELAY_BUFFER_SIZE: usize = 4096;

/// A flow as seen from the Econet side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self {
            src_ip: *src.ip(),
            dst_ip: *dst.ip(),
            src_port: src.port(),
            dst_port: dst.port(),
        }
    }

    fn from_segment(header: &Ipv4Header, segment: &TcpSegment) -> Self {
        Self {
            src_ip: header.src,
            dst_ip: header.dst,
            src_port: segment.src_port,
            dst_port: segment.dst_port,
        }
    }

    /// The Econet client's end.
    pub fn client(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.src_ip, self.src_port)
    }

    /// The address the client believes it is talking to.
    pub fn server(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst_ip, self.dst_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client(), self.server())
    }
}

/// Lifecycle of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// SYN seen, outbound connect in progress
    Connecting,
    /// Outbound connection up, relaying
    Connected,
    /// FIN sent to the client
    Closing,
    /// RST sent to the client
    Error,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowState::Connecting => "connecting",
            FlowState::Connected => "connected",
            FlowState::Closing => "closing",
            FlowState::Error => "error",
        };
        f.write_str(name)
    }
}

/// What [`ConnectionTracker::process`] did with a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Destination is not covered by any NAT rule.
    NotNatTarget,
    /// Not a SYN and no flow exists for the key.
    UnknownFlow,
    /// SYN for a key whose dial is still in flight.
    DuplicateDial,
    /// Already seen, or not the next expected sequence number.
    DuplicateSegment,
    /// Outbound connect started.
    Dialing,
    /// Segment accepted on a connected flow.
    Forwarded,
    /// Segment closed the flow (FIN or RST).
    Closed,
    /// Flow limit reached, client reset.
    ConnectionLimit,
    /// Retransmitted SYN answered with the same SYN+ACK again.
    SynAckResent,
    /// Retransmitted FIN on a closed flow answered with the same FIN+ACK.
    FinAckResent,
}

/// An IPv4 datagram ready to go back to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Station the triggering segment came from.
    pub peer: EconetAddr,
    /// IP address of the client the datagram is for.
    pub client_ip: Ipv4Addr,
    pub datagram: Vec<u8>,
}

/// Message from a dial or relay task to the tracker.
pub struct FlowEvent {
    flow_id: u64,
    key: FlowKey,
    kind: FlowEventKind,
}

enum FlowEventKind {
    Connected(BoxConnection),
    ConnectFailed(io::Error),
    Data(Vec<u8>),
    End,
    Error(io::Error),
}

impl fmt::Debug for FlowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            FlowEventKind::Connected(_) => "connected".to_string(),
            FlowEventKind::ConnectFailed(e) => format!("connect failed: {e}"),
            FlowEventKind::Data(data) => format!("{} bytes", data.len()),
            FlowEventKind::End => "end".to_string(),
            FlowEventKind::Error(e) => format!("error: {e}"),
        };
        write!(f, "FlowEvent(#{} {}: {kind})", self.flow_id, self.key)
    }
}

/// Snapshot row returned by [`ConnectionTracker::dump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSnapshot {
    pub key: FlowKey,
    pub peer: EconetAddr,
    pub upstream: SocketAddrV4,
    pub state: FlowState,
    pub client_next_seq: u32,
    pub delivered_seq: u32,
    /// Highest acknowledgment seen from the client
    pub client_ack: u32,
    /// Window last advertised by the client
    pub window: u16,
    pub idle: Duration,
}

struct PendingDial {
    id: u64,
    peer: EconetAddr,
    upstream: SocketAddrV4,
    client_isn: u32,
    client_mss: Option<u16>,
    client_window: u16,
    /// Payload carried on the SYN, written once connected
    syn_payload: Vec<u8>,
    started: Instant,
    task: JoinHandle<()>,
}

/// One connected flow.
pub struct Flow {
    id: u64,
    key: FlowKey,
    peer: EconetAddr,
    upstream: SocketAddrV4,
    state: FlowState,
    client_isn: u32,
    /// Next byte expected from the client; what we acknowledge
    client_next_seq: u32,
    /// Sequence of the last accepted segment that consumed sequence space
    last_seen_seq: u32,
    our_isn: u32,
    /// Next sequence number of bytes we deliver to the client
    delivered_seq: u32,
    /// Highest acknowledgment seen from the client
    client_ack: u32,
    /// Client's advertised window
    window: u16,
    mss: u16,
    packet_id: u16,
    last_activity: Instant,
    /// One permit per byte the relay may still accept
    budget: Arc<Semaphore>,
    commands: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Flow {
    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn peer(&self) -> EconetAddr {
        self.peer
    }

    fn segment(&self, flags: TcpFlags) -> TcpSegment {
        let mut segment = TcpSegment::new(
            self.key.dst_port,
            self.key.src_port,
            self.delivered_seq,
            self.client_next_seq,
            flags,
        );
        segment.window = self.budget.available_permits().min(u16::MAX as usize) as u16;
        segment
    }

    fn syn_ack(&self) -> TcpSegment {
        let mut segment = self.segment(TcpFlags::SYN | TcpFlags::ACK);
        segment.seq = self.our_isn;
        segment.options.push(TcpOption::mss(TCP_MSS));
        segment
    }

    fn ack(&self) -> TcpSegment {
        self.segment(TcpFlags::ACK)
    }

    /// Upstream bytes for the client, split into MSS-sized segments.
    fn on_data(&mut self, data: &[u8]) -> Vec<TcpSegment> {
        let mut segments = Vec::with_capacity(data.len().div_ceil(self.mss as usize));
        for chunk in data.chunks(self.mss as usize) {
            let mut segment = self.segment(TcpFlags::PSH | TcpFlags::ACK);
            segment.payload = chunk.to_vec();
            segments.push(segment);
            self.delivered_seq = self.delivered_seq.wrapping_add(chunk.len() as u32);
        }
        self.last_activity = Instant::now();
        segments
    }

    /// Upstream closed its side.
    fn on_end(&mut self) -> TcpSegment {
        self.on_close()
    }

    /// Upstream failed; reset the client.
    fn on_error(&mut self) -> TcpSegment {
        self.state = FlowState::Error;
        self.segment(TcpFlags::RST | TcpFlags::ACK)
    }

    /// Close towards the client with FIN+ACK.
    fn on_close(&mut self) -> TcpSegment {
        self.state = FlowState::Closing;
        let segment = self.segment(TcpFlags::FIN | TcpFlags::ACK);
        self.delivered_seq = self.delivered_seq.wrapping_add(1);
        segment
    }

    /// Take `len` bytes of the budget; false if they do not fit.
    fn reserve(&self, len: usize) -> bool {
        let Ok(len) = u32::try_from(len) else {
            return false;
        };
        match self.budget.try_acquire_many(len) {
            Ok(permit) => {
                // Returned by the relay once written
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Track the client's window and acknowledgment.
    fn observe(&mut self, segment: &TcpSegment) {
        self.window = segment.window;
        if segment.flags.ack() && !seq_before(segment.ack, self.client_ack) {
            self.client_ack = segment.ack;
        }
    }

    fn write(&self, payload: &[u8]) {
        let sent = self
            .commands
            .as_ref()
            .is_some_and(|commands| commands.send(payload.to_vec()).is_ok());
        if !sent {
            tracing::debug!("NAT: TCP {} relay gone, dropping {} bytes", self.key, payload.len());
        }
    }

    /// Wrap a segment for the client.
    fn emit(&mut self, segment: TcpSegment) -> Reply {
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        reply(self.peer, &self.key, id, &segment)
    }

    /// Stop relaying after queued writes are flushed, then close the socket.
    fn shutdown(mut self) {
        self.commands.take();
    }

    /// Drop the socket immediately.
    fn abort(self) {
        self.task.abort();
    }

    fn snapshot(&self, now: Instant) -> FlowSnapshot {
        FlowSnapshot {
            key: self.key,
            peer: self.peer,
            upstream: self.upstream,
            state: self.state,
            client_next_seq: self.client_next_seq,
            delivered_seq: self.delivered_seq,
            client_ack: self.client_ack,
            window: self.window,
            idle: now.duration_since(self.last_activity),
        }
    }
}

/// A flow the client closed, kept until its FIN+ACK is acknowledged.
struct ClosedFlow {
    key: FlowKey,
    peer: EconetAddr,
    fin_ack: TcpSegment,
    packet_id: u16,
    until: Instant,
}

impl ClosedFlow {
    fn emit(&mut self) -> Reply {
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        reply(self.peer, &self.key, id, &self.fin_ack)
    }
}

/// Tracks every TCP flow opened by Econet clients.
pub struct ConnectionTracker {
    nat: NatTable,
    dialer: Arc<dyn Dialer>,
    flows: HashMap<FlowKey, Flow>,
    pending: HashMap<FlowKey, PendingDial>,
    closed: HashMap<FlowKey, ClosedFlow>,
    events_tx: mpsc::Sender<FlowEvent>,
    events_rx: mpsc::Receiver<FlowEvent>,
    replies: VecDeque<Reply>,
    next_flow_id: u64,
    packet_id: u16,
    idle_timeout: Duration,
    max_flows: usize,
}

impl ConnectionTracker {
    pub fn new(nat: NatTable, dialer: Arc<dyn Dialer>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            nat,
            dialer,
            flows: HashMap::new(),
            pending: HashMap::new(),
            closed: HashMap::new(),
            events_tx,
            events_rx,
            replies: VecDeque::new(),
            next_flow_id: 1,
            packet_id: 0,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_flows: DEFAULT_MAX_FLOWS,
        }
    }

    /// Apply idle timeout and flow limit from configuration.
    pub fn with_config(mut self, config: &FlowConfig) -> Self {
        self.idle_timeout = config.idle_timeout();
        self.max_flows = config.max_flows;
        self
    }

    pub fn nat(&self) -> &NatTable {
        &self.nat
    }

    /// Handle one TCP segment from `peer`.
    pub fn process(
        &mut self,
        peer: EconetAddr,
        datagram: &Ipv4Datagram,
        segment: &TcpSegment,
    ) -> Disposition {
        let header = datagram.header();
        if !self.nat.is_nat_target(header.dst) {
            tracing::trace!("NAT: {} is not a NAT target", header.dst);
            return Disposition::NotNatTarget;
        }

        let key = FlowKey::from_segment(header, segment);
        if self.flows.contains_key(&key) {
            return self.process_tracked(key, segment);
        }
        if let Some(disposition) = self.process_closed(key, segment) {
            return disposition;
        }

        if segment.flags.rst() {
            if let Some(pending) = self.pending.remove(&key) {
                tracing::debug!("NAT: TCP RST from {key} while connecting");
                pending.task.abort();
                return Disposition::Closed;
            }
            return Disposition::UnknownFlow;
        }

        if !segment.flags.syn() || segment.flags.ack() {
            tracing::trace!(
                "NAT: TCP {key} no connection (flags: {:?}, seq={})",
                segment.flags,
                segment.seq
            );
            return Disposition::UnknownFlow;
        }

        if self.pending.contains_key(&key) {
            tracing::trace!("NAT: TCP {key} SYN retransmitted while dialing");
            return Disposition::DuplicateDial;
        }

        self.start_dial(peer, key, segment)
    }

    fn start_dial(&mut self, peer: EconetAddr, key: FlowKey, segment: &TcpSegment) -> Disposition {
        if self.flows.len() + self.pending.len() >= self.max_flows {
            tracing::warn!(
                "NAT: TCP connection limit reached ({}), rejecting {key}",
                self.max_flows
            );
            self.queue_reset(peer, &key, segment.seq.wrapping_add(segment.seq_len()));
            return Disposition::ConnectionLimit;
        }

        let Some(upstream) = self.nat.translate(key.dst_ip, key.dst_port) else {
            return Disposition::NotNatTarget;
        };

        let id = self.next_flow_id;
        self.next_flow_id += 1;

        tracing::debug!("NAT: TCP SYN {key}, connecting to {upstream}...");

        let dial = self.dialer.dial(upstream);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let kind = match dial.await {
                Ok(connection) => FlowEventKind::Connected(connection),
                Err(e) => FlowEventKind::ConnectFailed(e),
            };
            let _ = events
                .send(FlowEvent {
                    flow_id: id,
                    key,
                    kind,
                })
                .await;
        });

        self.pending.insert(
            key,
            PendingDial {
                id,
                peer,
                upstream,
                client_isn: segment.seq,
                client_mss: segment.mss(),
                client_window: segment.window,
                syn_payload: segment.payload.clone(),
                started: Instant::now(),
                task,
            },
        );

        Disposition::Dialing
    }

    fn process_tracked(&mut self, key: FlowKey, segment: &TcpSegment) -> Disposition {
        let Some(flow) = self.flows.get_mut(&key) else {
            return Disposition::UnknownFlow;
        };

        if segment.flags.rst() {
            tracing::debug!("NAT: TCP RST from client {key}");
            if let Some(flow) = self.flows.remove(&key) {
                flow.abort();
            }
            return Disposition::Closed;
        }

        if segment.flags.syn() {
            if segment.seq == flow.client_isn && !segment.flags.ack() {
                let syn_ack = flow.syn_ack();
                let reply = flow.emit(syn_ack);
                self.replies.push_back(reply);
                return Disposition::SynAckResent;
            }
            return Disposition::DuplicateSegment;
        }

        flow.observe(segment);

        let fin = segment.flags.fin();
        let consumes = !segment.payload.is_empty() || fin;
        let duplicate = segment.seq == flow.last_seen_seq
            || (!fin
                && segment.payload.is_empty()
                && segment.seq == flow.last_seen_seq.wrapping_add(1));
        if duplicate {
            tracing::trace!("NAT: TCP {key} duplicate segment seq={}", segment.seq);
            if !segment.payload.is_empty() {
                // Our ACK may have been lost
                let ack = flow.ack();
                let reply = flow.emit(ack);
                self.replies.push_back(reply);
            }
            return Disposition::DuplicateSegment;
        }

        flow.last_activity = Instant::now();

        if consumes && segment.seq != flow.client_next_seq {
            let reason = if seq_before(segment.seq, flow.client_next_seq) {
                "retransmitted"
            } else {
                "out of order"
            };
            tracing::trace!(
                "NAT: TCP {key} {reason} seq={} expected={}",
                segment.seq,
                flow.client_next_seq
            );
            let ack = flow.ack();
            let reply = flow.emit(ack);
            self.replies.push_back(reply);
            return Disposition::DuplicateSegment;
        }

        if !consumes {
            return Disposition::Forwarded;
        }

        if !segment.payload.is_empty() && !flow.reserve(segment.payload.len()) {
            tracing::trace!(
                "NAT: TCP {key} window full, dropping {} bytes seq={}",
                segment.payload.len(),
                segment.seq
            );
            let ack = flow.ack();
            let reply = flow.emit(ack);
            self.replies.push_back(reply);
            return Disposition::DuplicateSegment;
        }

        flow.last_seen_seq = segment.seq;
        if !segment.payload.is_empty() {
            flow.write(&segment.payload);
            flow.client_next_seq = flow
                .client_next_seq
                .wrapping_add(segment.payload.len() as u32);
            tracing::trace!("NAT: TCP {key} {} bytes upstream", segment.payload.len());
        }

        if fin {
            flow.client_next_seq = flow.client_next_seq.wrapping_add(1);
            tracing::debug!("NAT: TCP FIN from client {key}");
            let fin_ack = flow.on_close();
            let reply = flow.emit(fin_ack.clone());
            self.replies.push_back(reply);
            if let Some(flow) = self.flows.remove(&key) {
                self.closed.insert(
                    key,
                    ClosedFlow {
                        key,
                        peer: flow.peer,
                        fin_ack,
                        packet_id: flow.packet_id,
                        until: Instant::now() + CLOSED_FLOW_LINGER,
                    },
                );
                flow.shutdown();
            }
            return Disposition::Closed;
        }

        let ack = flow.ack();
        let reply = flow.emit(ack);
        self.replies.push_back(reply);
        Disposition::Forwarded
    }

    /// Segments for a flow the client already closed. `None` lets a new SYN
    /// on the same key through.
    fn process_closed(&mut self, key: FlowKey, segment: &TcpSegment) -> Option<Disposition> {
        let closed = self.closed.get_mut(&key)?;

        if segment.flags.syn() && !segment.flags.ack() {
            self.closed.remove(&key);
            return None;
        }

        if segment.flags.fin() && !segment.flags.rst() {
            tracing::trace!("NAT: TCP {key} FIN retransmitted after close");
            let reply = closed.emit();
            self.replies.push_back(reply);
            return Some(Disposition::FinAckResent);
        }

        let final_ack = segment.flags.ack() && segment.ack == closed.fin_ack.seq.wrapping_add(1);
        if segment.flags.rst() || final_ack {
            self.closed.remove(&key);
        }
        Some(Disposition::Closed)
    }

    /// Wait for the next event from a dial or relay task.
    pub async fn next_event(&mut self) -> Option<FlowEvent> {
        self.events_rx.recv().await
    }

    /// Apply an event, queueing any replies it produces.
    pub fn handle_event(&mut self, event: FlowEvent) {
        let FlowEvent { flow_id, key, kind } = event;
        match kind {
            FlowEventKind::Connected(connection) => self.on_connected(flow_id, key, connection),
            FlowEventKind::ConnectFailed(e) => self.on_connect_failed(flow_id, key, e),
            FlowEventKind::Data(data) => {
                let Some(flow) = live_flow(&mut self.flows, flow_id, &key) else {
                    return;
                };
                tracing::trace!("NAT: TCP {key} {} bytes downstream", data.len());
                for segment in flow.on_data(&data) {
                    let reply = flow.emit(segment);
                    self.replies.push_back(reply);
                }
            }
            FlowEventKind::End => {
                let Some(flow) = live_flow(&mut self.flows, flow_id, &key) else {
                    return;
                };
                tracing::debug!("NAT: TCP {key} closed by {}", flow.upstream);
                let fin_ack = flow.on_end();
                let reply = flow.emit(fin_ack);
                self.replies.push_back(reply);
                if let Some(flow) = self.flows.remove(&key) {
                    flow.abort();
                }
            }
            FlowEventKind::Error(e) => {
                let Some(flow) = live_flow(&mut self.flows, flow_id, &key) else {
                    return;
                };
                tracing::debug!("NAT: TCP {key} upstream error: {e}");
                let rst = flow.on_error();
                let reply = flow.emit(rst);
                self.replies.push_back(reply);
                if let Some(flow) = self.flows.remove(&key) {
                    flow.abort();
                }
            }
        }
    }

    fn take_pending(&mut self, flow_id: u64, key: &FlowKey) -> Option<PendingDial> {
        if self.pending.get(key)?.id != flow_id {
            return None;
        }
        self.pending.remove(key)
    }

    fn on_connected(&mut self, flow_id: u64, key: FlowKey, connection: BoxConnection) {
        let Some(pending) = self.take_pending(flow_id, &key) else {
            tracing::trace!("NAT: TCP {key} stale connect, dropping connection");
            return;
        };

        tracing::debug!(
            "NAT: TCP connect to {} succeeded after {:?}",
            pending.upstream,
            pending.started.elapsed()
        );

        let budget = Arc::new(Semaphore::new(RECV_WINDOW));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(relay(
            flow_id,
            key,
            connection,
            commands_rx,
            budget.clone(),
            self.events_tx.clone(),
        ));

        let our_isn: u32 = rand::random();
        let mss = pending.client_mss.map_or(TCP_MSS, |mss| mss.clamp(1, TCP_MSS));

        let mut flow = Flow {
            id: flow_id,
            key,
            peer: pending.peer,
            upstream: pending.upstream,
            state: FlowState::Connected,
            client_isn: pending.client_isn,
            client_next_seq: pending.client_isn.wrapping_add(1),
            last_seen_seq: pending.client_isn,
            our_isn,
            delivered_seq: our_isn.wrapping_add(1),
            client_ack: our_isn,
            window: pending.client_window,
            mss,
            packet_id: rand::random(),
            last_activity: Instant::now(),
            budget,
            commands: Some(commands_tx),
            task,
        };

        // SYN payload that does not fit is left for the client to resend
        if !pending.syn_payload.is_empty() && flow.reserve(pending.syn_payload.len()) {
            flow.write(&pending.syn_payload);
            flow.client_next_seq = flow
                .client_next_seq
                .wrapping_add(pending.syn_payload.len() as u32);
        }

        let syn_ack = flow.syn_ack();
        let reply = flow.emit(syn_ack);
        self.replies.push_back(reply);
        self.flows.insert(key, flow);
    }

    fn on_connect_failed(&mut self, flow_id: u64, key: FlowKey, error: io::Error) {
        let Some(pending) = self.take_pending(flow_id, &key) else {
            return;
        };
        tracing::debug!("NAT: TCP connect to {} failed: {error}", pending.upstream);
        let ack = pending
            .client_isn
            .wrapping_add(1)
            .wrapping_add(pending.syn_payload.len() as u32);
        self.queue_reset(pending.peer, &key, ack);
    }

    /// RST+ACK for a flow that has no entry.
    fn queue_reset(&mut self, peer: EconetAddr, key: &FlowKey, ack: u32) {
        let segment = TcpSegment::new(key.dst_port, key.src_port, 0, ack, TcpFlags::RST | TcpFlags::ACK);
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        self.replies.push_back(reply(peer, key, id, &segment));
    }

    /// Close flows idle for longer than the idle timeout.
    pub fn housekeeping(&mut self) {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| now.duration_since(flow.last_activity) > idle_timeout)
            .map(|(key, _)| *key)
            .collect();

        for key in expired {
            let Some(mut flow) = self.flows.remove(&key) else {
                continue;
            };
            tracing::debug!(
                "NAT: Cleaning up TCP connection {key} (idle for {:?})",
                now.duration_since(flow.last_activity)
            );
            let fin_ack = flow.on_close();
            let reply = flow.emit(fin_ack);
            self.replies.push_back(reply);
            flow.abort();
        }

        self.closed.retain(|_, closed| closed.until > now);
    }

    /// Next queued reply, oldest first.
    pub fn next_reply(&mut self) -> Option<Reply> {
        self.replies.pop_front()
    }

    pub fn flow(&self, key: &FlowKey) -> Option<&Flow> {
        self.flows.get(key)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Connected flows and in-flight dials, sorted by key.
    pub fn dump(&self) -> Vec<FlowSnapshot> {
        let now = Instant::now();
        let mut rows: Vec<FlowSnapshot> = self.flows.values().map(|flow| flow.snapshot(now)).collect();
        rows.extend(self.pending.iter().map(|(key, pending)| FlowSnapshot {
            key: *key,
            peer: pending.peer,
            upstream: pending.upstream,
            state: FlowState::Connecting,
            client_next_seq: pending.client_isn.wrapping_add(1),
            delivered_seq: 0,
            client_ack: 0,
            window: pending.client_window,
            idle: now.duration_since(pending.started),
        }));
        rows.sort_by_key(|row| row.key);
        rows
    }
}

impl Drop for ConnectionTracker {
    fn drop(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.task.abort();
        }
        for (_, flow) in self.flows.drain() {
            flow.abort();
        }
    }
}

/// The flow for `key`, unless it has been replaced since `flow_id` was issued.
fn live_flow<'a>(
    flows: &'a mut HashMap<FlowKey, Flow>,
    flow_id: u64,
    key: &FlowKey,
) -> Option<&'a mut Flow> {
    flows.get_mut(key).filter(|flow| flow.id == flow_id)
}

/// Build the IPv4 datagram carrying `segment` from the server side of `key`
/// back to the client.
fn reply(peer: EconetAddr, key: &FlowKey, id: u16, segment: &TcpSegment) -> Reply {
    let payload = segment.encode(key.dst_ip, key.src_ip);
    let datagram = Ipv4Header::new(key.dst_ip, key.src_ip, IpProtocol::Tcp, payload.len())
        .with_identification(id)
        .encode(&payload);
    tracing::trace!(
        "NAT: TCP {} <- {:?} seq={} ack={} len={}",
        key.client(),
        segment.flags,
        segment.seq,
        segment.ack,
        segment.payload.len()
    );
    Reply {
        peer,
        client_ip: key.src_ip,
        datagram,
    }
}

/// Owns the outbound connection of one flow.
///
/// Writes arrive in order on `commands`; a closed command channel flushes and
/// shuts the connection down. Reads are reported to the tracker until EOF or
/// an error.
async fn relay(
    flow_id: u64,
    key: FlowKey,
    connection: BoxConnection,
    mut commands: mpsc::UnboundedReceiver<Vec<u8>>,
    budget: Arc<Semaphore>,
    events: mpsc::Sender<FlowEvent>,
) {
    let (mut reader, mut writer) = tokio::io::split(connection);
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    let kind = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        break FlowEventKind::Error(e);
                    }
                    budget.add_permits(data.len());
                }
                None => {
                    let _ = writer.shutdown().await;
                    return;
                }
            },
            result = reader.read(&mut buf) => match result {
                Ok(0) => break FlowEventKind::End,
                Ok(n) => {
                    let event = FlowEvent {
                        flow_id,
                        key,
                        kind: FlowEventKind::Data(buf[..n].to_vec()),
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => break FlowEventKind::Error(e),
            },
        }
    };

    let _ = events.send(FlowEvent { flow_id, key, kind }).await;
}

/// True if `a` is before `b` in sequence space.
fn seq_before(a: u32, b: u32) -> bool {
    TcpSeqNumber(a as i32) < TcpSeqNumber(b as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey::new(
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 50), 4000),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 23),
        )
    }

    fn flow(mss: u16) -> Flow {
        let (commands, _) = mpsc::unbounded_channel();
        Flow {
            id: 1,
            key: key(),
            peer: EconetAddr::new(1, 50),
            upstream: SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 23),
            state: FlowState::Connected,
            client_isn: 1000,
            client_next_seq: 1001,
            last_seen_seq: 1000,
            our_isn: 5000,
            delivered_seq: 5001,
            client_ack: 5000,
            window: 2048,
            mss,
            packet_id: 0,
            last_activity: Instant::now(),
            budget: Arc::new(Semaphore::new(RECV_WINDOW)),
            commands: Some(commands),
            task: tokio::spawn(async {}),
        }
    }

    #[tokio::test]
    async fn data_is_split_at_mss_and_advances_delivered_seq() {
        let mut flow = flow(4);
        let segments = flow.on_data(b"0123456789");

        let sizes: Vec<usize> = segments.iter().map(|s| s.payload.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        let seqs: Vec<u32> = segments.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![5001, 5005, 5009]);
        assert!(segments.iter().all(|s| s.flags == TcpFlags::PSH | TcpFlags::ACK));
        assert!(segments.iter().all(|s| s.ack == 1001));
        assert_eq!(flow.delivered_seq, 5011);
        // The outbound stream counter is untouched.
        assert_eq!(flow.client_next_seq, 1001);
    }

    #[tokio::test]
    async fn syn_ack_carries_isn_and_mss() {
        let flow = flow(TCP_MSS);
        let syn_ack = flow.syn_ack();
        assert_eq!(syn_ack.seq, 5000);
        assert_eq!(syn_ack.ack, 1001);
        assert_eq!(syn_ack.mss(), Some(TCP_MSS));
        assert_eq!(syn_ack.src_port, 23);
        assert_eq!(syn_ack.dst_port, 4000);
    }

    #[tokio::test]
    async fn close_and_error_transitions() {
        let mut closing = flow(TCP_MSS);
        let fin = closing.on_end();
        assert_eq!(fin.flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(fin.seq, 5001);
        assert_eq!(closing.delivered_seq, 5002);
        assert_eq!(closing.state(), FlowState::Closing);

        let mut failed = flow(TCP_MSS);
        let rst = failed.on_error();
        assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(failed.state(), FlowState::Error);
    }

    #[tokio::test]
    async fn emitted_reply_is_addressed_to_client() {
        let mut flow = flow(TCP_MSS);
        let ack = flow.ack();
        let reply = flow.emit(ack);
        let second = flow.emit(flow.ack());

        let datagram = Ipv4Datagram::decode(&reply.datagram).unwrap();
        assert_eq!(datagram.header().src, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(datagram.header().dst, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(datagram.header().ttl, crate::ipv4::DEFAULT_TTL);
        assert!(datagram.checksum_valid());
        assert_eq!(reply.client_ip, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(reply.peer, EconetAddr::new(1, 50));

        let next = Ipv4Datagram::decode(&second.datagram).unwrap();
        assert_eq!(next.header().identification, 1);
    }

    #[tokio::test]
    async fn window_shrinks_with_reserved_bytes() {
        let flow = flow(TCP_MSS);
        assert_eq!(flow.ack().window, 8192);

        assert!(flow.reserve(8000));
        assert_eq!(flow.ack().window, 192);
        assert!(!flow.reserve(193));
        assert!(flow.reserve(192));
        assert_eq!(flow.ack().window, 0);

        flow.budget.add_permits(1000);
        assert_eq!(flow.ack().window, 1000);
    }

    #[tokio::test]
    async fn stale_acknowledgment_does_not_move_client_ack_back() {
        let mut flow = flow(TCP_MSS);
        let mut segment = TcpSegment::new(4000, 23, 1001, 5101, TcpFlags::ACK);
        segment.window = 4096;
        flow.observe(&segment);
        assert_eq!(flow.client_ack, 5101);
        assert_eq!(flow.window, 4096);

        segment.ack = 5050;
        segment.window = 1024;
        flow.observe(&segment);
        assert_eq!(flow.client_ack, 5101);
        assert_eq!(flow.window, 1024);
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_before(1, 2));
        assert!(seq_before(u32::MAX, 0));
        assert!(!seq_before(0, u32::MAX));
    }
}
