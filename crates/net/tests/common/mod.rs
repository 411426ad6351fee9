#![allow(dead_code)]

//! Shared fixtures: an in-memory dialer and builders for client segments.

use econet_core::EconetAddr;
use econet_net::{
    BoxConnection, Dialer, Ipv4Datagram, Ipv4Header, NatTable, TcpFlags, TcpOption, TcpSegment,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Packet, TcpPacket};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};

pub const CLIENT_STATION: EconetAddr = EconetAddr::new(1, 50);
pub const GATEWAY_STATION: EconetAddr = EconetAddr::new(1, 254);
pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);
pub const CLIENT_PORT: u16 = 4000;
pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const SERVER_PORT: u16 = 23;
pub const INTERNAL: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 1), 23);
pub const CLIENT_ISN: u32 = 1000;

pub const NAT_RULES: &str = "192.168.1.1 192.168.0.1 200 23\n";
pub const INTERFACES: &str = "1 254 192.168.1.254 255.255.255.0\n";

pub fn nat_table() -> NatTable {
    NatTable::parse(NAT_RULES).expect("valid NAT rules")
}

/// A dial waiting for the test to decide its outcome.
pub struct DialRequest {
    pub addr: SocketAddrV4,
    respond: oneshot::Sender<io::Result<BoxConnection>>,
}

impl DialRequest {
    /// Complete the dial; returns the server end of the connection.
    pub fn connect(self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let _ = self.respond.send(Ok(Box::new(client)));
        server
    }

    pub fn refuse(self) {
        let _ = self.respond.send(Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        )));
    }
}

/// [`Dialer`] that hands every dial to the test.
pub struct FakeDialer {
    requests: mpsc::UnboundedSender<DialRequest>,
    dials: Arc<AtomicUsize>,
}

pub struct DialerHandle {
    requests: mpsc::UnboundedReceiver<DialRequest>,
    dials: Arc<AtomicUsize>,
}

pub fn fake_dialer() -> (Arc<FakeDialer>, DialerHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dials = Arc::new(AtomicUsize::new(0));
    (
        Arc::new(FakeDialer {
            requests: tx,
            dials: dials.clone(),
        }),
        DialerHandle {
            requests: rx,
            dials,
        },
    )
}

impl Dialer for FakeDialer {
    fn dial(&self, addr: SocketAddrV4) -> BoxFuture<'static, io::Result<BoxConnection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (respond, outcome) = oneshot::channel();
        let _ = self.requests.send(DialRequest { addr, respond });
        async move {
            outcome.await.unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, "dial dropped"))
            })
        }
        .boxed()
    }
}

impl DialerHandle {
    pub async fn next_request(&mut self) -> DialRequest {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("timed out waiting for dial")
            .expect("dialer dropped")
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

/// Encoded IPv4 datagram carrying a client segment to the NAT'd server.
pub fn client_bytes(flags: TcpFlags, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    client_bytes_from(CLIENT_PORT, flags, seq, ack, payload)
}

pub fn client_bytes_from(
    src_port: u16,
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Vec<u8> {
    let mut segment = TcpSegment::new(src_port, SERVER_PORT, seq, ack, flags);
    segment.window = 2048;
    segment.payload = payload.to_vec();
    if flags.syn() {
        segment.options.push(TcpOption::mss(536));
    }
    let tcp = segment.encode(CLIENT_IP, SERVER_IP);
    Ipv4Header::new(CLIENT_IP, SERVER_IP, IpProtocol::Tcp, tcp.len()).encode(&tcp)
}

/// Decoded form of [`client_bytes`], as handed to the tracker.
pub fn client_segment(
    flags: TcpFlags,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> (Ipv4Datagram, TcpSegment) {
    decode(&client_bytes(flags, seq, ack, payload))
}

pub fn decode(bytes: &[u8]) -> (Ipv4Datagram, TcpSegment) {
    let datagram = Ipv4Datagram::decode(bytes).expect("valid datagram");
    let segment = TcpSegment::decode(datagram.payload()).expect("valid segment");
    (datagram, segment)
}

/// Decode a datagram sent to the client, checking both checksums.
pub fn decode_reply(bytes: &[u8]) -> TcpSegment {
    let ip = Ipv4Packet::new_checked(bytes).expect("valid IPv4 packet");
    assert!(ip.verify_checksum(), "bad IPv4 header checksum");
    assert_eq!(ip.src_addr(), SERVER_IP);
    assert_eq!(ip.dst_addr(), CLIENT_IP);

    let tcp = TcpPacket::new_checked(ip.payload()).expect("valid TCP segment");
    assert!(
        tcp.verify_checksum(&IpAddress::Ipv4(SERVER_IP), &IpAddress::Ipv4(CLIENT_IP)),
        "bad TCP checksum"
    );

    let (_, segment) = decode(bytes);
    assert_eq!(segment.src_port, SERVER_PORT);
    segment
}
