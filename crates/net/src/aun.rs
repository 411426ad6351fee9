//! AUN: Econet frames carried over UDP.
//!
//! Every datagram starts with an 8-byte header:
//!
//! ```text
//! 0      1      2       3      4..8
//! type | port | flags | 0    | sequence (u32, little-endian)
//! ```
//!
//! Stations are identified by their UDP endpoint; the mapping to Econet
//! addresses comes from configuration.

use crate::error::NetError;
use crate::packet_io::PacketIo;
use econet_core::{AunConfig, EconetAddr, EconetPacket};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll, ready};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;

pub const AUN_HEADER_LEN: usize = 8;

/// Econet broadcast address.
pub const BROADCAST: EconetAddr = EconetAddr::new(255, 255);

/// Increment between sequence numbers of frames we originate.
const SEQ_STEP: u32 = 4;

const MAX_FRAME_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AunType {
    Broadcast,
    Unicast,
    Ack,
    Nak,
    Immediate,
    ImmediateReply,
}

impl AunType {
    pub fn as_u8(self) -> u8 {
        match self {
            AunType::Broadcast => 1,
            AunType::Unicast => 2,
            AunType::Ack => 3,
            AunType::Nak => 4,
            AunType::Immediate => 5,
            AunType::ImmediateReply => 6,
        }
    }
}

impl TryFrom<u8> for AunType {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AunType::Broadcast),
            2 => Ok(AunType::Unicast),
            3 => Ok(AunType::Ack),
            4 => Ok(AunType::Nak),
            5 => Ok(AunType::Immediate),
            6 => Ok(AunType::ImmediateReply),
            other => Err(NetError::malformed(format!("unknown AUN frame type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AunFrame {
    pub kind: AunType,
    pub port: u8,
    pub flags: u8,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl AunFrame {
    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        if bytes.len() < AUN_HEADER_LEN {
            return Err(NetError::malformed(format!(
                "AUN frame of {} bytes is shorter than a header",
                bytes.len()
            )));
        }
        Ok(Self {
            kind: AunType::try_from(bytes[0])?,
            port: bytes[1],
            flags: bytes[2],
            seq: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            payload: bytes[AUN_HEADER_LEN..].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(AUN_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&[self.kind.as_u8(), self.port, self.flags, 0]);
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Acknowledgement for a received frame.
    pub fn ack(seq: u32) -> Self {
        Self {
            kind: AunType::Ack,
            port: 0,
            flags: 0,
            seq,
            payload: Vec::new(),
        }
    }
}

/// [`PacketIo`] over a UDP socket speaking AUN.
pub struct AunTransport {
    socket: UdpSocket,
    local: EconetAddr,
    by_endpoint: HashMap<SocketAddr, EconetAddr>,
    by_station: HashMap<EconetAddr, SocketAddr>,
    seq: u32,
    buf: Vec<u8>,
}

impl AunTransport {
    pub async fn bind(config: &AunConfig) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(config.listen).await?;
        Ok(Self::from_socket(socket, config))
    }

    /// Use an already bound socket; `config.listen` is ignored.
    pub fn from_socket(socket: UdpSocket, config: &AunConfig) -> Self {
        let mut by_endpoint = HashMap::new();
        let mut by_station = HashMap::new();
        for station in &config.stations {
            by_endpoint.insert(station.endpoint, station.address);
            by_station.insert(station.address, station.endpoint);
        }
        Self {
            socket,
            local: config.local,
            by_endpoint,
            by_station,
            seq: SEQ_STEP,
            buf: vec![0u8; MAX_FRAME_SIZE],
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(SEQ_STEP);
        seq
    }

    /// Turn a received datagram into a packet, acknowledging it if needed.
    fn accept(&self, from: SocketAddr, frame: AunFrame) -> Option<EconetPacket> {
        let Some(&src) = self.by_endpoint.get(&from) else {
            tracing::trace!("AUN: dropping frame from unknown endpoint {from}");
            return None;
        };

        let dst = match frame.kind {
            AunType::Unicast => {
                if let Err(e) = self.socket.try_send_to(&AunFrame::ack(frame.seq).encode(), from) {
                    tracing::warn!("AUN: failed to acknowledge {src}: {e}");
                }
                self.local
            }
            AunType::Broadcast => BROADCAST,
            AunType::Ack | AunType::Nak => {
                tracing::trace!("AUN: {:?} seq={} from {src}", frame.kind, frame.seq);
                return None;
            }
            AunType::Immediate | AunType::ImmediateReply => {
                tracing::debug!("AUN: ignoring immediate operation from {src}");
                return None;
            }
        };

        Some(EconetPacket {
            port: frame.port,
            flags: frame.flags,
            src,
            dst,
            payload: frame.payload,
        })
    }
}

impl PacketIo for AunTransport {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<EconetPacket>> {
        loop {
            let mut read_buf = ReadBuf::new(&mut self.buf);
            let from = ready!(self.socket.poll_recv_from(cx, &mut read_buf))?;
            let decoded = AunFrame::decode(read_buf.filled());

            match decoded {
                Ok(frame) => {
                    if let Some(packet) = self.accept(from, frame) {
                        return Poll::Ready(Ok(packet));
                    }
                }
                Err(e) => tracing::debug!("AUN: dropping datagram from {from}: {e}"),
            }
        }
    }

    fn send(&mut self, packet: &EconetPacket) -> io::Result<()> {
        if packet.dst == BROADCAST {
            let frame = AunFrame {
                kind: AunType::Broadcast,
                port: packet.port,
                flags: packet.flags,
                seq: self.next_seq(),
                payload: packet.payload.clone(),
            }
            .encode();
            for endpoint in self.by_station.values() {
                self.socket.try_send_to(&frame, *endpoint)?;
            }
            return Ok(());
        }

        let Some(&endpoint) = self.by_station.get(&packet.dst) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no AUN endpoint for station {}", packet.dst),
            ));
        };
        let frame = AunFrame {
            kind: AunType::Unicast,
            port: packet.port,
            flags: packet.flags,
            seq: self.next_seq(),
            payload: packet.payload.clone(),
        };
        tracing::trace!(
            "AUN: -> {} port={:#04x} flags={:#04x} seq={} ({} bytes)",
            packet.dst,
            frame.port,
            frame.flags,
            frame.seq,
            frame.payload.len()
        );
        self.socket.try_send_to(&frame.encode(), endpoint)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use econet_core::StationConfig;
    use std::future::poll_fn;
    use std::time::Duration;

    const STATION: EconetAddr = EconetAddr::new(1, 50);

    async fn setup() -> (AunTransport, UdpSocket) {
        let station = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = AunConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            local: EconetAddr::new(1, 254),
            stations: vec![StationConfig {
                address: STATION,
                endpoint: station.local_addr().unwrap(),
            }],
        };
        let transport = AunTransport::bind(&config).await.unwrap();
        (transport, station)
    }

    async fn recv_frame(socket: &UdpSocket) -> AunFrame {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        AunFrame::decode(&buf[..n]).unwrap()
    }

    #[test]
    fn header_layout() {
        let frame = AunFrame {
            kind: AunType::Unicast,
            port: 0xD2,
            flags: 0x81,
            seq: 0x0102_0304,
            payload: vec![0xAA],
        };
        let bytes = frame.encode();
        assert_eq!(bytes, vec![2, 0xD2, 0x81, 0, 0x04, 0x03, 0x02, 0x01, 0xAA]);
        assert_eq!(AunFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn rejects_short_and_unknown_frames() {
        assert!(AunFrame::decode(&[2, 0, 0]).is_err());
        assert!(AunFrame::decode(&[9, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn unicast_is_delivered_and_acknowledged() {
        let (mut transport, station) = setup().await;
        let frame = AunFrame {
            kind: AunType::Unicast,
            port: 0xD2,
            flags: 0x81,
            seq: 40,
            payload: b"ip".to_vec(),
        };
        station
            .send_to(&frame.encode(), transport.local_addr().unwrap())
            .await
            .unwrap();

        let packet = poll_fn(|cx| transport.poll_recv(cx)).await.unwrap();
        assert_eq!(packet.src, STATION);
        assert_eq!(packet.dst, EconetAddr::new(1, 254));
        assert_eq!(packet.port, 0xD2);
        assert_eq!(packet.payload, b"ip");

        let ack = recv_frame(&station).await;
        assert_eq!(ack.kind, AunType::Ack);
        assert_eq!(ack.seq, 40);
    }

    #[tokio::test]
    async fn unknown_endpoints_and_acks_are_skipped() {
        let (mut transport, station) = setup().await;
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = transport.local_addr().unwrap();

        let data = AunFrame {
            kind: AunType::Broadcast,
            port: 0xD2,
            flags: 0xA1,
            seq: 8,
            payload: vec![0; 8],
        };
        stranger.send_to(&data.encode(), target).await.unwrap();
        station.send_to(&AunFrame::ack(4).encode(), target).await.unwrap();
        station.send_to(&data.encode(), target).await.unwrap();

        let packet = poll_fn(|cx| transport.poll_recv(cx)).await.unwrap();
        assert_eq!(packet.src, STATION);
        assert_eq!(packet.dst, BROADCAST);
        assert_eq!(packet.flags, 0xA1);
    }

    #[tokio::test]
    async fn sends_unicast_with_increasing_sequence() {
        let (mut transport, station) = setup().await;
        let packet =
            EconetPacket::ip_datagram(EconetAddr::new(1, 254), STATION, b"reply".to_vec());

        transport.send(&packet).unwrap();
        transport.send(&packet).unwrap();

        let first = recv_frame(&station).await;
        let second = recv_frame(&station).await;
        assert_eq!(first.kind, AunType::Unicast);
        assert_eq!(first.port, 0xD2);
        assert_eq!(first.flags, 0x81);
        assert_eq!(first.payload, b"reply");
        assert_eq!(second.seq, first.seq + SEQ_STEP);
    }

    #[tokio::test]
    async fn unknown_station_is_not_found() {
        let (mut transport, _station) = setup().await;
        let packet = EconetPacket::ip_datagram(
            EconetAddr::new(1, 254),
            EconetAddr::new(9, 9),
            Vec::new(),
        );
        let err = transport.send(&packet).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
