//! TCP segment codec.
//!
//! Segments are parsed from the payload of an [`Ipv4Datagram`](crate::Ipv4Datagram)
//! and serialized with a checksum over the IPv4 pseudo-header. Options are
//! kept as generic (kind, data) pairs so unknown kinds survive a round trip.

use crate::checksum;
use crate::error::NetError;
use smoltcp::wire::IpProtocol;
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::{BitOr, BitOrAssign};

/// TCP header size without options.
pub const TCP_HEADER_LEN: usize = 20;

/// Maximum header length expressible by the 4-bit data offset.
const TCP_MAX_HEADER_LEN: usize = 60;

const OPTION_END: u8 = 0;
const OPTION_NOP: u8 = 1;

/// Option kind of the maximum segment size option.
pub const OPTION_MSS: u8 = 2;

/// TCP control bits, including NS from the data-offset byte.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TcpFlags(u16);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x001);
    pub const SYN: TcpFlags = TcpFlags(0x002);
    pub const RST: TcpFlags = TcpFlags(0x004);
    pub const PSH: TcpFlags = TcpFlags(0x008);
    pub const ACK: TcpFlags = TcpFlags(0x010);
    pub const URG: TcpFlags = TcpFlags(0x020);
    pub const ECE: TcpFlags = TcpFlags(0x040);
    pub const CWR: TcpFlags = TcpFlags(0x080);
    pub const NS: TcpFlags = TcpFlags(0x100);

    const NAMES: [(TcpFlags, &'static str); 9] = [
        (TcpFlags::NS, "NS"),
        (TcpFlags::CWR, "CWR"),
        (TcpFlags::ECE, "ECE"),
        (TcpFlags::URG, "URG"),
        (TcpFlags::ACK, "ACK"),
        (TcpFlags::PSH, "PSH"),
        (TcpFlags::RST, "RST"),
        (TcpFlags::SYN, "SYN"),
        (TcpFlags::FIN, "FIN"),
    ];

    pub const fn empty() -> Self {
        TcpFlags(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Build from raw bits; anything above NS is discarded.
    pub const fn from_bits_truncate(bits: u16) -> Self {
        TcpFlags(bits & 0x1FF)
    }

    pub const fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn syn(self) -> bool {
        self.contains(TcpFlags::SYN)
    }

    pub fn ack(self) -> bool {
        self.contains(TcpFlags::ACK)
    }

    pub fn fin(self) -> bool {
        self.contains(TcpFlags::FIN)
    }

    pub fn rst(self) -> bool {
        self.contains(TcpFlags::RST)
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TcpFlags {
    fn bitor_assign(&mut self, rhs: TcpFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One TCP option as (kind, value bytes).
///
/// NOP options carry no data and are encoded as a single byte. Every other
/// kind is encoded as kind, length, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOption {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl TcpOption {
    pub fn nop() -> Self {
        Self {
            kind: OPTION_NOP,
            data: Vec::new(),
        }
    }

    pub fn mss(mss: u16) -> Self {
        Self {
            kind: OPTION_MSS,
            data: mss.to_be_bytes().to_vec(),
        }
    }

    /// The data as a big-endian integer, for 1 to 4 byte values.
    pub fn value(&self) -> Option<u32> {
        match self.data.len() {
            1..=4 => Some(
                self.data
                    .iter()
                    .fold(0u32, |acc, byte| (acc << 8) | *byte as u32),
            ),
            _ => None,
        }
    }

    fn encoded_len(&self) -> usize {
        if self.kind == OPTION_NOP {
            1
        } else {
            2 + self.data.len()
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind);
        if self.kind != OPTION_NOP {
            debug_assert!(
                self.data.len() <= u8::MAX as usize - 2,
                "TCP option {} has {} data bytes",
                self.kind,
                self.data.len()
            );
            buf.push((2 + self.data.len()) as u8);
            buf.extend_from_slice(&self.data);
        }
    }
}

/// Decoded TCP segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes (data offset * 4).
    pub header_len: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub options: Vec<TcpOption>,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// A segment with no options, ready for [`encode`](Self::encode).
    pub fn new(src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: TcpFlags) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack,
            header_len: TCP_HEADER_LEN as u8,
            flags,
            window: 0,
            checksum: 0,
            urgent: 0,
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Parse a segment from an IPv4 payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        if bytes.len() < TCP_HEADER_LEN {
            return Err(NetError::malformed(format!(
                "TCP segment of {} bytes is shorter than a header",
                bytes.len()
            )));
        }

        let header_len = ((bytes[12] >> 4) as usize) * 4;
        if header_len < TCP_HEADER_LEN || header_len > bytes.len() {
            return Err(NetError::malformed(format!(
                "TCP header length {header_len} in {} byte segment",
                bytes.len()
            )));
        }

        let flags = TcpFlags::from_bits_truncate(
            (((bytes[12] & 0x01) as u16) << 8) | bytes[13] as u16,
        );

        Ok(Self {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            seq: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ack: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            header_len: header_len as u8,
            flags,
            window: u16::from_be_bytes([bytes[14], bytes[15]]),
            checksum: u16::from_be_bytes([bytes[16], bytes[17]]),
            urgent: u16::from_be_bytes([bytes[18], bytes[19]]),
            options: decode_options(&bytes[TCP_HEADER_LEN..header_len])?,
            payload: bytes[header_len..].to_vec(),
        })
    }

    /// Serialize header, options and payload, computing the checksum over
    /// the pseudo-header for `src` -> `dst`.
    pub fn encode(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut options = Vec::with_capacity(TCP_MAX_HEADER_LEN - TCP_HEADER_LEN);
        for option in &self.options {
            option.encode_into(&mut options);
        }
        // Pad with end-of-list bytes to a 32-bit boundary
        options.resize(options.len().div_ceil(4) * 4, OPTION_END);
        debug_assert!(
            TCP_HEADER_LEN + options.len() <= TCP_MAX_HEADER_LEN,
            "{} bytes of TCP options do not fit the data offset",
            options.len()
        );

        let header_len = TCP_HEADER_LEN + options.len();
        let mut buf = Vec::with_capacity(header_len + self.payload.len());
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        let bits = self.flags.bits();
        buf.push((((header_len / 4) as u8) << 4) | ((bits >> 8) as u8 & 0x01));
        buf.push(bits as u8);
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&[0, 0]); // Checksum - fill later
        buf.extend_from_slice(&self.urgent.to_be_bytes());
        buf.extend_from_slice(&options);
        buf.extend_from_slice(&self.payload);

        let sum = checksum::pseudo_header(src, dst, IpProtocol::Tcp, buf.len() as u16);
        let checksum = checksum::finish(checksum::accumulate(sum, &buf));
        buf[16..18].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// Length of the encoded options, padded, as written by [`encode`](Self::encode).
    pub fn options_len(&self) -> usize {
        let len: usize = self.options.iter().map(TcpOption::encoded_len).sum();
        len.div_ceil(4) * 4
    }

    /// Sequence space consumed by this segment (payload plus SYN/FIN).
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.flags.syn() {
            len += 1;
        }
        if self.flags.fin() {
            len += 1;
        }
        len
    }

    /// Value of the MSS option, if present.
    pub fn mss(&self) -> Option<u16> {
        self.options
            .iter()
            .find(|option| option.kind == OPTION_MSS)
            .and_then(TcpOption::value)
            .map(|value| value as u16)
    }

    /// True if the stored checksum is valid for `src` -> `dst`.
    pub fn verify_checksum(bytes: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        let sum = checksum::pseudo_header(src, dst, IpProtocol::Tcp, bytes.len() as u16);
        checksum::finish(checksum::accumulate(sum, bytes)) == 0
    }
}

fn decode_options(mut bytes: &[u8]) -> Result<Vec<TcpOption>, NetError> {
    let mut options = Vec::new();

    while let Some(&kind) = bytes.first() {
        match kind {
            OPTION_END => break,
            OPTION_NOP => {
                options.push(TcpOption::nop());
                bytes = &bytes[1..];
            }
            _ => {
                let Some(&len) = bytes.get(1) else {
                    return Err(NetError::malformed(format!(
                        "TCP option {kind} is missing its length"
                    )));
                };
                let len = len as usize;
                if len < 2 || len > bytes.len() {
                    return Err(NetError::malformed(format!(
                        "TCP option {kind} has length {len} with {} bytes left",
                        bytes.len()
                    )));
                }
                options.push(TcpOption {
                    kind,
                    data: bytes[2..len].to_vec(),
                });
                bytes = &bytes[len..];
            }
        }
    }

    Ok(options)
}
