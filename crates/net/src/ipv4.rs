//! IPv4 header codec for datagrams carried inside Econet frames.
//!
//! The byte layout is standard IPv4 with every multi-byte field in network
//! byte order, matching the over-the-wire convention for IP on Econet.

use crate::checksum;
use crate::error::NetError;
use smoltcp::wire::IpProtocol;
use std::net::Ipv4Addr;

/// IPv4 header size without options.
pub const IPV4_HEADER_LEN: usize = 20;

/// Largest header the 4-bit IHL can describe.
const IPV4_MAX_HEADER_LEN: usize = 60;

/// Time-to-live used for every datagram the gateway originates.
pub const DEFAULT_TTL: u8 = 64;

/// "Don't fragment" bit in the flags/fragment-offset word.
pub const FLAG_DONT_FRAGMENT: u16 = 0x4000;

/// Decoded IPv4 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in bytes (IHL * 4).
    pub header_len: u8,
    pub tos: u8,
    pub total_len: u16,
    pub identification: u16,
    /// Three flag bits and the 13-bit fragment offset.
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Raw option bytes (header_len - 20 bytes, including padding).
    pub options: Vec<u8>,
}

impl Ipv4Header {
    /// Header for a new datagram without options.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, protocol: IpProtocol, payload_len: usize) -> Self {
        Self {
            version: 4,
            header_len: IPV4_HEADER_LEN as u8,
            tos: 0,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            identification: 0,
            flags_fragment: FLAG_DONT_FRAGMENT,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src,
            dst,
            options: Vec::new(),
        }
    }

    pub fn with_identification(mut self, identification: u16) -> Self {
        self.identification = identification;
        self
    }

    /// Serialize the header followed by `payload`.
    ///
    /// Header length and total length are derived from the options and the
    /// payload, and the header checksum is computed over the result.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let options_len = self.options.len().div_ceil(4) * 4;
        let header_len = IPV4_HEADER_LEN + options_len;
        debug_assert!(
            header_len <= IPV4_MAX_HEADER_LEN,
            "{options_len} bytes of IPv4 options do not fit the header length"
        );
        let total_len = header_len + payload.len();

        let mut buf = vec![0u8; total_len];
        buf[0] = (self.version << 4) | (header_len / 4) as u8;
        buf[1] = self.tos;
        buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        buf[4..6].copy_from_slice(&self.identification.to_be_bytes());
        buf[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol.into();
        // Checksum at [10..12] - fill later
        buf[12..16].copy_from_slice(&self.src.octets());
        buf[16..20].copy_from_slice(&self.dst.octets());
        buf[IPV4_HEADER_LEN..IPV4_HEADER_LEN + self.options.len()].copy_from_slice(&self.options);
        buf[header_len..].copy_from_slice(payload);

        let checksum = checksum::internet_checksum(&buf[..header_len]);
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// True if this is a fragment (MF set or a non-zero offset).
    pub fn is_fragment(&self) -> bool {
        self.flags_fragment & 0x3FFF != 0
    }
}

/// A decoded datagram together with the exact bytes it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Datagram {
    header: Ipv4Header,
    raw: Vec<u8>,
}

impl Ipv4Datagram {
    /// Decode an IPv4 datagram.
    ///
    /// Rejects buffers shorter than a minimal header, versions other than 4,
    /// header lengths below 20 bytes or beyond the buffer, and total lengths
    /// that do not fit the buffer. Trailing bytes past the total length are
    /// kept in [`raw`](Self::raw) but excluded from the payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        if bytes.len() < IPV4_HEADER_LEN {
            return Err(NetError::malformed(format!(
                "IPv4 datagram of {} bytes is shorter than a header",
                bytes.len()
            )));
        }

        let version = bytes[0] >> 4;
        if version != 4 {
            return Err(NetError::malformed(format!("IP version {version}")));
        }

        let header_len = ((bytes[0] & 0x0F) as usize) * 4;
        if header_len < IPV4_HEADER_LEN {
            return Err(NetError::malformed(format!(
                "IPv4 header length {header_len}"
            )));
        }
        if header_len > bytes.len() {
            return Err(NetError::malformed(format!(
                "IPv4 header length {header_len} exceeds {} byte datagram",
                bytes.len()
            )));
        }

        let total_len = u16::from_be_bytes([bytes[2], bytes[3]]);
        if (total_len as usize) < header_len || (total_len as usize) > bytes.len() {
            return Err(NetError::malformed(format!(
                "IPv4 total length {total_len} with {header_len} byte header in {} byte datagram",
                bytes.len()
            )));
        }

        let header = Ipv4Header {
            version,
            header_len: header_len as u8,
            tos: bytes[1],
            total_len,
            identification: u16::from_be_bytes([bytes[4], bytes[5]]),
            flags_fragment: u16::from_be_bytes([bytes[6], bytes[7]]),
            ttl: bytes[8],
            protocol: IpProtocol::from(bytes[9]),
            checksum: u16::from_be_bytes([bytes[10], bytes[11]]),
            src: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
            dst: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
            options: bytes[IPV4_HEADER_LEN..header_len].to_vec(),
        };

        Ok(Self {
            header,
            raw: bytes.to_vec(),
        })
    }

    pub fn header(&self) -> &Ipv4Header {
        &self.header
    }

    /// Bytes following the header, up to the total length.
    pub fn payload(&self) -> &[u8] {
        &self.raw[self.header.header_len as usize..self.header.total_len as usize]
    }

    /// The complete frame exactly as received, for unmodified retransmission.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// True if the stored header checksum is valid.
    pub fn checksum_valid(&self) -> bool {
        checksum::internet_checksum(&self.raw[..self.header.header_len as usize]) == 0
    }
}
