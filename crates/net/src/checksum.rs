//! Internet checksum (RFC 1071) helpers shared by the IPv4 and TCP codecs.

use smoltcp::wire::IpProtocol;
use std::net::Ipv4Addr;

/// Add `data` to a running ones'-complement sum.
///
/// Odd-length input is padded with a zero byte. The sum is kept unfolded so
/// several regions can be accumulated before [`finish`].
pub(crate) fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Fold the carries and take the ones' complement.
pub(crate) fn finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of a single contiguous region.
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    finish(accumulate(0, data))
}

/// Running sum of the IPv4 pseudo-header used by TCP and UDP.
pub(crate) fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: IpProtocol, len: u16) -> u32 {
    let mut sum = accumulate(0, &src.octets());
    sum = accumulate(sum, &dst.octets());
    sum += u8::from(protocol) as u32;
    sum += len as u32;
    sum
}
