use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Econet port carrying IPv4 and address-resolution traffic.
pub const PORT_IP: u8 = 0xD2;

/// Flag byte of an IPv4 datagram on [`PORT_IP`].
pub const FLAG_IP_DATAGRAM: u8 = 0x81;

/// Flag byte of an address-resolution request on [`PORT_IP`].
pub const FLAG_ARP_REQUEST: u8 = 0xA1;

/// Flag byte of an address-resolution reply on [`PORT_IP`].
pub const FLAG_ARP_REPLY: u8 = 0xA2;

/// An Econet station address, written `network.station`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EconetAddr {
    pub network: u8,
    pub station: u8,
}

impl EconetAddr {
    pub const fn new(network: u8, station: u8) -> Self {
        Self { network, station }
    }
}

impl fmt::Display for EconetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.network, self.station)
    }
}

impl FromStr for EconetAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress(s.to_string());
        let (network, station) = s.split_once('.').ok_or_else(invalid)?;
        let network = network.trim().parse().map_err(|_| invalid())?;
        let station = station.trim().parse().map_err(|_| invalid())?;
        Ok(Self { network, station })
    }
}

impl TryFrom<String> for EconetAddr {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EconetAddr> for String {
    fn from(addr: EconetAddr) -> Self {
        addr.to_string()
    }
}

/// A decoded Econet packet as handed over by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EconetPacket {
    pub port: u8,
    pub flags: u8,
    pub src: EconetAddr,
    pub dst: EconetAddr,
    pub payload: Vec<u8>,
}

impl EconetPacket {
    /// Build an IPv4 datagram packet on the IP service port.
    pub fn ip_datagram(src: EconetAddr, dst: EconetAddr, payload: Vec<u8>) -> Self {
        Self {
            port: PORT_IP,
            flags: FLAG_IP_DATAGRAM,
            src,
            dst,
            payload,
        }
    }

    /// True if this packet was sent to the IP service port.
    pub fn is_ip_port(&self) -> bool {
        self.port == PORT_IP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_station() {
        let addr: EconetAddr = "1.254".parse().unwrap();
        assert_eq!(addr, EconetAddr::new(1, 254));
        assert_eq!(addr.to_string(), "1.254");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("1".parse::<EconetAddr>().is_err());
        assert!("1.256".parse::<EconetAddr>().is_err());
        assert!("a.b".parse::<EconetAddr>().is_err());
        assert!("1.2.3".parse::<EconetAddr>().is_err());
    }

    #[test]
    fn serializes_as_dotted_string() {
        let addr = EconetAddr::new(0, 100);
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"0.100\"");
        assert_eq!(
            serde_json::from_str::<EconetAddr>("\"0.100\"").unwrap(),
            addr
        );
    }

    #[test]
    fn ip_datagram_uses_service_port() {
        let packet = EconetPacket::ip_datagram(
            EconetAddr::new(1, 254),
            EconetAddr::new(1, 10),
            vec![0x45],
        );
        assert!(packet.is_ip_port());
        assert_eq!(packet.flags, FLAG_IP_DATAGRAM);
    }
}
