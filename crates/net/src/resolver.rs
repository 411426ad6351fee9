//! Resolution between IPv4 addresses and Econet stations.

use crate::addr_cache::AddressCache;
use crate::error::NetError;
use crate::interfaces::InterfaceTable;
use crate::routes::RouteTable;
use econet_core::EconetAddr;
use std::net::Ipv4Addr;

/// Read-only view over the gateway's address tables.
#[derive(Clone, Copy)]
pub struct AddressResolver<'a> {
    cache: &'a AddressCache,
    interfaces: &'a InterfaceTable,
    routes: &'a RouteTable,
}

impl<'a> AddressResolver<'a> {
    pub fn new(
        cache: &'a AddressCache,
        interfaces: &'a InterfaceTable,
        routes: &'a RouteTable,
    ) -> Self {
        Self {
            cache,
            interfaces,
            routes,
        }
    }

    /// Station to send a datagram for `ip` to.
    ///
    /// A learned mapping for `ip` wins. Otherwise the best route's gateway
    /// is looked up instead.
    pub fn resolve(&self, ip: Ipv4Addr) -> Result<EconetAddr, NetError> {
        if let Ok(addr) = self.cache.get_addr(ip) {
            return Ok(addr);
        }
        match self.routes.get_route(ip) {
            Some(route) => self
                .cache
                .get_addr(route.gateway)
                .map_err(|_| NetError::AddressNotFound(ip)),
            None => Err(NetError::AddressNotFound(ip)),
        }
    }

    /// Our own station on the network that reaches `ip`, directly or via
    /// the best route's gateway.
    pub fn source_for(&self, ip: Ipv4Addr) -> Result<EconetAddr, NetError> {
        if let Ok(entry) = self.interfaces.get_interface_for(ip) {
            return Ok(entry.econet_addr());
        }
        let route = self.routes.get_route(ip).ok_or(NetError::AddressNotFound(ip))?;
        self.interfaces
            .get_interface_for(route.gateway)
            .map(|entry| entry.econet_addr())
            .map_err(|_| NetError::AddressNotFound(ip))
    }

    /// IP address last learned for `addr`.
    pub fn reverse(&self, addr: EconetAddr) -> Option<Ipv4Addr> {
        self.cache.get_ip(addr.network, addr.station)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr_cache::DEFAULT_ADDRESS_TTL;

    struct Tables {
        cache: AddressCache,
        interfaces: InterfaceTable,
        routes: RouteTable,
    }

    fn tables() -> Tables {
        let mut cache = AddressCache::new();
        cache.add_entry(1, 50, Ipv4Addr::new(192, 168, 1, 50), DEFAULT_ADDRESS_TTL);
        cache.add_entry(1, 9, Ipv4Addr::new(192, 168, 1, 9), DEFAULT_ADDRESS_TTL);

        let interfaces = InterfaceTable::parse("1 254 192.168.1.254 255.255.255.0").unwrap();
        let routes = RouteTable::parse("10.0.0.0/8 192.168.1.9").unwrap();
        Tables {
            cache,
            interfaces,
            routes,
        }
    }

    #[test]
    fn resolves_learned_address() {
        let t = tables();
        let resolver = AddressResolver::new(&t.cache, &t.interfaces, &t.routes);
        assert_eq!(
            resolver.resolve(Ipv4Addr::new(192, 168, 1, 50)).unwrap(),
            EconetAddr::new(1, 50)
        );
        assert_eq!(
            resolver.reverse(EconetAddr::new(1, 50)),
            Some(Ipv4Addr::new(192, 168, 1, 50))
        );
    }

    #[test]
    fn resolves_through_route_gateway() {
        let t = tables();
        let resolver = AddressResolver::new(&t.cache, &t.interfaces, &t.routes);
        assert_eq!(
            resolver.resolve(Ipv4Addr::new(10, 1, 2, 3)).unwrap(),
            EconetAddr::new(1, 9)
        );
        assert_eq!(
            resolver.source_for(Ipv4Addr::new(10, 1, 2, 3)).unwrap(),
            EconetAddr::new(1, 254)
        );
    }

    #[test]
    fn unknown_address_fails() {
        let t = tables();
        let resolver = AddressResolver::new(&t.cache, &t.interfaces, &t.routes);
        let ip = Ipv4Addr::new(172, 16, 0, 1);
        assert!(matches!(resolver.resolve(ip), Err(NetError::AddressNotFound(got)) if got == ip));
        assert!(resolver.source_for(ip).is_err());
        assert_eq!(resolver.reverse(EconetAddr::new(9, 9)), None);
    }
}
