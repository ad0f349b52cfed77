// net_common.rs — address conversion and name resolution

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use warcry_common::net::HostAddr;

pub fn host_addr_to_socket(addr: HostAddr) -> SocketAddrV4 {
    SocketAddrV4::new(addr.ip(), addr.port)
}

/// IPv4 only; the wire protocol has no room for anything larger.
pub fn socket_to_host_addr(addr: &SocketAddr) -> Option<HostAddr> {
    match addr {
        SocketAddr::V4(v4) => Some(HostAddr::from_ipv4(*v4.ip(), v4.port())),
        SocketAddr::V6(_) => None,
    }
}

/// Resolve a dotted quad or hostname to a host address.
pub fn resolve_host(name: &str) -> Option<u32> {
    if let Ok(ip) = name.parse::<Ipv4Addr>() {
        return Some(u32::from(ip));
    }
    (name, 0u16)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(u32::from(*v4.ip())),
            SocketAddr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_quad_resolves_without_dns() {
        assert_eq!(resolve_host("127.0.0.1"), Some(0x7F000001));
        assert_eq!(resolve_host("10.0.0.7"), Some(0x0A000007));
    }

    #[test]
    fn junk_does_not_resolve() {
        assert_eq!(resolve_host(""), None);
    }

    #[test]
    fn address_round_trip() {
        let addr = HostAddr::new(0xC0A80001, 6661);
        let sock = host_addr_to_socket(addr);
        assert_eq!(sock.ip(), &Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(sock.port(), 6661);
        assert_eq!(socket_to_host_addr(&SocketAddr::V4(sock)), Some(addr));
    }
}
