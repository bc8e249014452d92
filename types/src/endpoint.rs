//! Network endpoints.
//!
//! The node is IPv6-only internally; IPv4 peers are represented as
//! v4-mapped IPv6 addresses. On the wire an endpoint is the 16 address
//! bytes followed by the port in big-endian.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use crate::TypeError;

/// A peer endpoint: IPv6 address + port.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    addr: Ipv6Addr,
    port: u16,
}

impl Endpoint {
    pub fn new(addr: Ipv6Addr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Canonicalize any socket address into the internal v6 form.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self {
                addr: v4.ip().to_ipv6_mapped(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self {
                addr: *v6.ip(),
                port: v6.port(),
            },
        }
    }

    pub fn loopback(port: u16) -> Self {
        Self {
            addr: Ipv6Addr::LOCALHOST,
            port,
        }
    }

    pub fn addr(&self) -> &Ipv6Addr {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V6(SocketAddrV6::new(self.addr, self.port, 0, 0))
    }

    /// Wire encoding: 16 address bytes, then the port big-endian.
    pub fn to_bytes(&self) -> [u8; 18] {
        let mut out = [0u8; 18];
        out[..16].copy_from_slice(&self.addr.octets());
        out[16..].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 18]) -> Self {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes[..16]);
        let port = u16::from_be_bytes([bytes[16], bytes[17]]);
        Self {
            addr: Ipv6Addr::from(octets),
            port,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.addr, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.addr, self.port)
    }
}

/// Parse `<ipv6>:<port>` into an endpoint.
///
/// The address part may be bracketed (`[::1]:7075`) or bare (`::1:7075`
/// is ambiguous, so bare forms split at the last colon).
pub fn parse_endpoint(input: &str) -> Result<Endpoint, TypeError> {
    let (addr_part, port_part) = match input.rfind(':') {
        Some(idx) => (&input[..idx], &input[idx + 1..]),
        None => return Err(TypeError::EndpointMissingColon),
    };
    if port_part.is_empty() {
        return Err(TypeError::EndpointMissingPort);
    }
    let port: u16 = port_part
        .parse()
        .map_err(|_| TypeError::EndpointInvalidPort)?;
    let trimmed = addr_part.trim_start_matches('[').trim_end_matches(']');
    if trimmed.is_empty() {
        return Err(TypeError::EndpointMissingAddress);
    }
    let addr: Ipv6Addr = trimmed
        .parse()
        .map_err(|_| TypeError::EndpointInvalidAddress)?;
    Ok(Endpoint::new(addr, port))
}

/// Whether an address belongs to a range that should never appear as a
/// peer: unspecified, multicast, documentation, or (unless `allow_private`
/// is set) private/link-local ranges.
pub fn reserved_address(endpoint: &Endpoint, allow_private: bool) -> bool {
    let addr = endpoint.addr();
    let octets = addr.octets();
    if endpoint.port() == 0 {
        return true;
    }
    if addr.is_unspecified() || addr.is_multicast() {
        return true;
    }
    // 2001:db8::/32 documentation range
    if octets[0] == 0x20 && octets[1] == 0x01 && octets[2] == 0x0d && octets[3] == 0xb8 {
        return true;
    }
    if let Some(v4) = addr.to_ipv4_mapped() {
        let o = v4.octets();
        // 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24 documentation ranges
        let documentation = (o[0] == 192 && o[1] == 0 && o[2] == 2)
            || (o[0] == 198 && o[1] == 51 && o[2] == 100)
            || (o[0] == 203 && o[1] == 0 && o[2] == 113);
        if documentation || v4.is_broadcast() {
            return true;
        }
        if !allow_private && (v4.is_private() || v4.is_link_local()) {
            return true;
        }
    } else if !allow_private {
        // fc00::/7 unique-local, fe80::/10 link-local
        if (octets[0] & 0xfe) == 0xfc || (octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parse_valid_endpoint() {
        let ep = parse_endpoint("::1:7075").unwrap();
        assert_eq!(ep.addr(), &Ipv6Addr::LOCALHOST);
        assert_eq!(ep.port(), 7075);
    }

    #[test]
    fn parse_bracketed_endpoint() {
        let ep = parse_endpoint("[2001:db8::1]:17075").unwrap();
        assert_eq!(ep.port(), 17075);
    }

    #[test]
    fn parse_rejects_missing_colon() {
        assert_eq!(
            parse_endpoint("no-colon-here"),
            Err(TypeError::EndpointMissingColon)
        );
    }

    #[test]
    fn parse_rejects_missing_port() {
        assert_eq!(parse_endpoint("::1:"), Err(TypeError::EndpointMissingPort));
    }

    #[test]
    fn parse_rejects_non_numeric_port() {
        assert_eq!(
            parse_endpoint("::1:port"),
            Err(TypeError::EndpointInvalidPort)
        );
    }

    #[test]
    fn parse_rejects_missing_address() {
        assert_eq!(
            parse_endpoint(":7075"),
            Err(TypeError::EndpointMissingAddress)
        );
    }

    #[test]
    fn parse_rejects_bad_address() {
        assert_eq!(
            parse_endpoint("not-an-address:7075"),
            Err(TypeError::EndpointInvalidAddress)
        );
    }

    #[test]
    fn wire_bytes_roundtrip() {
        let ep = Endpoint::new("2001:db8::2".parse().unwrap(), 54321);
        assert_eq!(Endpoint::from_bytes(&ep.to_bytes()), ep);
    }

    #[test]
    fn ipv4_maps_to_v6() {
        let v4 = SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 7075));
        let ep = Endpoint::from_socket_addr(v4);
        assert!(ep.addr().to_ipv4_mapped().is_some());
    }

    #[test]
    fn reserved_rejects_documentation_and_private() {
        let doc4 = Endpoint::from_socket_addr(SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 7075)));
        assert!(reserved_address(&doc4, true));

        let private = Endpoint::from_socket_addr(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 7075)));
        assert!(reserved_address(&private, false));
        assert!(!reserved_address(&private, true));

        let public = Endpoint::from_socket_addr(SocketAddr::from((Ipv4Addr::new(1, 1, 1, 1), 7075)));
        assert!(!reserved_address(&public, false));
    }

    #[test]
    fn reserved_rejects_zero_port_and_unspecified() {
        let zero_port = Endpoint::new("2001:470::1".parse().unwrap(), 0);
        assert!(reserved_address(&zero_port, true));
        let unspec = Endpoint::new(Ipv6Addr::UNSPECIFIED, 7075);
        assert!(reserved_address(&unspec, true));
    }
}
