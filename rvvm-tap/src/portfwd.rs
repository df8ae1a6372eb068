//! Port-forward string grammar (§6): `[tcp/|udp/]host_addr=guest_addr`.
//! If neither prefix is present, both TCP and UDP are bound. Host or guest
//! may specify only a port; a guest-any host address rewrites to the
//! synthetic client IP (§4.8's `GUEST_IP`).

use crate::dhcp::GUEST_IP;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
    Both,
}

#[derive(Debug, Clone, Copy)]
pub struct PortForward {
    pub proto: Proto,
    pub host: SocketAddr,
    pub guest: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("port-forward spec {0:?} is missing '='")]
    MissingEquals(String),
    #[error("port-forward spec {0:?} has an invalid address or port")]
    BadAddress(String),
}

fn parse_side(s: &str, default_ip: Ipv4Addr) -> Result<SocketAddr, ParseError> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    // Port-only form: "2022".
    if let Ok(port) = s.parse::<u16>() {
        return Ok(SocketAddr::new(IpAddr::V4(default_ip), port));
    }
    Err(ParseError::BadAddress(s.to_string()))
}

/// Parses one `--portfwd` spec. `guest_any` is the address a bare guest
/// port resolves to (the guest's synthetic client address, §4.8).
pub fn parse(spec: &str) -> Result<PortForward, ParseError> {
    let (proto, rest) = if let Some(r) = spec.strip_prefix("tcp/") {
        (Proto::Tcp, r)
    } else if let Some(r) = spec.strip_prefix("udp/") {
        (Proto::Udp, r)
    } else {
        (Proto::Both, spec)
    };

    let eq = rest.find('=').ok_or_else(|| ParseError::MissingEquals(spec.to_string()))?;
    let (host_part, guest_part) = (&rest[..eq], &rest[eq + 1..]);

    let host = parse_side(host_part, Ipv4Addr::LOCALHOST)?;
    let guest = parse_side(guest_part, GUEST_IP.into())?;
    Ok(PortForward { proto, host, guest })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_prefixed_host_and_guest_ports() {
        let fwd = parse("tcp/127.0.0.1:2022=22").unwrap();
        assert_eq!(fwd.proto, Proto::Tcp);
        assert_eq!(fwd.host, "127.0.0.1:2022".parse().unwrap());
        assert_eq!(fwd.guest.port(), 22);
        assert_eq!(fwd.guest.ip(), IpAddr::V4(GUEST_IP.into()));
    }

    #[test]
    fn unprefixed_binds_both_protocols() {
        let fwd = parse("8080=80").unwrap();
        assert_eq!(fwd.proto, Proto::Both);
    }

    #[test]
    fn missing_equals_is_rejected() {
        assert!(parse("tcp/127.0.0.1:2022").is_err());
    }
}
