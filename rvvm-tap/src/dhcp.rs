//! Synthetic DHCP server (§4.8): answers DISCOVER with OFFER and REQUEST
//! with ACK, both carrying `yiaddr = 192.168.0.100`, a /24 subnet, gateway
//! `192.168.0.1`, DNS `{1.1.1.1, 8.8.8.8}`, and a 24-hour lease.
//!
//! The teacher's `net_libp2p.rs` has no DHCP responder at all (its guest
//! kernel configures a static address); this module is built from spec.md
//! §4.8's field list directly, in the same manual-byte-layout idiom the
//! teacher uses for ARP/ICMP.

use crate::ethernet::{self, Ipv4, Mac};
use crate::udp;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

pub const GUEST_IP: Ipv4 = [192, 168, 0, 100];
pub const GATEWAY_IP: Ipv4 = [192, 168, 0, 1];
pub const SUBNET_MASK: Ipv4 = [255, 255, 255, 0];
pub const DNS_SERVERS: [Ipv4; 2] = [[1, 1, 1, 1], [8, 8, 8, 8]];
pub const LEASE_SECONDS: u32 = 86_400;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const OPT_MSG_TYPE: u8 = 53;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_LEASE_TIME: u8 = 51;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

const MSG_DISCOVER: u8 = 1;
const MSG_OFFER: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_ACK: u8 = 5;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;

/// Parsed fields of an inbound DHCPDISCOVER/DHCPREQUEST the responder
/// cares about.
pub struct ClientRequest {
    pub message_type: u8,
    pub xid: [u8; 4],
    pub chaddr: Mac,
}

fn find_option(options: &[u8], code: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i + 1 < options.len() {
        let opt = options[i];
        if opt == OPT_END || opt == 0 {
            break;
        }
        let len = options[i + 1] as usize;
        let start = i + 2;
        if start + len > options.len() {
            break;
        }
        if opt == code {
            return Some(&options[start..start + len]);
        }
        i = start + len;
    }
    None
}

/// True when `frame` is addressed to the DHCP server port from a
/// not-yet-configured client, per spec.md §4.8's "src IP 0.0.0.0" rule.
pub fn is_dhcp_request(frame: &[u8]) -> bool {
    match udp::parse(frame) {
        Some((hdr, payload)) => {
            hdr.dst_port == DHCP_SERVER_PORT && ethernet::ip_src(frame) == [0, 0, 0, 0] && payload.len() >= 240
        }
        None => false,
    }
}

pub fn parse_request(frame: &[u8]) -> Option<ClientRequest> {
    let (_, payload) = udp::parse(frame)?;
    if payload.len() < 240 || payload[0] != BOOTREQUEST || payload[236..240] != MAGIC_COOKIE {
        return None;
    }
    let xid: [u8; 4] = payload[4..8].try_into().ok()?;
    let chaddr: Mac = payload[28..34].try_into().ok()?;
    let message_type = find_option(&payload[240..], OPT_MSG_TYPE)?.first().copied()?;
    Some(ClientRequest { message_type, xid, chaddr })
}

fn build_bootp_reply(req: &ClientRequest, msg_type: u8) -> Vec<u8> {
    let mut p = vec![0u8; 240];
    p[0] = BOOTREPLY;
    p[1] = 1; // htype: ethernet
    p[2] = 6; // hlen
    p[4..8].copy_from_slice(&req.xid);
    p[16..20].copy_from_slice(&GUEST_IP); // yiaddr
    p[20..24].copy_from_slice(&GATEWAY_IP); // siaddr
    p[28..34].copy_from_slice(&req.chaddr);
    p[236..240].copy_from_slice(&MAGIC_COOKIE);

    let mut opts = Vec::new();
    opts.extend_from_slice(&[OPT_MSG_TYPE, 1, msg_type]);
    opts.extend_from_slice(&[OPT_SERVER_ID, 4]);
    opts.extend_from_slice(&GATEWAY_IP);
    opts.extend_from_slice(&[OPT_LEASE_TIME, 4]);
    opts.extend_from_slice(&LEASE_SECONDS.to_be_bytes());
    opts.extend_from_slice(&[OPT_SUBNET_MASK, 4]);
    opts.extend_from_slice(&SUBNET_MASK);
    opts.extend_from_slice(&[OPT_ROUTER, 4]);
    opts.extend_from_slice(&GATEWAY_IP);
    opts.extend_from_slice(&[OPT_DNS, 8]);
    opts.extend_from_slice(&DNS_SERVERS[0]);
    opts.extend_from_slice(&DNS_SERVERS[1]);
    opts.push(OPT_END);

    p.extend_from_slice(&opts);
    p
}

/// Builds the OFFER (in response to DISCOVER) or ACK (in response to
/// REQUEST) frame, addressed to the IPv4 broadcast address since the
/// client has no address yet.
pub fn build_reply(req: &ClientRequest, client_mac: Mac, gateway_mac: Mac) -> Vec<u8> {
    let msg_type = if req.message_type == MSG_DISCOVER { MSG_OFFER } else { MSG_ACK };
    let payload = build_bootp_reply(req, msg_type);
    udp::build_frame(
        client_mac,
        gateway_mac,
        GATEWAY_IP,
        [255, 255, 255, 255],
        DHCP_SERVER_PORT,
        DHCP_CLIENT_PORT,
        &payload,
    )
}

pub fn is_discover(req: &ClientRequest) -> bool {
    req.message_type == MSG_DISCOVER
}

pub fn is_request(req: &ClientRequest) -> bool {
    req.message_type == MSG_REQUEST
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_discover() -> Vec<u8> {
        let mut payload = vec![0u8; 240];
        payload[0] = BOOTREQUEST;
        payload[1] = 1;
        payload[2] = 6;
        payload[4..8].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        payload[28..34].copy_from_slice(&[0x52, 0x54, 0, 0, 0, 9]);
        payload[236..240].copy_from_slice(&MAGIC_COOKIE);
        payload.extend_from_slice(&[OPT_MSG_TYPE, 1, MSG_DISCOVER, OPT_END]);
        udp::build_frame([0xff; 6], [0x52, 0x54, 0, 0, 0, 9], [0, 0, 0, 0], [255, 255, 255, 255], DHCP_CLIENT_PORT, DHCP_SERVER_PORT, &payload)
    }

    #[test]
    fn discover_is_recognized_and_answered_with_offer() {
        let frame = sample_discover();
        assert!(is_dhcp_request(&frame));
        let req = parse_request(&frame).unwrap();
        assert!(is_discover(&req));
        let reply = build_reply(&req, req.chaddr, [0x52, 0x54, 0, 0xaa, 0xbb, 0xcc]);
        let (_, reply_payload) = udp::parse(&reply).unwrap();
        assert_eq!(&reply_payload[16..20], &GUEST_IP);
        let opt_msg = find_option(&reply_payload[240..], OPT_MSG_TYPE).unwrap();
        assert_eq!(opt_msg, &[MSG_OFFER]);
        let dns = find_option(&reply_payload[240..], OPT_DNS).unwrap();
        assert_eq!(&dns[0..4], &[1, 1, 1, 1]);
        assert_eq!(&dns[4..8], &[8, 8, 8, 8]);
        let lease = find_option(&reply_payload[240..], OPT_LEASE_TIME).unwrap();
        assert_eq!(u32::from_be_bytes(lease.try_into().unwrap()), LEASE_SECONDS);
    }
}
