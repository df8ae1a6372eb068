//! UDP header parsing/building shared by the DHCP responder and the
//! general UDP port-map NAT (§4.8).

use crate::checksum::transport_checksum;
use crate::ethernet::{self, ETHERTYPE_IPV4, IP_PROTO_UDP};

pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

/// Parses the UDP header at the IP payload offset implied by `ihl`.
/// Returns `None` if the frame is too short or not actually UDP.
pub fn parse(frame: &[u8]) -> Option<(UdpHeader, &[u8])> {
    if ethernet::ethertype(frame) != ETHERTYPE_IPV4 || ethernet::ip_protocol(frame) != IP_PROTO_UDP {
        return None;
    }
    let udp_start = ethernet::ETH_HDR_LEN + ethernet::ip_header_len(frame);
    if frame.len() < udp_start + 8 {
        return None;
    }
    let src_port = u16::from_be_bytes([frame[udp_start], frame[udp_start + 1]]);
    let dst_port = u16::from_be_bytes([frame[udp_start + 2], frame[udp_start + 3]]);
    let udp_len = u16::from_be_bytes([frame[udp_start + 4], frame[udp_start + 5]]) as usize;
    let payload_start = udp_start + 8;
    let payload_end = (udp_start + udp_len).min(frame.len());
    if payload_start > payload_end {
        return None;
    }
    Some((UdpHeader { src_port, dst_port }, &frame[payload_start..payload_end]))
}

/// Builds a complete Ethernet+IPv4+UDP frame with both checksums filled in.
#[allow(clippy::too_many_arguments)]
pub fn build_frame(
    eth_dst: ethernet::Mac,
    eth_src: ethernet::Mac,
    ip_src: ethernet::Ipv4,
    ip_dst: ethernet::Ipv4,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let ip_len = 20 + udp_len;
    let mut frame = vec![0u8; ethernet::ETH_HDR_LEN + ip_len];

    ethernet::write_eth_header(&mut frame, eth_dst, eth_src, ETHERTYPE_IPV4);

    let ip = ethernet::ETH_HDR_LEN;
    frame[ip] = 0x45;
    frame[ip + 1] = 0;
    frame[ip + 2..ip + 4].copy_from_slice(&(ip_len as u16).to_be_bytes());
    frame[ip + 4..ip + 6].copy_from_slice(&[0, 0]); // identification
    frame[ip + 6..ip + 8].copy_from_slice(&[0x40, 0]); // don't fragment
    frame[ip + 8] = 64; // TTL
    frame[ip + 9] = IP_PROTO_UDP;
    frame[ip + 12..ip + 16].copy_from_slice(&ip_src);
    frame[ip + 16..ip + 20].copy_from_slice(&ip_dst);
    let ip_sum = crate::checksum::internet_checksum(&frame[ip..ip + 20]);
    frame[ip + 10] = (ip_sum >> 8) as u8;
    frame[ip + 11] = (ip_sum & 0xff) as u8;

    let udp = ip + 20;
    frame[udp..udp + 2].copy_from_slice(&src_port.to_be_bytes());
    frame[udp + 2..udp + 4].copy_from_slice(&dst_port.to_be_bytes());
    frame[udp + 4..udp + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    frame[udp + 8..udp + 8 + payload.len()].copy_from_slice(payload);

    let udp_sum = transport_checksum(ip_src, ip_dst, IP_PROTO_UDP, &frame[udp..udp + udp_len]);
    // UDP checksum of zero is transmitted as all-ones (RFC 768).
    let udp_sum = if udp_sum == 0 { 0xffff } else { udp_sum };
    frame[udp + 6..udp + 8].copy_from_slice(&udp_sum.to_be_bytes());

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_parse() {
        let frame = build_frame(
            [1, 1, 1, 1, 1, 1],
            [2, 2, 2, 2, 2, 2],
            [192, 168, 0, 1],
            [192, 168, 0, 100],
            67,
            68,
            b"hello",
        );
        let (hdr, payload) = parse(&frame).unwrap();
        assert_eq!(hdr.src_port, 67);
        assert_eq!(hdr.dst_port, 68);
        assert_eq!(payload, b"hello");
    }
}
