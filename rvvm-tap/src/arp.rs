//! ARP responder (§4.8): any ARP request for an IPv4 address is answered
//! with the gateway MAC, regardless of the queried target address — the
//! guest only ever needs to resolve its default gateway.
//!
//! Grounded in `riscv-vm/src/net_libp2p.rs`'s `is_arp_request_for_gateway`
//! / `generate_arp_reply`, generalized to answer for any target (the
//! teacher only answers for its own hardcoded gateway IP).

use crate::ethernet::{self, ARP_FRAME_LEN, ETHERTYPE_ARP};

const ARP_OP_REQUEST: [u8; 2] = [0x00, 0x01];
const ARP_OP_REPLY: [u8; 2] = [0x00, 0x02];

pub fn is_arp_request(frame: &[u8]) -> bool {
    frame.len() >= ARP_FRAME_LEN && ethernet::ethertype(frame) == ETHERTYPE_ARP && frame[20..22] == ARP_OP_REQUEST
}

/// Builds the reply that answers `request` as if `gateway_mac`/`gateway_ip`
/// were always the resolvable address, per spec.md §4.8.
pub fn build_reply(request: &[u8], gateway_mac: ethernet::Mac, gateway_ip: ethernet::Ipv4) -> Vec<u8> {
    let mut reply = vec![0u8; ARP_FRAME_LEN];
    ethernet::write_eth_header(&mut reply, ethernet::src_mac(request), gateway_mac, ETHERTYPE_ARP);

    reply[14..16].copy_from_slice(&[0x00, 0x01]); // hardware type: ethernet
    reply[16..18].copy_from_slice(&[0x08, 0x00]); // protocol type: IPv4
    reply[18] = 6;
    reply[19] = 4;
    reply[20..22].copy_from_slice(&ARP_OP_REPLY);
    reply[22..28].copy_from_slice(&gateway_mac);
    reply[28..32].copy_from_slice(&gateway_ip);
    reply[32..38].copy_from_slice(&request[22..28]); // requestor hw addr
    reply[38..42].copy_from_slice(&request[28..32]); // requestor ip addr
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(sender_mac: ethernet::Mac, sender_ip: ethernet::Ipv4, target_ip: ethernet::Ipv4) -> Vec<u8> {
        let mut f = vec![0u8; ARP_FRAME_LEN];
        ethernet::write_eth_header(&mut f, [0xff; 6], sender_mac, ETHERTYPE_ARP);
        f[14..16].copy_from_slice(&[0x00, 0x01]);
        f[16..18].copy_from_slice(&[0x08, 0x00]);
        f[18] = 6;
        f[19] = 4;
        f[20..22].copy_from_slice(&ARP_OP_REQUEST);
        f[22..28].copy_from_slice(&sender_mac);
        f[28..32].copy_from_slice(&sender_ip);
        f[38..42].copy_from_slice(&target_ip);
        f
    }

    #[test]
    fn answers_any_ipv4_target_with_gateway_mac() {
        let sender_mac = [0x52, 0x54, 0x00, 0x01, 0x02, 0x03];
        let req = sample_request(sender_mac, [192, 168, 0, 100], [192, 168, 0, 1]);
        assert!(is_arp_request(&req));
        let gw_mac = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];
        let reply = build_reply(&req, gw_mac, [192, 168, 0, 1]);
        assert_eq!(ethernet::dst_mac(&reply), sender_mac);
        assert_eq!(&reply[22..28], &gw_mac);
        assert_eq!(&reply[28..32], &[192, 168, 0, 1]);
        assert_eq!(&reply[32..38], &sender_mac);
    }
}
