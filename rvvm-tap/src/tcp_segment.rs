//! TCP segment parsing/building: the wire-format half of the TCP state
//! machine in `tcp.rs`. Split out so the state machine reads as sequence
//! number bookkeeping rather than byte-offset arithmetic.

use crate::checksum::transport_checksum;
use crate::ethernet::{self, ETHERTYPE_IPV4, IP_PROTO_TCP};

pub const FLAG_FIN: u8 = 1 << 0;
pub const FLAG_SYN: u8 = 1 << 1;
pub const FLAG_RST: u8 = 1 << 2;
pub const FLAG_PSH: u8 = 1 << 3;
pub const FLAG_ACK: u8 = 1 << 4;

pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

pub fn parse(frame: &[u8]) -> Option<TcpSegment<'_>> {
    if ethernet::ethertype(frame) != ETHERTYPE_IPV4 || ethernet::ip_protocol(frame) != IP_PROTO_TCP {
        return None;
    }
    let tcp_start = ethernet::ETH_HDR_LEN + ethernet::ip_header_len(frame);
    if frame.len() < tcp_start + 20 {
        return None;
    }
    let data_offset = ((frame[tcp_start + 12] >> 4) as usize) * 4;
    let payload_start = tcp_start + data_offset;
    if payload_start > frame.len() {
        return None;
    }
    Some(TcpSegment {
        src_port: u16::from_be_bytes([frame[tcp_start], frame[tcp_start + 1]]),
        dst_port: u16::from_be_bytes([frame[tcp_start + 2], frame[tcp_start + 3]]),
        seq: u32::from_be_bytes(frame[tcp_start + 4..tcp_start + 8].try_into().unwrap()),
        ack: u32::from_be_bytes(frame[tcp_start + 8..tcp_start + 12].try_into().unwrap()),
        flags: frame[tcp_start + 13],
        window: u16::from_be_bytes([frame[tcp_start + 14], frame[tcp_start + 15]]),
        payload: &frame[payload_start..],
    })
}

/// Builds a complete Ethernet+IPv4+TCP frame, guest-bound (the NAT is
/// always the "server" side of this segment from the guest's view).
#[allow(clippy::too_many_arguments)]
pub fn build(
    eth_dst: ethernet::Mac,
    eth_src: ethernet::Mac,
    ip_src: ethernet::Ipv4,
    ip_dst: ethernet::Ipv4,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let tcp_len = 20 + payload.len();
    let ip_len = 20 + tcp_len;
    let mut frame = vec![0u8; ethernet::ETH_HDR_LEN + ip_len];

    ethernet::write_eth_header(&mut frame, eth_dst, eth_src, ETHERTYPE_IPV4);

    let ip = ethernet::ETH_HDR_LEN;
    frame[ip] = 0x45;
    frame[ip + 2..ip + 4].copy_from_slice(&(ip_len as u16).to_be_bytes());
    frame[ip + 6..ip + 8].copy_from_slice(&[0x40, 0]);
    frame[ip + 8] = 64;
    frame[ip + 9] = IP_PROTO_TCP;
    frame[ip + 12..ip + 16].copy_from_slice(&ip_src);
    frame[ip + 16..ip + 20].copy_from_slice(&ip_dst);
    let ip_sum = crate::checksum::internet_checksum(&frame[ip..ip + 20]);
    frame[ip + 10] = (ip_sum >> 8) as u8;
    frame[ip + 11] = (ip_sum & 0xff) as u8;

    let tcp = ip + 20;
    frame[tcp..tcp + 2].copy_from_slice(&src_port.to_be_bytes());
    frame[tcp + 2..tcp + 4].copy_from_slice(&dst_port.to_be_bytes());
    frame[tcp + 4..tcp + 8].copy_from_slice(&seq.to_be_bytes());
    frame[tcp + 8..tcp + 12].copy_from_slice(&ack.to_be_bytes());
    frame[tcp + 12] = 5 << 4; // data offset: 5 words, no options
    frame[tcp + 13] = flags;
    frame[tcp + 14..tcp + 16].copy_from_slice(&window.to_be_bytes());
    frame[tcp + 20..tcp + 20 + payload.len()].copy_from_slice(payload);

    let tcp_sum = transport_checksum(ip_src, ip_dst, IP_PROTO_TCP, &frame[tcp..tcp + tcp_len]);
    frame[tcp + 16..tcp + 18].copy_from_slice(&tcp_sum.to_be_bytes());

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_parse() {
        let frame = build([1; 6], [2; 6], [10, 0, 0, 1], [10, 0, 0, 2], 2022, 22, 100, 200, FLAG_SYN | FLAG_ACK, 65535, b"hi");
        let seg = parse(&frame).unwrap();
        assert_eq!(seg.src_port, 2022);
        assert_eq!(seg.dst_port, 22);
        assert_eq!(seg.seq, 100);
        assert_eq!(seg.ack, 200);
        assert_eq!(seg.flags, FLAG_SYN | FLAG_ACK);
        assert_eq!(seg.payload, b"hi");
    }
}
