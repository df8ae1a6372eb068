//! Ethernet/IPv4 framing constants and small accessors shared by every
//! responder in this crate. Byte offsets follow `riscv-vm/src/net_libp2p.rs`'s
//! inline indexing (`frame[12..14]` for ethertype, `frame[26..30]` for the
//! IPv4 source, etc.) but are named here instead of left as magic numbers.

pub const ETH_HDR_LEN: usize = 14;
pub const ARP_FRAME_LEN: usize = 42;

pub const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];
pub const ETHERTYPE_ARP: [u8; 2] = [0x08, 0x06];
pub const ETHERTYPE_IPV6: [u8; 2] = [0x86, 0xdd];

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

pub type Mac = [u8; 6];
pub type Ipv4 = [u8; 4];

/// The virtual gateway's own MAC, matching `net_libp2p.rs`'s hardcoded
/// `GATEWAY_MAC`. The guest's MAC has no fixed value; it is learned from
/// the source address of whatever frame it sends first.
pub const GATEWAY_MAC: Mac = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

pub fn dst_mac(frame: &[u8]) -> Mac {
    frame[0..6].try_into().unwrap()
}

pub fn src_mac(frame: &[u8]) -> Mac {
    frame[6..12].try_into().unwrap()
}

pub fn ethertype(frame: &[u8]) -> [u8; 2] {
    [frame[12], frame[13]]
}

/// IHL in bytes, from the low nibble of the first IPv4 header byte.
pub fn ip_header_len(frame: &[u8]) -> usize {
    ((frame[ETH_HDR_LEN] & 0x0f) as usize) * 4
}

pub fn ip_protocol(frame: &[u8]) -> u8 {
    frame[ETH_HDR_LEN + 9]
}

pub fn ip_src(frame: &[u8]) -> Ipv4 {
    frame[ETH_HDR_LEN + 12..ETH_HDR_LEN + 16].try_into().unwrap()
}

pub fn ip_dst(frame: &[u8]) -> Ipv4 {
    frame[ETH_HDR_LEN + 16..ETH_HDR_LEN + 20].try_into().unwrap()
}

pub fn is_broadcast(ip: Ipv4) -> bool {
    ip == [255, 255, 255, 255]
}

pub fn is_multicast(ip: Ipv4) -> bool {
    (224..=239).contains(&ip[0])
}

pub fn is_loopback(ip: Ipv4) -> bool {
    ip[0] == 127
}

/// Writes an Ethernet header in place: dst, src, ethertype.
pub fn write_eth_header(buf: &mut [u8], dst: Mac, src: Mac, ethertype: [u8; 2]) {
    buf[0..6].copy_from_slice(&dst);
    buf[6..12].copy_from_slice(&src);
    buf[12..14].copy_from_slice(&ethertype);
}
