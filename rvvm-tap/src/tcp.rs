//! TCP NAT state machine (§3's `TCP socket context`, §4.8's state machine
//! description). The teacher has no TCP NAT at all (`net_libp2p.rs` only
//! does ARP/ICMP/UDP); this is built from spec.md's description directly,
//! in the teacher's manual-byte-parsing idiom and using only `std::net`
//! non-blocking sockets (no multiplexer crate is in the teacher's
//! dependency set, so polling is a bounded per-socket try-read/try-accept
//! sweep rather than a single `net_poll_wait` syscall — see DESIGN.md).

use crate::dhcp::GATEWAY_IP;
use crate::ethernet::{self, Ipv4, Mac};
use crate::tcp_segment::{self, FLAG_ACK, FLAG_FIN, FLAG_PSH, FLAG_RST, FLAG_SYN};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

/// Bitfield direction flags (§3). `NORMAL` is the fully-open steady state.
pub mod flag {
    pub const ESTABLISHED: u8 = 1 << 0;
    pub const SEND_OPEN: u8 = 1 << 1;
    pub const RECV_OPEN: u8 = 1 << 2;
    pub const NORMAL: u8 = ESTABLISHED | SEND_OPEN | RECV_OPEN;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Listen,
    Open(u8),
}

struct RetransmitSegment {
    seq: u32,
    data: Vec<u8>,
}

/// A buffered TCP payload kept in the guest-bound direction until
/// acknowledged (§3's "retransmit segment").
struct RetransmitQueue {
    segments: VecDeque<RetransmitSegment>,
}

impl RetransmitQueue {
    fn new() -> Self {
        Self { segments: VecDeque::new() }
    }

    fn total_len(&self) -> u32 {
        self.segments.iter().map(|s| s.data.len() as u32).sum()
    }

    fn push(&mut self, seq: u32, data: Vec<u8>) {
        if !data.is_empty() {
            self.segments.push_back(RetransmitSegment { seq, data });
        }
    }

    /// Drops fully-acknowledged bytes from the head, per spec.md §4.8.
    fn ack(&mut self, seq_ack: u32) {
        while let Some(front) = self.segments.front() {
            let end = front.seq.wrapping_add(front.data.len() as u32);
            if seq_diff_le(end, seq_ack) {
                self.segments.pop_front();
            } else {
                break;
            }
        }
    }
}

fn seq_diff_le(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
struct FlowKey {
    guest_port: u16,
    dst_ip: Ipv4,
    dst_port: u16,
}

struct TcpContext {
    host_socket: TcpStream,
    guest_port: u16,
    dst_ip: Ipv4,
    dst_port: u16,
    /// Source address the guest sees replies come from; 127.0.0.0/8
    /// destinations are rewritten to the gateway IP (§4.8).
    reply_src_ip: Ipv4,
    retransmit: RetransmitQueue,
    /// Next guest-bound sequence number.
    seq: u32,
    /// Next expected guest-sent sequence number.
    ack: u32,
    /// Last sequence number acknowledged by the guest.
    seq_ack: u32,
    window: u16,
    state: ConnState,
    window_full: bool,
    connecting: bool,
    /// Ticks (200ms) since the last guest or host activity.
    idle_ticks: u32,
    /// Ticks since an inbound connection was created but not yet
    /// completed by the guest (10s timeout, §4.8).
    accept_ticks: u32,
    keepalive_ticks: u32,
}

impl TcpContext {
    fn invariant_ok(&self) -> bool {
        seq_diff_le(self.seq_ack, self.seq) && (self.seq.wrapping_sub(self.seq_ack) as u32) <= self.window as u32 + self.retransmit.total_len()
    }
}

struct PortForwardListener {
    host: TcpListener,
    guest_port: u16,
}

/// §3's TAP device fields narrowed to just the TCP half: the socket maps,
/// the listener list, and nothing else (ARP/DHCP/ICMP/UDP live in their
/// own sibling modules and are composed together in `tap.rs`).
pub struct TcpNat {
    contexts: HashMap<FlowKey, TcpContext>,
    listeners: Vec<PortForwardListener>,
}

impl TcpNat {
    pub fn new() -> Self {
        Self { contexts: HashMap::new(), listeners: Vec::new() }
    }

    pub fn add_port_forward(&mut self, host_addr: SocketAddr, guest_port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(host_addr)?;
        listener.set_nonblocking(true)?;
        self.listeners.push(PortForwardListener { host: listener, guest_port });
        Ok(())
    }

    fn rewrite_dst(dst_ip: Ipv4) -> (Ipv4Addr, Ipv4) {
        if ethernet::is_loopback(dst_ip) {
            (Ipv4Addr::LOCALHOST, GATEWAY_IP)
        } else {
            (dst_ip.into(), dst_ip)
        }
    }

    /// Processes one guest-emitted TCP segment, returning any frames to
    /// send back to the guest immediately -- including the SYN+ACK for a
    /// freshly opened outbound connection, since `TcpStream::connect` in
    /// `open_outbound` blocks until the host side of the handshake is done.
    pub fn handle_guest_segment(&mut self, frame: &[u8], client_mac: Mac, gateway_mac: Mac) -> Vec<Vec<u8>> {
        let seg = match tcp_segment::parse(frame) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let dst_ip = ethernet::ip_dst(frame);
        let key = FlowKey { guest_port: seg.src_port, dst_ip, dst_port: seg.dst_port };

        if seg.flags & FLAG_SYN != 0 && seg.flags & FLAG_ACK == 0 {
            return self.open_outbound(key, &seg, client_mac, gateway_mac);
        }

        let mut out = Vec::new();
        let tear_down = {
            let ctx = match self.contexts.get_mut(&key) {
                Some(c) => c,
                None => return out,
            };
            ctx.idle_ticks = 0;

            if seg.flags & FLAG_RST != 0 {
                true
            } else {
                Self::apply_segment(ctx, &seg, &mut out, client_mac, gateway_mac);
                matches!(ctx.state, ConnState::Closed)
            }
        };
        if tear_down {
            self.contexts.remove(&key);
        }
        out
    }

    fn open_outbound(&mut self, key: FlowKey, seg: &tcp_segment::TcpSegment, client_mac: Mac, gateway_mac: Mac) -> Vec<Vec<u8>> {
        let (connect_ip, reply_src_ip) = Self::rewrite_dst(key.dst_ip);
        let connect_addr = SocketAddr::new(connect_ip.into(), key.dst_port);
        let socket = match TcpStream::connect(connect_addr) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        let _ = socket.set_nonblocking(true);

        let isn: u32 = rand::thread_rng().gen();
        let ack = seg.seq.wrapping_add(1);
        self.contexts.insert(
            key,
            TcpContext {
                host_socket: socket,
                guest_port: key.guest_port,
                dst_ip: key.dst_ip,
                dst_port: key.dst_port,
                reply_src_ip,
                retransmit: RetransmitQueue::new(),
                seq: isn.wrapping_add(1),
                ack,
                seq_ack: isn,
                window: 65535,
                state: ConnState::Open(flag::SEND_OPEN),
                window_full: false,
                connecting: true,
                idle_ticks: 0,
                accept_ticks: 0,
                keepalive_ticks: 0,
            },
        );
        // `TcpStream::connect` above is synchronous -- by the time we get
        // here the host side of the handshake is already done, so the
        // guest's SYN can be answered immediately with our SYN+ACK (§4.8).
        vec![tcp_segment::build(
            client_mac,
            gateway_mac,
            reply_src_ip,
            crate::dhcp::GUEST_IP,
            seg.dst_port,
            seg.src_port,
            isn,
            ack,
            FLAG_SYN | FLAG_ACK,
            65535,
            &[],
        )]
    }

    fn apply_segment(ctx: &mut TcpContext, seg: &tcp_segment::TcpSegment, out: &mut Vec<Vec<u8>>, client_mac: Mac, gateway_mac: Mac) {
        ctx.window = seg.window;

        if seg.flags & FLAG_ACK != 0 {
            if seq_diff_le(ctx.seq_ack, seg.ack) {
                ctx.seq_ack = seg.ack;
                ctx.retransmit.ack(seg.ack);
                if ctx.window_full && (ctx.seq.wrapping_sub(ctx.seq_ack) as u32) < ctx.window as u32 {
                    ctx.window_full = false;
                }
            }
            if let ConnState::Open(bits) = &mut ctx.state {
                if *bits & flag::ESTABLISHED == 0 && ctx.connecting {
                    // Guest's ACK completing the 3-way handshake we began
                    // in `open_outbound`/inbound SYN delivery.
                    *bits = flag::NORMAL;
                    ctx.connecting = false;
                }
            }
        }

        let in_order = seg.seq == ctx.ack;
        if in_order && !seg.payload.is_empty() {
            if let Ok(n) = ctx.host_socket.write(seg.payload) {
                ctx.ack = ctx.ack.wrapping_add(n as u32);
            }
        }

        if seg.flags & FLAG_FIN != 0 && in_order {
            ctx.ack = ctx.ack.wrapping_add(1);
            if let ConnState::Open(bits) = &mut ctx.state {
                *bits &= !flag::RECV_OPEN;
            }
        }

        // Always ack what we've absorbed so far.
        let ack_flags = FLAG_ACK;
        out.push(tcp_segment::build(
            client_mac,
            gateway_mac,
            ctx.reply_src_ip,
            crate::dhcp::GUEST_IP,
            seg.dst_port,
            seg.src_port,
            ctx.seq,
            ctx.ack,
            ack_flags,
            ctx.window,
            &[],
        ));

        if let ConnState::Open(bits) = ctx.state {
            if bits & (flag::SEND_OPEN | flag::RECV_OPEN) == 0 {
                ctx.state = ConnState::Closed;
            }
        }
    }

    /// Begins a guest-bound connection from a port-forward accept: the
    /// context starts `RECV_OPEN`, a SYN is sent to the guest, and the
    /// flow joins `NORMAL` once the guest SYN-ACKs (§4.8).
    pub fn accept_inbound(&mut self, host_socket: TcpStream, guest_port: u16, client_mac: Mac, gateway_mac: Mac) -> Vec<u8> {
        let _ = host_socket.set_nonblocking(true);
        let isn: u32 = rand::thread_rng().gen();
        let key = FlowKey { guest_port, dst_ip: GATEWAY_IP, dst_port: 0 };
        let frame = tcp_segment::build(
            client_mac,
            gateway_mac,
            GATEWAY_IP,
            crate::dhcp::GUEST_IP,
            0,
            guest_port,
            isn,
            0,
            FLAG_SYN,
            65535,
            &[],
        );
        self.contexts.insert(
            key,
            TcpContext {
                host_socket,
                guest_port,
                dst_ip: GATEWAY_IP,
                dst_port: 0,
                reply_src_ip: GATEWAY_IP,
                retransmit: RetransmitQueue::new(),
                seq: isn.wrapping_add(1),
                ack: 0,
                seq_ack: isn,
                window: 65535,
                state: ConnState::Open(flag::RECV_OPEN),
                window_full: false,
                connecting: true,
                idle_ticks: 0,
                accept_ticks: 0,
                keepalive_ticks: 0,
            },
        );
        frame
    }

    /// Accepts pending host-side listener connections and pumps
    /// established host sockets, returning guest-bound frames.
    pub fn poll(&mut self, client_mac: Mac, gateway_mac: Mac) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for l in &self.listeners {
            while let Ok((stream, _)) = l.host.accept() {
                out.push(self.accept_inbound(stream, l.guest_port, client_mac, gateway_mac));
            }
        }

        let mut dead = Vec::new();
        for (key, ctx) in self.contexts.iter_mut() {
            if !matches!(ctx.state, ConnState::Open(b) if b & flag::SEND_OPEN != 0) || ctx.window_full {
                continue;
            }
            let mut buf = [0u8; 4096];
            match ctx.host_socket.read(&mut buf) {
                Ok(0) => {
                    if let ConnState::Open(bits) = &mut ctx.state {
                        *bits &= !flag::SEND_OPEN;
                    }
                }
                Ok(n) => {
                    ctx.retransmit.push(ctx.seq, buf[..n].to_vec());
                    out.push(tcp_segment::build(
                        client_mac,
                        gateway_mac,
                        ctx.reply_src_ip,
                        crate::dhcp::GUEST_IP,
                        ctx.dst_port,
                        ctx.guest_port,
                        ctx.seq,
                        ctx.ack,
                        FLAG_PSH | FLAG_ACK,
                        ctx.window,
                        &buf[..n],
                    ));
                    ctx.seq = ctx.seq.wrapping_add(n as u32);
                    if (ctx.seq.wrapping_sub(ctx.seq_ack) as u32) >= ctx.window as u32 {
                        ctx.window_full = true;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(_) => dead.push(*key),
            }
        }
        for key in dead {
            self.contexts.remove(&key);
        }
        out
    }

    /// 200ms periodic pass (§4.8): retransmits the outstanding window,
    /// sends keepalives at ~10s, and kills dead/unaccepted connections.
    pub fn tick(&mut self, client_mac: Mac, gateway_mac: Mac) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut dead = Vec::new();

        for (key, ctx) in self.contexts.iter_mut() {
            ctx.idle_ticks += 1;
            ctx.keepalive_ticks += 1;

            if matches!(ctx.state, ConnState::Open(b) if b & flag::ESTABLISHED == 0) {
                ctx.accept_ticks += 1;
                if ctx.accept_ticks > 50 {
                    dead.push(*key);
                    continue;
                }
            }

            if ctx.idle_ticks > 300 {
                dead.push(*key);
                continue;
            }

            if ctx.idle_ticks % 5 == 0 {
                // Retransmit the whole outstanding window on timeout.
                for seg in ctx.retransmit.segments.iter() {
                    out.push(tcp_segment::build(
                        client_mac,
                        gateway_mac,
                        ctx.reply_src_ip,
                        crate::dhcp::GUEST_IP,
                        ctx.dst_port,
                        ctx.guest_port,
                        seg.seq,
                        ctx.ack,
                        FLAG_PSH | FLAG_ACK,
                        ctx.window,
                        &seg.data,
                    ));
                }
            }

            if ctx.keepalive_ticks >= 50 {
                ctx.keepalive_ticks = 0;
                out.push(tcp_segment::build(
                    client_mac,
                    gateway_mac,
                    ctx.reply_src_ip,
                    crate::dhcp::GUEST_IP,
                    ctx.dst_port,
                    ctx.guest_port,
                    ctx.seq.wrapping_sub(1),
                    ctx.ack,
                    FLAG_ACK,
                    ctx.window,
                    &[],
                ));
            }

            debug_assert!(ctx.invariant_ok());
        }

        for key in dead {
            self.contexts.remove(&key);
        }
        out
    }

    #[cfg(test)]
    fn context_count(&self) -> usize {
        self.contexts.len()
    }
}

impl Default for TcpNat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_queue_drops_fully_acked_prefix() {
        let mut q = RetransmitQueue::new();
        q.push(100, vec![1, 2, 3, 4]);
        q.push(104, vec![5, 6]);
        assert_eq!(q.total_len(), 6);
        q.ack(104);
        assert_eq!(q.total_len(), 2);
        q.ack(106);
        assert_eq!(q.total_len(), 0);
    }

    #[test]
    fn syn_without_ack_opens_pending_context() {
        let mut nat = TcpNat::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let _ = listener.accept();
        });
        let frame = tcp_segment::build(
            [1; 6],
            [2; 6],
            [192, 168, 0, 100],
            [127, 0, 0, 1],
            40000,
            port,
            0,
            0,
            FLAG_SYN,
            65535,
            &[],
        );
        // Loopback destination is rewritten to the real host loopback, so
        // the connect below targets 127.0.0.1 regardless of guest framing.
        let out = nat.handle_guest_segment(&frame, [3; 6], [4; 6]);
        assert_eq!(nat.context_count(), 1);
        assert_eq!(out.len(), 1, "a successful host connect must answer the guest SYN with a SYN+ACK");
        let reply = tcp_segment::parse(&out[0]).unwrap();
        assert_eq!(reply.flags, FLAG_SYN | FLAG_ACK);
        assert_eq!(reply.src_port, port);
        assert_eq!(reply.dst_port, 40000);
        assert_eq!(reply.ack, 1); // guest ISN was 0
    }
}
