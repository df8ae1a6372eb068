//! User-mode TAP/NAT networking (C8): ARP, DHCP, ICMP, UDP port mapping
//! and a full guest-facing TCP state machine, fronted by a background
//! worker thread and a minimal `MmioDevice` attachment point.
//!
//! A real NIC model (virtio-net ring buffers, descriptor chains, an
//! interrupt-driven ABI) is out of scope here — see DESIGN.md for why
//! `TapMmioDevice` only exposes a doorbell/status register rather than a
//! full device; `TapDevice::send`/`recv_available` is the real frame path
//! for whatever NIC model eventually sits on top of it.

pub mod arp;
pub mod checksum;
pub mod dhcp;
pub mod ethernet;
pub mod icmp;
pub mod portfwd;
pub mod tap;
pub mod tcp;
pub mod tcp_segment;
pub mod udp;

pub use portfwd::{ParseError as PortForwardParseError, PortForward, Proto as PortForwardProto};
pub use tap::{parse_port_forwards, TapConfig, TapDevice};

use rvvm_core::bus::MmioDevice;
use std::collections::VecDeque;
use std::sync::Mutex;

const REG_DOORBELL: u64 = 0x00;
const REG_STATUS: u64 = 0x08;

/// Minimal MMIO attachment point: a doorbell register a guest driver can
/// poke after enqueuing a frame through [`TapDevice::send`], and a status
/// register that reflects whether inbound frames are waiting. The actual
/// frame bytes move through the Rust-level `TapDevice` API, not through
/// this register file — see the module doc for why.
pub struct TapMmioDevice {
    tap: TapDevice,
    pending_inbound: Mutex<VecDeque<Vec<u8>>>,
}

impl TapMmioDevice {
    pub fn new(tap: TapDevice) -> Self {
        Self { tap, pending_inbound: Mutex::new(VecDeque::new()) }
    }

    pub fn tap(&self) -> &TapDevice {
        &self.tap
    }
}

impl MmioDevice for TapMmioDevice {
    fn read(&mut self, offset: u64, _size: u64) -> u64 {
        match offset {
            REG_STATUS => {
                if self.pending_inbound.lock().unwrap().is_empty() { 0 } else { 1 }
            }
            _ => 0,
        }
    }

    fn write(&mut self, offset: u64, _size: u64, _value: u64) {
        if offset == REG_DOORBELL {
            let mut queue = self.pending_inbound.lock().unwrap();
            queue.extend(self.tap.recv_available());
        }
    }

    fn update(&mut self) {
        let mut queue = self.pending_inbound.lock().unwrap();
        queue.extend(self.tap.recv_available());
    }

    fn min_op_size(&self) -> u64 {
        4
    }

    fn max_op_size(&self) -> u64 {
        8
    }

    fn type_name(&self) -> &'static str {
        "rvvm-tap"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_register_reflects_pending_frames() {
        let config = TapConfig {
            client_mac: [1; 6],
            gateway_mac: [2; 6],
            filter_lan: false,
            port_forwards: Vec::new(),
        };
        let tap = TapDevice::new(config).unwrap();
        let mut dev = TapMmioDevice::new(tap);
        assert_eq!(dev.read(REG_STATUS, 4), 0);
    }
}
