//! Syscon: a single 16-bit register at offset 0 of a 0x1000 window. Writing
//! 0x5555 powers the machine off; writing 0x7777 resets it (§6). Everything
//! else is a no-op, matching real syscon hardware's tolerance of spurious
//! writes.

use crate::bus::MmioDevice;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

pub const WINDOW_SIZE: u64 = 0x1000;
const POWEROFF_CODE: u16 = 0x5555;
const RESET_CODE: u16 = 0x7777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysconEvent {
    None,
    Poweroff,
    Reset,
}

impl SysconEvent {
    fn from_tag(tag: u8) -> Self {
        match tag {
            1 => SysconEvent::Poweroff,
            2 => SysconEvent::Reset,
            _ => SysconEvent::None,
        }
    }
}

/// Shared with whatever owns the machine's run loop: the loop polls
/// `pending()` after each `tick_devices()` call instead of the device
/// holding a callback into `Machine` (which would need a back-reference).
pub struct Syscon {
    pending: Arc<AtomicU8>,
    latched: AtomicBool,
}

impl Syscon {
    pub fn new() -> (Self, Arc<AtomicU8>) {
        let pending = Arc::new(AtomicU8::new(0));
        (
            Self {
                pending: pending.clone(),
                latched: AtomicBool::new(false),
            },
            pending,
        )
    }

    pub fn poll(flag: &AtomicU8) -> SysconEvent {
        SysconEvent::from_tag(flag.swap(0, Ordering::SeqCst))
    }
}

impl MmioDevice for Syscon {
    fn read(&mut self, _offset: u64, _size: u64) -> u64 {
        0
    }

    fn write(&mut self, offset: u64, size: u64, value: u64) {
        if offset != 0 || size < 2 || self.latched.load(Ordering::Relaxed) {
            return;
        }
        match (value & 0xffff) as u16 {
            POWEROFF_CODE => self.pending.store(1, Ordering::SeqCst),
            RESET_CODE => self.pending.store(2, Ordering::SeqCst),
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.pending.store(0, Ordering::SeqCst);
    }

    fn min_op_size(&self) -> u64 {
        2
    }

    fn max_op_size(&self) -> u64 {
        4
    }

    fn type_name(&self) -> &'static str {
        "syscon"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poweroff_code_latches_event() {
        let (mut dev, flag) = Syscon::new();
        dev.write(0, 2, 0x5555);
        assert_eq!(Syscon::poll(&flag), SysconEvent::Poweroff);
        assert_eq!(Syscon::poll(&flag), SysconEvent::None);
    }

    #[test]
    fn reset_code_latches_event() {
        let (mut dev, flag) = Syscon::new();
        dev.write(0, 2, 0x7777);
        assert_eq!(Syscon::poll(&flag), SysconEvent::Reset);
    }

    #[test]
    fn unrecognized_code_is_ignored() {
        let (mut dev, flag) = Syscon::new();
        dev.write(0, 2, 0x1234);
        assert_eq!(Syscon::poll(&flag), SysconEvent::None);
    }
}
