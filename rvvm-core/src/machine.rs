//! Machine lifecycle (C9, §4.9): creates/resets/stops a machine, owns its
//! harts and bus, and ticks device `update` hooks on a dedicated thread.
//!
//! Grounded in the teacher's one-thread-per-subsystem model (`relay`'s
//! tokio tasks, `net_libp2p`'s worker thread) and `vm/src/main.rs`'s
//! single-hart blocking run loop, generalized to `hart_count` harts per
//! §5's "one thread per hart, with a single-hart fast-path that returns
//! from `run()` on shutdown rather than parking."

use crate::bus::{Bus, MmioRegion};
use crate::cpu::{Hart, Xlen};
use crate::devices::syscon::{Syscon, SysconEvent, WINDOW_SIZE};
use crate::dispatcher::{spawn_hart_thread, HartDriver};
use crate::error::BusError;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Eventloop tick cadence (§4.9: "~100 Hz").
const EVENTLOOP_PERIOD: Duration = Duration::from_millis(10);

/// Opaque FDT SoC node handle (FDT generation itself is out of scope,
/// spec.md §1; only the handle-returning shape of `rvvm_get_fdt_soc` is
/// honored so device models that expect one compile against this API).
#[derive(Debug, Clone, Copy)]
pub struct FdtSocHandle(pub u64);

enum HartSlot {
    Idle(Hart),
    Running(JoinHandle<Hart>),
}

/// Aggregates harts and devices behind a single physical bus; drives the
/// eventloop thread and exposes the `rvvm_*` lifecycle surface of §6.
pub struct Machine {
    bus: Arc<Mutex<Bus>>,
    harts: Vec<HartSlot>,
    running: Arc<AtomicBool>,
    needs_reset: Arc<AtomicBool>,
    eventloop: Option<JoinHandle<()>>,
    syscon_flag: Option<Arc<AtomicU8>>,
    entry_pc: u64,
    fdt: Option<FdtSocHandle>,
}

impl Machine {
    /// `rvvm_create`: allocates a machine with the given RAM base/size,
    /// hart count, and XLEN. Harts start parked in machine mode at
    /// `entry_pc` (§4.9, §3).
    pub fn create(ram_base: u64, ram_size: u64, hart_count: usize, xlen: Xlen, entry_pc: u64) -> Self {
        let bus = Arc::new(Mutex::new(Bus::new(ram_base, ram_size)));
        let harts = (0..hart_count.max(1))
            .map(|id| HartSlot::Idle(Hart::new(id as u64, xlen, entry_pc)))
            .collect();
        Self {
            bus,
            harts,
            running: Arc::new(AtomicBool::new(false)),
            needs_reset: Arc::new(AtomicBool::new(false)),
            eventloop: None,
            syscon_flag: None,
            entry_pc,
            fdt: Some(FdtSocHandle(0)),
        }
    }

    /// `rvvm_attach_mmio`: attaches a region, rejecting overlap (§4.1).
    pub fn attach_mmio(&self, region: MmioRegion) -> Result<usize, BusError> {
        self.bus.lock().unwrap().attach(region)
    }

    /// `rvvm_mmio_zone_auto`: finds a free MMIO zone at or after `preferred`.
    pub fn mmio_zone_auto(&self, preferred: u64, size: u64) -> u64 {
        self.bus.lock().unwrap().mmio_zone_auto(preferred, size)
    }

    /// Attaches the syscon device at `base` (§6) and remembers its event
    /// flag so the eventloop can observe poweroff/reset requests.
    pub fn attach_syscon(&mut self, base: u64) -> Result<(), BusError> {
        let (dev, flag) = Syscon::new();
        self.bus.lock().unwrap().attach(MmioRegion {
            begin: base,
            size: WINDOW_SIZE,
            device: Box::new(dev),
        })?;
        self.syscon_flag = Some(flag);
        Ok(())
    }

    pub fn bus(&self) -> Arc<Mutex<Bus>> {
        self.bus.clone()
    }

    /// `rvvm_get_fdt_soc`: returns the FDT SoC node handle.
    pub fn fdt_soc(&self) -> Option<FdtSocHandle> {
        self.fdt
    }

    /// Overrides the PC every idle hart resumes at, e.g. after the image
    /// loader reports an ELF entry point different from the RAM base.
    pub fn set_entry_pc(&mut self, entry_pc: u64) {
        self.entry_pc = entry_pc;
        for slot in &mut self.harts {
            if let HartSlot::Idle(hart) = slot {
                hart.pc = entry_pc;
                hart.last_pc = entry_pc;
            }
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset.load(Ordering::Relaxed)
    }

    /// `rvvm_start_machine`: spawns one thread per hart (or runs the sole
    /// hart's driver loop on a dedicated worker when `hart_count == 1`,
    /// matching §5's single-hart fast path) and the device eventloop.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // already running
        }
        self.needs_reset.store(false, Ordering::SeqCst);

        for slot in &mut self.harts {
            let hart = match std::mem::replace(slot, HartSlot::Idle(Hart::new(0, Xlen::W64, 0))) {
                HartSlot::Idle(h) => h,
                HartSlot::Running(handle) => {
                    // Already running (shouldn't happen after the swap
                    // check above); restore and move on.
                    *slot = HartSlot::Running(handle);
                    continue;
                }
            };
            let handle = spawn_hart_thread(hart, self.bus.clone(), self.running.clone());
            *slot = HartSlot::Running(handle);
        }

        let bus = self.bus.clone();
        let running = self.running.clone();
        let needs_reset = self.needs_reset.clone();
        let syscon_flag = self.syscon_flag.clone();
        self.eventloop = Some(std::thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                std::thread::sleep(EVENTLOOP_PERIOD);
                bus.lock().unwrap().tick_devices();
                if let Some(flag) = &syscon_flag {
                    match Syscon::poll(flag) {
                        SysconEvent::Poweroff => {
                            running.store(false, Ordering::SeqCst);
                        }
                        SysconEvent::Reset => {
                            needs_reset.store(true, Ordering::SeqCst);
                            running.store(false, Ordering::SeqCst);
                        }
                        SysconEvent::None => {}
                    }
                }
            }
        }));
    }

    /// `rvvm_pause_machine`: stops dispatch, joins every hart thread back
    /// into an idle slot, and joins the eventloop.
    pub fn pause(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for slot in &mut self.harts {
            if let HartSlot::Running(_) = slot {
                let prev = std::mem::replace(slot, HartSlot::Idle(Hart::new(0, Xlen::W64, 0)));
                if let HartSlot::Running(handle) = prev {
                    let hart = handle.join().expect("hart thread panicked");
                    *slot = HartSlot::Idle(hart);
                }
            }
        }
        if let Some(ev) = self.eventloop.take() {
            let _ = ev.join();
        }
    }

    /// `rvvm_reset_machine`: calls every device's `reset` hook, resets
    /// every hart's architectural state back to `entry_pc`, and either
    /// resumes (`resume == true`) or leaves the machine stopped.
    pub fn reset(&mut self, resume: bool) {
        self.pause();
        self.bus.lock().unwrap().reset_all();
        for slot in &mut self.harts {
            if let HartSlot::Idle(hart) = slot {
                hart.reset(self.entry_pc);
            }
        }
        self.needs_reset.store(false, Ordering::SeqCst);
        if resume {
            self.start();
        }
    }

    /// Blocks the calling thread, single-stepping the first hart's driver
    /// loop directly instead of spawning a thread for it — the CLI binary
    /// uses this for the common single-hart case (`vm/src/main.rs`'s
    /// blocking loop, generalized).
    pub fn run_single_hart_blocking(&mut self) {
        assert_eq!(self.harts.len(), 1, "run_single_hart_blocking requires exactly one hart");
        self.running.store(true, Ordering::SeqCst);
        self.needs_reset.store(false, Ordering::SeqCst);

        let mut hart = match std::mem::replace(&mut self.harts[0], HartSlot::Idle(Hart::new(0, Xlen::W64, 0))) {
            HartSlot::Idle(h) => h,
            HartSlot::Running(handle) => handle.join().expect("hart thread panicked"),
        };

        let mut driver = HartDriver::new();
        let mut since_tick = Duration::ZERO;
        let tick_step = Duration::from_micros(200);
        while self.running.load(Ordering::Relaxed) {
            let mut bus = self.bus.lock().unwrap();
            let keep_running = driver.run_slice(&mut hart, &mut bus);
            drop(bus);

            since_tick += tick_step;
            if since_tick >= EVENTLOOP_PERIOD {
                since_tick = Duration::ZERO;
                self.bus.lock().unwrap().tick_devices();
                if let Some(flag) = &self.syscon_flag {
                    match Syscon::poll(flag) {
                        SysconEvent::Poweroff => self.running.store(false, Ordering::SeqCst),
                        SysconEvent::Reset => {
                            self.needs_reset.store(true, Ordering::SeqCst);
                            self.running.store(false, Ordering::SeqCst);
                        }
                        SysconEvent::None => {}
                    }
                }
            }

            if !keep_running {
                std::thread::sleep(tick_step);
            }
        }

        self.harts[0] = HartSlot::Idle(hart);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_reset_restores_entry_pc() {
        let mut m = Machine::create(0x8000_0000, 4096 * 16, 1, Xlen::W64, 0x8000_0000);
        if let HartSlot::Idle(hart) = &mut m.harts[0] {
            hart.pc = 0x8000_1234;
        }
        m.reset(false);
        if let HartSlot::Idle(hart) = &m.harts[0] {
            assert_eq!(hart.pc, 0x8000_0000);
        } else {
            panic!("expected idle hart after reset");
        }
    }

    #[test]
    fn attach_mmio_rejects_overlap_via_machine() {
        let m = Machine::create(0x8000_0000, 4096, 1, Xlen::W64, 0x8000_0000);
        struct Dummy;
        impl crate::bus::MmioDevice for Dummy {
            fn read(&mut self, _offset: u64, _size: u64) -> u64 {
                0
            }
            fn write(&mut self, _offset: u64, _size: u64, _value: u64) {}
        }
        m.attach_mmio(MmioRegion { begin: 0x1000, size: 0x100, device: Box::new(Dummy) }).unwrap();
        let err = m.attach_mmio(MmioRegion { begin: 0x1080, size: 0x100, device: Box::new(Dummy) });
        assert!(err.is_err());
    }

    #[test]
    fn syscon_poweroff_flips_running_flag() {
        let mut m = Machine::create(0x8000_0000, 4096, 1, Xlen::W64, 0x8000_0000);
        m.attach_syscon(0x9000_0000).unwrap();
        m.start();
        {
            let mut bus = m.bus.lock().unwrap();
            bus.write(0x9000_0000, 2, 0x5555).unwrap();
        }
        // give the eventloop a few ticks to observe the write
        std::thread::sleep(Duration::from_millis(60));
        assert!(!m.running());
        m.pause();
    }
}
