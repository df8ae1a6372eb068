//! Hart state (§3). Grounded in `vm/src/cpu.rs`'s `Cpu` struct (regs, pc,
//! csrs) generalized to XLEN-parametric width, privileged CSRs, the three
//! software TLBs, the JIT-TLB, and a reservation set for LR/SC.

pub mod interp;

use crate::mmu::{Tlb, TlbEntry};
use crate::trap::Mode;
use std::time::Instant;

pub const TLB_SIZE: usize = 256;
pub const JIT_TLB_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct JitTlbEntry {
    pub guest_pc: u64,
    pub host_code_ptr: usize,
}

pub struct JitTlb {
    entries: Vec<JitTlbEntry>,
}

impl JitTlb {
    pub fn new() -> Self {
        Self {
            entries: vec![JitTlbEntry::default(); JIT_TLB_SIZE],
        }
    }

    fn index(pc: u64) -> usize {
        ((pc >> 1) as usize) & (JIT_TLB_SIZE - 1)
    }

    pub fn lookup(&self, pc: u64) -> Option<usize> {
        let e = &self.entries[Self::index(pc)];
        if e.guest_pc == pc && e.host_code_ptr != 0 {
            Some(e.host_code_ptr)
        } else {
            None
        }
    }

    pub fn insert(&mut self, pc: u64, code_ptr: usize) {
        self.entries[Self::index(pc)] = JitTlbEntry {
            guest_pc: pc,
            host_code_ptr: code_ptr,
        };
    }

    pub fn flush(&mut self) {
        for e in &mut self.entries {
            *e = JitTlbEntry::default();
        }
    }
}

/// XLEN: 32 or 64-bit hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Xlen {
    W32,
    W64,
}

impl Xlen {
    pub fn bits(self) -> u32 {
        match self {
            Xlen::W32 => 32,
            Xlen::W64 => 64,
        }
    }
}

/// A single hardware thread, per spec.md §3.
pub struct Hart {
    pub hart_id: u64,
    pub xlen: Xlen,
    pub regs: [u64; 32],
    pub pc: u64,
    pub fregs: [u64; 32],
    pub fp_enabled: bool,
    pub mode: Mode,
    pub csrs: [u64; 4096],

    pub tlb_r: Tlb,
    pub tlb_w: Tlb,
    pub tlb_x: Tlb,
    pub jit_tlb: JitTlb,

    /// LR/SC reservation: (hart-visible granule address, valid).
    pub reservation: Option<u64>,

    pub timer_freq_hz: u64,
    pub boot_instant: Instant,

    pub last_pc: u64,
    pub last_inst: u32,

    /// Cleared by a trap/reset to force any in-flight JIT block to return
    /// at its next exit point (§4.7, §5).
    pub wait_event: u64,
}

impl Hart {
    pub fn new(hart_id: u64, xlen: Xlen, entry_pc: u64) -> Self {
        Self {
            hart_id,
            xlen,
            regs: [0; 32],
            pc: entry_pc,
            fregs: [0; 32],
            fp_enabled: true,
            mode: Mode::Machine,
            csrs: [0; 4096],
            tlb_r: Tlb::new(),
            tlb_w: Tlb::new(),
            tlb_x: Tlb::new(),
            jit_tlb: JitTlb::new(),
            reservation: None,
            timer_freq_hz: 10_000_000,
            boot_instant: Instant::now(),
            last_pc: entry_pc,
            last_inst: 0,
            wait_event: 1,
        }
    }

    /// x0 always reads zero and ignores writes (§3 invariant).
    #[inline]
    pub fn read_reg(&self, i: usize) -> u64 {
        if i == 0 {
            0
        } else {
            let v = self.regs[i];
            self.mask_xlen(v)
        }
    }

    #[inline]
    pub fn write_reg(&mut self, i: usize, val: u64) {
        if i != 0 {
            self.regs[i] = self.mask_xlen(val);
        }
    }

    #[inline]
    pub fn mask_xlen(&self, v: u64) -> u64 {
        match self.xlen {
            Xlen::W32 => v & 0xffff_ffff,
            Xlen::W64 => v,
        }
    }

    pub fn read_freg(&self, i: usize) -> u64 {
        self.fregs[i]
    }

    /// NaN-box a 32-bit float result into the 64-bit FP register file
    /// (Non-goal: nothing beyond what the architecture mandates).
    pub fn write_freg32(&mut self, i: usize, bits: u32) {
        self.fregs[i] = 0xffff_ffff_0000_0000 | bits as u64;
    }

    pub fn write_freg64(&mut self, i: usize, bits: u64) {
        self.fregs[i] = bits;
    }

    pub fn timer_value(&self) -> u64 {
        let elapsed = self.boot_instant.elapsed();
        (elapsed.as_secs_f64() * self.timer_freq_hz as f64) as u64
    }

    pub fn flush_tlbs(&mut self) {
        self.tlb_r.flush();
        self.tlb_w.flush();
        self.tlb_x.flush();
    }

    pub fn flush_tlbs_for_vaddr(&mut self, vaddr: u64) {
        self.tlb_r.flush_entry(vaddr);
        self.tlb_w.flush_entry(vaddr);
        self.tlb_x.flush_entry(vaddr);
    }

    pub fn install_tlb(&mut self, kind: crate::mmu::AccessKind, entry: TlbEntry) {
        match kind {
            crate::mmu::AccessKind::Load => self.tlb_r.install(entry),
            crate::mmu::AccessKind::Store => self.tlb_w.install(entry),
            crate::mmu::AccessKind::Fetch => self.tlb_x.install(entry),
        }
    }

    pub fn reset(&mut self, entry_pc: u64) {
        self.regs = [0; 32];
        self.fregs = [0; 32];
        self.pc = entry_pc;
        self.mode = Mode::Machine;
        self.csrs = [0; 4096];
        self.flush_tlbs();
        self.jit_tlb.flush();
        self.reservation = None;
        self.wait_event = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x0_always_reads_zero() {
        let mut h = Hart::new(0, Xlen::W64, 0x8000_0000);
        h.write_reg(0, 0xdead_beef);
        assert_eq!(h.read_reg(0), 0);
        h.write_reg(1, 5);
        assert_eq!(h.read_reg(1), 5);
    }

    #[test]
    fn rv32_masks_upper_bits() {
        let mut h = Hart::new(0, Xlen::W32, 0x8000_0000);
        h.write_reg(1, 0xffff_ffff_ffff_ffff);
        assert_eq!(h.read_reg(1), 0xffff_ffff);
    }
}
