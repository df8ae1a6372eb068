//! Virtual-to-host register allocator (C4, §4.4). Backend-agnostic: it
//! hands out small integer slot indices (`HostReg`) that each
//! `backend::Backend` maps onto its own physical register file.
//!
//! Grounded in the teacher's tiered-compilation shape in spirit (a bounded
//! resource claimed per block, reclaimed at block exit) though the teacher
//! itself never needed a register allocator -- WASM locals make one
//! unnecessary. This is new machinery built for a native-code target.

use super::ir::VReg;
use std::collections::HashMap;

/// Number of allocatable host registers a backend exposes beyond its fixed
/// ABI registers (cpu-state pointer, link register, stack pointer). Kept
/// deliberately small so every backend (x86-64, ARM64, ARMv7, RV64) can
/// satisfy it from its own general-purpose file.
pub const NUM_HREGS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostReg(pub u8);

struct Binding {
    vreg: VReg,
    last_use: u32,
}

/// Result of a `claim_hreg` call: which slot `vreg` now lives in, and
/// what the caller must emit before using it.
#[derive(Debug, Clone, Copy)]
pub struct Claim {
    pub hreg: HostReg,
    /// `vreg` was not already resident in `hreg` -- the caller must emit a
    /// reload of its architectural value before reading it (skip this for
    /// a pure write-only destination; a harmless extra load otherwise).
    pub fresh: bool,
    /// A different live vreg was evicted from `hreg` to make room -- the
    /// caller must emit its writeback *before* anything else touches
    /// `hreg`, since the evicted value is still physically sitting there.
    pub evicted: Option<VReg>,
}

/// LRU register allocator: `claim` assigns the least-recently-used free
/// slot, spilling (evicting, not yet writing back -- that's the caller's
/// job per `Claim::evicted`) whenever all slots are taken.
pub struct RegAlloc {
    slots: [Option<Binding>; NUM_HREGS],
    vreg_to_slot: HashMap<VReg, usize>,
    clock: u32,
    pub spills: Vec<VReg>,
}

impl RegAlloc {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            vreg_to_slot: HashMap::new(),
            clock: 0,
            spills: Vec::new(),
        }
    }

    /// Claim a host register for `vreg`, spilling the oldest live binding
    /// if necessary. Returns the same slot on repeated claims for the same
    /// vreg within a block (no redundant reload), and otherwise reports
    /// what the caller must emit (see `Claim`) before relying on the slot.
    pub fn claim_hreg(&mut self, vreg: VReg) -> Claim {
        self.clock += 1;
        if let Some(&idx) = self.vreg_to_slot.get(&vreg) {
            self.slots[idx].as_mut().unwrap().last_use = self.clock;
            return Claim { hreg: HostReg(idx as u8), fresh: false, evicted: None };
        }

        let free = self.slots.iter().position(|s| s.is_none());
        let (idx, evicted) = match free {
            Some(idx) => (idx, None),
            None => {
                let lru = self
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.as_ref().unwrap().last_use)
                    .map(|(i, _)| i)
                    .unwrap();
                let evicted = self.slots[lru].take().unwrap();
                self.vreg_to_slot.remove(&evicted.vreg);
                self.spills.push(evicted.vreg);
                (lru, Some(evicted.vreg))
            }
        };

        self.slots[idx] = Some(Binding { vreg, last_use: self.clock });
        self.vreg_to_slot.insert(vreg, idx);
        Claim { hreg: HostReg(idx as u8), fresh: true, evicted }
    }

    /// ABI reclaim at block exit: every slot is released, and any vreg
    /// still bound (i.e. not yet spilled) is reported so the backend can
    /// emit its writeback.
    pub fn reclaim_all(&mut self) -> Vec<(VReg, HostReg)> {
        let mut live = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if let Some(binding) = slot.take() {
                live.push((binding.vreg, HostReg(idx as u8)));
            }
        }
        self.vreg_to_slot.clear();
        live
    }
}

impl Default for RegAlloc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_claim_returns_same_slot() {
        let mut ra = RegAlloc::new();
        let a = ra.claim_hreg(VReg::Gpr(1));
        assert!(a.fresh);
        assert!(a.evicted.is_none());
        let b = ra.claim_hreg(VReg::Gpr(1));
        assert_eq!(a.hreg, b.hreg);
        assert!(!b.fresh);
    }

    #[test]
    fn exhausting_slots_spills_lru() {
        let mut ra = RegAlloc::new();
        for i in 0..NUM_HREGS as u8 {
            ra.claim_hreg(VReg::Gpr(i));
        }
        assert!(ra.spills.is_empty());
        let claim = ra.claim_hreg(VReg::Gpr(NUM_HREGS as u8));
        assert_eq!(ra.spills.len(), 1);
        assert_eq!(ra.spills[0], VReg::Gpr(0));
        assert_eq!(claim.evicted, Some(VReg::Gpr(0)));
    }

    #[test]
    fn reclaiming_an_evicted_vreg_is_fresh_again() {
        let mut ra = RegAlloc::new();
        for i in 0..NUM_HREGS as u8 {
            ra.claim_hreg(VReg::Gpr(i));
        }
        ra.claim_hreg(VReg::Gpr(NUM_HREGS as u8)); // evicts Gpr(0)
        let reclaim = ra.claim_hreg(VReg::Gpr(0));
        assert!(reclaim.fresh, "a vreg re-claimed after eviction must be reported as needing a reload");
    }
}
