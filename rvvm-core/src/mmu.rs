//! MMU + software TLBs (C2, §4.2).
//!
//! Grounded in the teacher's `engine`/`mmu` naming (`crate::mmu::AccessType`
//! imported by `cpu/execution.rs`) though the teacher's own `mmu.rs` wasn't
//! part of the retrieved pack; the walk below is written from spec.md's
//! description directly: SATP-driven, A/D bit updates, Sv32/Sv39/Sv48.

use crate::bus::Bus;
use crate::cpu::Xlen;
use crate::csr::{CSR_SATP, MSTATUS_MXR, MSTATUS_SUM};
use crate::trap::{exception, Trap, TrapKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Fetch,
    Load,
    Store,
}

/// `(tag, host_base)`: `tag = guest_vpn XOR flags` so a single equality
/// test covers both vpn match and permission (§3's TLB entry invariant).
#[derive(Debug, Clone, Copy)]
pub struct TlbEntry {
    pub tag: u64,
    pub host_base: usize,
}

const TLB_SIZE: usize = crate::cpu::TLB_SIZE;
const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

pub struct Tlb {
    entries: Vec<(u64, TlbEntry)>, // (full vpn key, entry) for validation
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: vec![(0, TlbEntry { tag: 0, host_base: 0 }); TLB_SIZE],
        }
    }

    fn index(vaddr: u64) -> usize {
        ((vaddr >> PAGE_SHIFT) as usize) & (TLB_SIZE - 1)
    }

    /// A zero tag is the "miss" sentinel (§3).
    pub fn lookup(&self, vaddr: u64) -> Option<usize> {
        let idx = Self::index(vaddr);
        let (vpn, entry) = &self.entries[idx];
        let this_vpn = vaddr >> PAGE_SHIFT;
        if entry.tag != 0 && *vpn == this_vpn {
            let host = entry.host_base.wrapping_add(vaddr as usize);
            Some(host)
        } else {
            None
        }
    }

    pub fn install(&mut self, entry: TlbEntry) {
        // tag encodes the vpn in its low bits XORed with flags in the
        // caller; we additionally keep the plain vpn alongside for a
        // cheap equality check without re-deriving it from the tag.
        let idx = (entry.tag as usize) & (TLB_SIZE - 1);
        let vpn = entry.tag; // caller passes vpn-as-tag when flags==0 fast path
        self.entries[idx] = (vpn, entry);
    }

    pub fn flush(&mut self) {
        for (vpn, e) in &mut self.entries {
            *vpn = 0;
            e.tag = 0;
            e.host_base = 0;
        }
    }

    pub fn flush_entry(&mut self, vaddr: u64) {
        let idx = Self::index(vaddr);
        self.entries[idx] = (0, TlbEntry { tag: 0, host_base: 0 });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PagingMode {
    Bare,
    Sv32,
    Sv39,
    Sv48,
}

fn paging_mode(satp: u64, xlen: Xlen) -> PagingMode {
    match xlen {
        Xlen::W32 => {
            if (satp >> 31) & 1 == 1 {
                PagingMode::Sv32
            } else {
                PagingMode::Bare
            }
        }
        Xlen::W64 => match (satp >> 60) & 0xf {
            8 => PagingMode::Sv39,
            9 => PagingMode::Sv48,
            _ => PagingMode::Bare,
        },
    }
}

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;
const PTE_U: u64 = 1 << 4;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;

struct WalkParams {
    levels: u32,
    pte_size: u64,
    vpn_bits: u32,
    ppn_shift: u32,
    root_ppn: u64,
}

fn walk_params(mode: PagingMode, satp: u64) -> WalkParams {
    match mode {
        PagingMode::Sv32 => WalkParams {
            levels: 2,
            pte_size: 4,
            vpn_bits: 10,
            ppn_shift: 12,
            root_ppn: satp & 0x3f_ffff,
        },
        PagingMode::Sv39 => WalkParams {
            levels: 3,
            pte_size: 8,
            vpn_bits: 9,
            ppn_shift: 12,
            root_ppn: satp & 0xfff_ffff_ffff,
        },
        PagingMode::Sv48 => WalkParams {
            levels: 4,
            pte_size: 8,
            vpn_bits: 9,
            ppn_shift: 12,
            root_ppn: satp & 0xfff_ffff_ffff,
        },
        PagingMode::Bare => unreachable!(),
    }
}

fn vpn(vaddr: u64, level: u32, vpn_bits: u32) -> u64 {
    (vaddr >> (PAGE_SHIFT + level * vpn_bits)) & ((1u64 << vpn_bits) - 1)
}

/// Outcome of a translation: RAM hits can be cached in a TLB (a direct
/// host pointer is meaningful); MMIO hits cannot and always go through the
/// slow `Bus::read`/`write` path.
pub enum Translation {
    Ram { phys: u64, entry: TlbEntry },
    Mmio { phys: u64 },
}

/// Translate `vaddr` for `kind`, returning the physical address (and, for
/// RAM, a cacheable TLB entry) on success, or a trap with `tval = vaddr` on
/// failure. Sets A (and D for stores) in guest memory on the PTE that
/// resolved the walk.
pub fn translate(
    hart: &mut crate::cpu::Hart,
    bus: &mut Bus,
    vaddr: u64,
    kind: AccessKind,
) -> Result<Translation, Trap> {
    let satp = hart.csrs[CSR_SATP as usize];
    let mode = paging_mode(satp, hart.xlen);
    let mstatus = hart.csrs[crate::csr::CSR_MSTATUS as usize];
    let priv_for_access = if mstatus & crate::csr::MSTATUS_MPRV != 0 && kind != AccessKind::Fetch {
        crate::trap::Mode::from_bits(mstatus >> crate::csr::MSTATUS_MPP_SHIFT)
    } else {
        hart.mode
    };

    if mode == PagingMode::Bare || priv_for_access == crate::trap::Mode::Machine {
        return Ok(phys_translation(bus, vaddr));
    }

    let params = walk_params(mode, satp);
    let mut ppn = params.root_ppn;
    let mxr = mstatus & MSTATUS_MXR != 0;
    let sum = mstatus & MSTATUS_SUM != 0;

    let mut level = params.levels - 1;
    loop {
        let pte_addr = (ppn << PAGE_SHIFT) + vpn(vaddr, level, params.vpn_bits) * params.pte_size;
        let pte = bus.read(pte_addr, params.pte_size).map_err(|_| fault(kind, vaddr))?;

        if pte & PTE_V == 0 || (pte & PTE_R == 0 && pte & PTE_W != 0) {
            return Err(fault(kind, vaddr));
        }

        let leaf = pte & (PTE_R | PTE_W | PTE_X) != 0;
        if !leaf {
            if level == 0 {
                return Err(fault(kind, vaddr));
            }
            ppn = pte >> params.ppn_shift;
            level -= 1;
            continue;
        }

        // Permission checks.
        let perm_ok = match kind {
            AccessKind::Fetch => pte & PTE_X != 0,
            AccessKind::Load => pte & PTE_R != 0 || (mxr && pte & PTE_X != 0),
            AccessKind::Store => pte & PTE_W != 0,
        };
        if !perm_ok {
            return Err(fault(kind, vaddr));
        }
        let user_page = pte & PTE_U != 0;
        if priv_for_access == crate::trap::Mode::User && !user_page {
            return Err(fault(kind, vaddr));
        }
        if priv_for_access == crate::trap::Mode::Supervisor && user_page && !sum {
            return Err(fault(kind, vaddr));
        }

        // Misaligned superpage check: all lower-level vpn bits of the PPN
        // must be zero for levels above 0.
        if level > 0 {
            let low_ppn_mask = (1u64 << (level * params.vpn_bits)) - 1;
            if (pte >> params.ppn_shift) & low_ppn_mask != 0 {
                return Err(fault(kind, vaddr));
            }
        }

        // A/D update, atomically from the guest's point of view (single
        // hart step boundary here stands in for an atomic RMW).
        let mut new_pte = pte | PTE_A;
        if kind == AccessKind::Store {
            new_pte |= PTE_D;
        }
        if new_pte != pte {
            let _ = bus.write(pte_addr, params.pte_size, new_pte);
        }

        let page_off_bits = PAGE_SHIFT + level * params.vpn_bits;
        let phys_page = (pte >> params.ppn_shift) << params.ppn_shift;
        let phys = phys_page | (vaddr & ((1u64 << page_off_bits) - 1));

        let mut result = phys_translation(bus, phys);
        if let Translation::Ram { entry, .. } = &mut result {
            // Cache keyed by the *virtual* page so a later lookup at the
            // same vaddr hits without re-walking. `host_base` must still
            // satisfy `host_base + vaddr == phys - ram.base()`, so rebase
            // it off the walked `phys` rather than the identity-map
            // assumption `phys_translation` makes on its own.
            entry.tag = vaddr >> PAGE_SHIFT;
            entry.host_base = (phys as usize)
                .wrapping_sub(bus.ram.base() as usize)
                .wrapping_sub(vaddr as usize);
        }
        return Ok(result);
    }
}

/// Resolve a physical address against the bus without any paging: RAM
/// yields a cacheable host-pointer entry, anything else is MMIO and is
/// never installed in a TLB (§4.2).
fn phys_translation(bus: &Bus, phys: u64) -> Translation {
    if bus.ram.contains(phys & !(PAGE_SIZE - 1), PAGE_SIZE) {
        let host_base = bus.ram.base() as usize;
        Translation::Ram {
            phys,
            entry: TlbEntry {
                tag: phys >> PAGE_SHIFT,
                host_base: host_base.wrapping_neg(),
            },
        }
    } else {
        Translation::Mmio { phys }
    }
}

fn fault(kind: AccessKind, vaddr: u64) -> Trap {
    let code = match kind {
        AccessKind::Fetch => exception::INSTRUCTION_PAGE_FAULT,
        AccessKind::Load => exception::LOAD_PAGE_FAULT,
        AccessKind::Store => exception::STORE_PAGE_FAULT,
    };
    Trap::new(TrapKind::Exception(code), vaddr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::cpu::{Hart, Xlen};

    #[test]
    fn bare_mode_identity_maps() {
        let mut bus = Bus::new(0x8000_0000, 4096 * 4);
        let mut hart = Hart::new(0, Xlen::W64, 0x8000_0000);
        match translate(&mut hart, &mut bus, 0x8000_0100, AccessKind::Load).unwrap() {
            Translation::Ram { phys, entry } => {
                assert_eq!(phys, 0x8000_0100);
                assert_ne!(entry.tag, 0);
            }
            Translation::Mmio { .. } => panic!("expected RAM"),
        }
    }

    #[test]
    fn tlb_hit_matches_fresh_walk() {
        let mut bus = Bus::new(0x8000_0000, 4096 * 4);
        let mut hart = Hart::new(0, Xlen::W64, 0x8000_0000);
        let t1 = translate(&mut hart, &mut bus, 0x8000_0100, AccessKind::Load).unwrap();
        let (phys1, entry) = match t1 {
            Translation::Ram { phys, entry } => (phys, entry),
            _ => panic!("expected RAM"),
        };
        hart.install_tlb(AccessKind::Load, entry);
        let cached = hart.tlb_r.lookup(0x8000_0100);
        assert!(cached.is_some());
        let t2 = translate(&mut hart, &mut bus, 0x8000_0100, AccessKind::Load).unwrap();
        let phys2 = match t2 {
            Translation::Ram { phys, .. } => phys,
            _ => panic!("expected RAM"),
        };
        assert_eq!(phys1, phys2);
    }
}
