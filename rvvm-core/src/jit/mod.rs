//! RVJIT (C4-C6, §4.4-§4.6): translates hot straight-line guest blocks to
//! native host machine code and runs them in place of the interpreter.
//!
//! Dispatch is tiered per hart: `Hart::jit_tlb` is a direct-mapped,
//! allocation-free fast path checked first; a miss falls through to the
//! full `BlockCache` (which also tracks per-block byte length for
//! invalidation and exec counts for the compile threshold); a cache miss
//! either bumps the exec counter (returning control to the interpreter
//! until the block is hot) or triggers translation and compilation.
//!
//! Grounded in the teacher's `riscv-vm/src/jit/mod.rs` tier structure
//! (`JitTier`, threshold-gated promotion, blacklist-on-failure) but the
//! compiled artifact is host machine code via `backend::host_backend()`
//! instead of a WASM module.

pub mod backend;
pub mod cache;
pub mod heap;
pub mod ir;
pub mod regalloc;

use crate::bus::Bus;
use crate::cpu::Hart;
use crate::trap::{exception, Trap, TrapKind};
use cache::{BlockCache, CompiledBlock};
use heap::CodeHeap;

/// Number of interpreted executions a block must see before it's worth the
/// cost of translating and compiling it.
const COMPILE_THRESHOLD: u32 = 16;

type CompiledFn = unsafe extern "C" fn(*mut u64) -> u64;

pub struct Jit {
    cache: BlockCache,
    heap: CodeHeap,
    backend: Box<dyn backend::Backend>,
}

impl Jit {
    pub fn new() -> Self {
        Self {
            cache: BlockCache::new(),
            heap: CodeHeap::new(),
            backend: backend::host_backend(),
        }
    }

    /// Try to advance `hart` by one compiled block at its current `pc`.
    /// Returns `None` to tell the caller to fall back to the interpreter
    /// for this step (block not hot yet, not representable, or the block
    /// would straddle a page the software TLB hasn't resolved) -- `Some`
    /// means the block ran and `hart.pc` already reflects its exit point.
    pub fn try_execute(&mut self, hart: &mut Hart, bus: &mut Bus) -> Option<Result<(), Trap>> {
        let pc = hart.pc;

        if let Some(ptr) = hart.jit_tlb.lookup(pc) {
            return Some(self.run_compiled(hart, ptr as *const u8));
        }

        if self.cache.is_blacklisted(pc) {
            return None;
        }

        if let Some(block) = self.cache.get(pc) {
            hart.jit_tlb.insert(pc, block.code_ptr as usize);
            return Some(self.run_compiled(hart, block.code_ptr));
        }

        if self.cache.bump_exec_count(pc) < COMPILE_THRESHOLD {
            return None;
        }

        let ir_block = match ir::translate_block(hart, bus, pc) {
            Some(b) => b,
            None => {
                self.cache.blacklist(pc);
                return None;
            }
        };

        let code = backend::compile(&ir_block, self.backend.as_ref());
        let code_ptr = match self.heap.emit(&code) {
            Some(ptr) => ptr,
            None => {
                self.cache.blacklist(pc);
                return None;
            }
        };

        let compiled = CompiledBlock {
            code_ptr,
            byte_len: code.len() as u32,
            next_pc: ir_block.next_pc,
        };
        self.cache.insert(pc, compiled);
        hart.jit_tlb.insert(pc, code_ptr as usize);

        Some(self.run_compiled(hart, code_ptr))
    }

    /// Invoke a compiled block. The generated function reads and writes
    /// `Hart::regs` directly through the state pointer and returns the
    /// guest PC to resume at (§4.5's ABI contract).
    fn run_compiled(&self, hart: &mut Hart, code_ptr: *const u8) -> Result<(), Trap> {
        if hart.xlen == crate::cpu::Xlen::W32 {
            // This tier only compiles 64-bit ALU ops; RV32 harts stay on
            // the interpreter until a dedicated 32-bit IR lane exists.
            return Err(Trap::new(TrapKind::Exception(exception::ILLEGAL_INSTRUCTION), 0));
        }
        let f: CompiledFn = unsafe { std::mem::transmute(code_ptr) };
        let next_pc = unsafe { f(hart.regs.as_mut_ptr()) };
        hart.pc = next_pc;
        Ok(())
    }

    /// Flush every compiled block and the code heap (FENCE.I-wide, or a
    /// full reset). `Hart::jit_tlb` is the caller's responsibility (`§5`
    /// resets each hart's TLBs independently of the shared `Jit`).
    pub fn flush(&mut self) {
        self.cache.flush();
        self.heap.reset();
    }

    /// Narrower invalidation for a guest store landing inside the range of
    /// a cached block's start address (self-modifying code, §9).
    pub fn invalidate_range(&mut self, addr: u64, len: u64) {
        self.cache.invalidate_range(addr, len);
    }
}

impl Default for Jit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::cpu::Xlen;

    fn addi_program(bus: &mut Bus, base: u64) {
        // addi x1, x0, 5 ; addi x2, x1, 3
        bus.write(base, 4, ((5u32) << 20 | (0 << 15) | (0 << 12) | (1 << 7) | 0x13) as u64).unwrap();
        bus.write(base + 4, 4, ((3u32) << 20 | (1 << 15) | (0 << 12) | (2 << 7) | 0x13) as u64).unwrap();
    }

    #[test]
    fn cold_block_stays_on_interpreter_until_threshold() {
        let mut bus = Bus::new(0x8000_0000, 4096);
        let mut hart = Hart::new(0, Xlen::W64, 0x8000_0000);
        addi_program(&mut bus, 0x8000_0000);
        let mut jit = Jit::new();
        for _ in 0..COMPILE_THRESHOLD - 1 {
            assert!(jit.try_execute(&mut hart, &mut bus).is_none());
        }
    }

    #[test]
    fn blacklists_blocks_with_no_representable_leading_instruction() {
        let mut bus = Bus::new(0x8000_0000, 4096);
        let mut hart = Hart::new(0, Xlen::W64, 0x8000_0000);
        bus.write(0x8000_0000, 4, 0x0000006f).unwrap(); // jal x0, 0
        let mut jit = Jit::new();
        for _ in 0..COMPILE_THRESHOLD {
            jit.try_execute(&mut hart, &mut bus);
        }
        assert!(jit.cache.is_blacklisted(0x8000_0000));
    }
}
