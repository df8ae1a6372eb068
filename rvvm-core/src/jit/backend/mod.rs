//! RVJIT native code backends (C5, §4.5). Each backend emits a single
//! function with the signature `extern "C" fn(cpu_state: *mut u64) -> u64`
//! (System V / AAPCS / RISC-V calling convention, argument 0 = pointer to
//! `Hart::regs`, return value = `next_pc`) for the IR op subset `ir.rs`
//! produces.
//!
//! Grounded in the teacher's `jit/encoder.rs` shape (a builder struct
//! accumulating instructions into a buffer, one emit call per IR op) but
//! targets raw host opcodes instead of WASM.

pub mod arm;
pub mod arm64;
pub mod riscv;
pub mod x86_64;

use super::ir::{IrBlock, VReg};
use super::regalloc::{HostReg, RegAlloc};

/// Per-op codegen contract every backend implements identically in shape,
/// differing only in the byte patterns emitted.
pub trait Backend {
    fn name(&self) -> &'static str;
    fn emit_prologue(&self, out: &mut Vec<u8>);
    fn emit_epilogue(&self, out: &mut Vec<u8>, next_pc: u64);
    fn emit_load_gpr(&self, out: &mut Vec<u8>, hreg: HostReg, gpr: u8);
    fn emit_store_gpr(&self, out: &mut Vec<u8>, gpr: u8, hreg: HostReg);
    fn emit_load_imm(&self, out: &mut Vec<u8>, hreg: HostReg, imm: i64);
    fn emit_alu(&self, out: &mut Vec<u8>, op: AluOp, dst: HostReg, a: HostReg, b: HostReg);
    fn emit_alu_imm(&self, out: &mut Vec<u8>, dst: HostReg, a: HostReg, imm: i32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

/// Compile `block` to a standalone function body using `backend`. Returns
/// `None` if the block needs more than one extra scratch register per op
/// than `RegAlloc` can provide at once -- in practice never happens for
/// this tier's 3-operand ops.
pub fn compile(block: &IrBlock, backend: &dyn Backend) -> Vec<u8> {
    let mut out = Vec::new();
    let mut ra = RegAlloc::new();
    backend.emit_prologue(&mut out);

    for op in &block.ops {
        for vreg in op_inputs(op) {
            claim_and_sync(backend, &mut out, &mut ra, vreg);
        }
        emit_op(backend, &mut out, &mut ra, op);
    }

    for (vreg, hreg) in ra.reclaim_all() {
        if let VReg::Gpr(g) = vreg {
            backend.emit_store_gpr(&mut out, g, hreg);
        }
    }

    backend.emit_epilogue(&mut out, block.next_pc);
    out
}

/// Claim a host register for `vreg`, emitting whatever `RegAlloc` says is
/// necessary to keep the register file consistent: a writeback of any
/// binding evicted to make room, and a reload of `vreg`'s own value if this
/// claim isn't already resident (first use, or re-claimed after having been
/// spilled earlier in the block).
fn claim_and_sync(backend: &dyn Backend, out: &mut Vec<u8>, ra: &mut RegAlloc, vreg: VReg) -> HostReg {
    let claim = ra.claim_hreg(vreg);
    if let Some(VReg::Gpr(evicted)) = claim.evicted {
        backend.emit_store_gpr(out, evicted, claim.hreg);
    }
    if claim.fresh {
        if let VReg::Gpr(g) = vreg {
            backend.emit_load_gpr(out, claim.hreg, g);
        }
    }
    claim.hreg
}

fn op_inputs(op: &super::ir::IrOp) -> Vec<VReg> {
    use super::ir::IrOp::*;
    match *op {
        Add { a, b, .. } | Sub { a, b, .. } | And { a, b, .. } | Or { a, b, .. } | Xor { a, b, .. } => vec![a, b],
        AddImm { a, .. } => vec![a],
        LoadImm { .. } => vec![],
    }
}

fn emit_op(backend: &dyn Backend, out: &mut Vec<u8>, ra: &mut RegAlloc, op: &super::ir::IrOp) {
    use super::ir::IrOp::*;
    match *op {
        Add { dst, a, b } => {
            let (d, x, y) = (claim_and_sync(backend, out, ra, dst), claim_and_sync(backend, out, ra, a), claim_and_sync(backend, out, ra, b));
            backend.emit_alu(out, AluOp::Add, d, x, y)
        }
        Sub { dst, a, b } => {
            let (d, x, y) = (claim_and_sync(backend, out, ra, dst), claim_and_sync(backend, out, ra, a), claim_and_sync(backend, out, ra, b));
            backend.emit_alu(out, AluOp::Sub, d, x, y)
        }
        And { dst, a, b } => {
            let (d, x, y) = (claim_and_sync(backend, out, ra, dst), claim_and_sync(backend, out, ra, a), claim_and_sync(backend, out, ra, b));
            backend.emit_alu(out, AluOp::And, d, x, y)
        }
        Or { dst, a, b } => {
            let (d, x, y) = (claim_and_sync(backend, out, ra, dst), claim_and_sync(backend, out, ra, a), claim_and_sync(backend, out, ra, b));
            backend.emit_alu(out, AluOp::Or, d, x, y)
        }
        Xor { dst, a, b } => {
            let (d, x, y) = (claim_and_sync(backend, out, ra, dst), claim_and_sync(backend, out, ra, a), claim_and_sync(backend, out, ra, b));
            backend.emit_alu(out, AluOp::Xor, d, x, y)
        }
        AddImm { dst, a, imm } => {
            let (d, x) = (claim_and_sync(backend, out, ra, dst), claim_and_sync(backend, out, ra, a));
            backend.emit_alu_imm(out, d, x, imm)
        }
        LoadImm { dst, imm } => {
            let d = claim_and_sync(backend, out, ra, dst);
            backend.emit_load_imm(out, d, imm)
        }
    }
}

/// Select the backend matching the host this process is running on, per
/// spec.md's retargetable-JIT requirement (x86/x86-64/ARM/ARM64/RISC-V).
pub fn host_backend() -> Box<dyn Backend> {
    #[cfg(target_arch = "x86_64")]
    return Box::new(x86_64::X86_64Backend);
    #[cfg(target_arch = "aarch64")]
    return Box::new(arm64::Arm64Backend);
    #[cfg(target_arch = "arm")]
    return Box::new(arm::ArmBackend);
    #[cfg(target_arch = "riscv64")]
    return Box::new(riscv::RiscVBackend);
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm", target_arch = "riscv64")))]
    compile_error!("no RVJIT backend for this host architecture");
}
