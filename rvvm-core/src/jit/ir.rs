//! RVJIT intermediate representation (C4, §4.4): a short straight-line
//! sequence of 3-operand ops translated from a hot guest basic block.
//!
//! Grounded in the teacher's block-compilation shape (`BlockCompiler`
//! decoding a run of `MicroOp`s up to `MAX_BLOCK_SIZE`, bailing at the first
//! instruction it can't represent) but targets this IR at a native-code
//! backend (`backend::Backend`) instead of `wasm-encoder`.

use crate::bus::Bus;
use crate::cpu::Hart;

pub const MAX_BLOCK_LEN: usize = 32;

/// A virtual register: either a guest integer register or a block-local
/// scratch value produced by an earlier op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VReg {
    Gpr(u8),
    Scratch(u8),
}

#[derive(Debug, Clone, Copy)]
pub enum IrOp {
    /// dst = a OP b
    Add { dst: VReg, a: VReg, b: VReg },
    Sub { dst: VReg, a: VReg, b: VReg },
    And { dst: VReg, a: VReg, b: VReg },
    Or { dst: VReg, a: VReg, b: VReg },
    Xor { dst: VReg, a: VReg, b: VReg },
    /// dst = a + imm
    AddImm { dst: VReg, a: VReg, imm: i32 },
    /// dst = imm (sign-extended)
    LoadImm { dst: VReg, imm: i64 },
}

pub struct IrBlock {
    pub start_pc: u64,
    pub ops: Vec<IrOp>,
    /// Guest registers written by this block, in program order of first
    /// write -- the backend must write these back to `Hart::regs` in the
    /// epilogue.
    pub dirty_gprs: Vec<u8>,
    /// PC to resume interpretation at after the block (always a fallthrough
    /// address; this tier never compiles control flow).
    pub next_pc: u64,
}

fn scratch_base(op: u32) -> Option<(u8, u8, u8, bool, u32)> {
    let opcode = op & 0x7f;
    let rd = ((op >> 7) & 0x1f) as u8;
    let rs1 = ((op >> 15) & 0x1f) as u8;
    let funct3 = (op >> 12) & 0x7;
    match opcode {
        0x13 if funct3 == 0 => Some((rd, rs1, 0, true, op)), // ADDI
        0x33 => Some((rd, rs1, ((op >> 20) & 0x1f) as u8, false, op)), // OP (R-type)
        _ => None,
    }
}

/// Translate a straight-line run starting at `pc`, bailing at the first
/// instruction outside the supported subset (loads/stores/ADD family) or at
/// `MAX_BLOCK_LEN`. Returns `None` if the very first instruction isn't
/// representable -- the caller should not bother caching a zero-length
/// block (§4.4's "unsuitable block" outcome).
pub fn translate_block(hart: &mut Hart, bus: &mut Bus, pc: u64) -> Option<IrBlock> {
    let mut ops = Vec::new();
    let mut dirty = Vec::new();
    let mut cur = pc;

    for _ in 0..MAX_BLOCK_LEN {
        let saved_pc = hart.pc;
        hart.pc = cur;
        let inst = match hart.fetch(bus) {
            Ok(i) => i,
            Err(_) => {
                hart.pc = saved_pc;
                break;
            }
        };
        hart.pc = saved_pc;

        if inst & 0x3 != 0x3 {
            break; // compressed instructions are not modeled by this tier
        }

        let opcode = inst & 0x7f;
        let rd = ((inst >> 7) & 0x1f) as u8;
        let rs1 = ((inst >> 15) & 0x1f) as u8;
        let funct3 = (inst >> 12) & 0x7;
        let funct7 = (inst >> 25) & 0x7f;

        match opcode {
            0x13 if funct3 == 0 => {
                let imm = (inst as i32) >> 20;
                ops.push(IrOp::AddImm {
                    dst: VReg::Gpr(rd),
                    a: VReg::Gpr(rs1),
                    imm,
                });
            }
            0x33 if funct7 == 0x00 || funct7 == 0x20 => {
                let rs2 = ((inst >> 20) & 0x1f) as u8;
                let op = match (funct3, funct7) {
                    (0x0, 0x00) => IrOp::Add { dst: VReg::Gpr(rd), a: VReg::Gpr(rs1), b: VReg::Gpr(rs2) },
                    (0x0, 0x20) => IrOp::Sub { dst: VReg::Gpr(rd), a: VReg::Gpr(rs1), b: VReg::Gpr(rs2) },
                    (0x4, 0x00) => IrOp::Xor { dst: VReg::Gpr(rd), a: VReg::Gpr(rs1), b: VReg::Gpr(rs2) },
                    (0x6, 0x00) => IrOp::Or { dst: VReg::Gpr(rd), a: VReg::Gpr(rs1), b: VReg::Gpr(rs2) },
                    (0x7, 0x00) => IrOp::And { dst: VReg::Gpr(rd), a: VReg::Gpr(rs1), b: VReg::Gpr(rs2) },
                    _ => break,
                };
                ops.push(op);
            }
            // Loads/stores (0x03/0x23) need a TLB-guarded host dereference
            // this tier doesn't implement yet -- bail to the interpreter
            // rather than emit an unguarded host access against a guest
            // address (§4.3: "any instruction the JIT declines to emit
            // falls back to it").
            _ => break,
        }

        if rd != 0 && !dirty.contains(&rd) {
            dirty.push(rd);
        }
        cur = cur.wrapping_add(4);
        let _ = scratch_base; // reserved hook for a future peephole pass
    }

    if ops.is_empty() {
        return None;
    }

    Some(IrBlock {
        start_pc: pc,
        ops,
        dirty_gprs: dirty,
        next_pc: cur,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::cpu::Xlen;

    #[test]
    fn translates_straight_line_arithmetic() {
        let mut bus = Bus::new(0x8000_0000, 4096);
        let mut hart = Hart::new(0, Xlen::W64, 0x8000_0000);
        // addi x1, x0, 5 ; addi x2, x1, 1 ; add x3, x1, x2
        let insns: [u32; 3] = [
            (5 << 20) | (0 << 15) | (0 << 12) | (1 << 7) | 0x13,
            (1 << 20) | (1 << 15) | (0 << 12) | (2 << 7) | 0x13,
            (0 << 25) | (2 << 20) | (1 << 15) | (0 << 12) | (3 << 7) | 0x33,
        ];
        for (i, inst) in insns.iter().enumerate() {
            bus.write(0x8000_0000 + i as u64 * 4, 4, *inst as u64).unwrap();
        }
        let block = translate_block(&mut hart, &mut bus, 0x8000_0000).unwrap();
        assert_eq!(block.ops.len(), 3);
        assert_eq!(block.next_pc, 0x8000_000c);
        assert!(block.dirty_gprs.contains(&3));
    }

    #[test]
    fn bails_on_unsupported_leading_instruction() {
        let mut bus = Bus::new(0x8000_0000, 4096);
        let mut hart = Hart::new(0, Xlen::W64, 0x8000_0000);
        // jal x0, 0 (an infinite branch to self - not in the supported subset)
        bus.write(0x8000_0000, 4, 0x0000006f).unwrap();
        assert!(translate_block(&mut hart, &mut bus, 0x8000_0000).is_none());
    }
}
