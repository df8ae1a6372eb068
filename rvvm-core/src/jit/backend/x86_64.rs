//! x86-64 (SysV) backend. ABI: `rdi` holds the `Hart::regs` base pointer on
//! entry, `rax` holds `next_pc` on return. The six allocatable host
//! registers are caller-saved GPRs so the generated function needs no
//! prologue/epilogue frame management.

use super::{AluOp, Backend};
use crate::jit::regalloc::HostReg;

/// (low 3 bits of the encoding, needs REX.B/R extension bit)
const HREGS: [(u8, bool); crate::jit::regalloc::NUM_HREGS] = [
    (0, false), // rax
    (1, false), // rcx
    (2, false), // rdx
    (6, false), // rsi
    (0, true),  // r8
    (1, true),  // r9
];

const RDI_LOW3: u8 = 7;

fn reg(h: HostReg) -> (u8, bool) {
    HREGS[h.0 as usize]
}

fn rex(w: bool, r_ext: bool, x_ext: bool, b_ext: bool) -> u8 {
    0x40 | (if w { 0x08 } else { 0 }) | (if r_ext { 0x04 } else { 0 }) | (if x_ext { 0x02 } else { 0 }) | (if b_ext { 0x01 } else { 0 })
}

pub struct X86_64Backend;

impl Backend for X86_64Backend {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn emit_prologue(&self, _out: &mut Vec<u8>) {
        // No stack frame: only caller-saved scratch registers are used.
    }

    fn emit_epilogue(&self, out: &mut Vec<u8>, next_pc: u64) {
        // movabs rax, next_pc
        out.push(rex(true, false, false, false));
        out.push(0xB8); // +rax (enc 0)
        out.extend_from_slice(&next_pc.to_le_bytes());
        out.push(0xC3); // ret
    }

    fn emit_load_gpr(&self, out: &mut Vec<u8>, hreg: HostReg, gpr: u8) {
        let (r_low3, r_ext) = reg(hreg);
        out.push(rex(true, r_ext, false, false));
        out.push(0x8B); // mov r64, r/m64
        out.push(0x80 | (r_low3 << 3) | RDI_LOW3);
        out.extend_from_slice(&((gpr as i32) * 8).to_le_bytes());
    }

    fn emit_store_gpr(&self, out: &mut Vec<u8>, gpr: u8, hreg: HostReg) {
        let (r_low3, r_ext) = reg(hreg);
        out.push(rex(true, r_ext, false, false));
        out.push(0x89); // mov r/m64, r64
        out.push(0x80 | (r_low3 << 3) | RDI_LOW3);
        out.extend_from_slice(&((gpr as i32) * 8).to_le_bytes());
    }

    fn emit_load_imm(&self, out: &mut Vec<u8>, hreg: HostReg, imm: i64) {
        let (low3, ext) = reg(hreg);
        out.push(rex(true, false, false, ext));
        out.push(0xB8 | low3);
        out.extend_from_slice(&(imm as u64).to_le_bytes());
    }

    fn emit_alu(&self, out: &mut Vec<u8>, op: AluOp, dst: HostReg, a: HostReg, b: HostReg) {
        // dst = a; dst OP= b  (always materialize `a` into `dst` first so
        // non-commutative ops like SUB read operands in the right order)
        self.emit_mov_reg_reg(out, dst, a);
        let opcode = match op {
            AluOp::Add => 0x01,
            AluOp::Sub => 0x29,
            AluOp::And => 0x21,
            AluOp::Or => 0x09,
            AluOp::Xor => 0x31,
        };
        let (dst_low3, dst_ext) = reg(dst);
        let (b_low3, b_ext) = reg(b);
        out.push(rex(true, b_ext, false, dst_ext));
        out.push(opcode);
        out.push(0xC0 | (b_low3 << 3) | dst_low3);
    }

    fn emit_alu_imm(&self, out: &mut Vec<u8>, dst: HostReg, a: HostReg, imm: i32) {
        if dst != a {
            self.emit_mov_reg_reg(out, dst, a);
        }
        let (dst_low3, dst_ext) = reg(dst);
        out.push(rex(true, false, false, dst_ext));
        out.push(0x81); // grp1 r/m64, imm32
        out.push(0xC0 | (0 << 3) | dst_low3); // /0 = ADD
        out.extend_from_slice(&imm.to_le_bytes());
    }
}

impl X86_64Backend {
    fn emit_mov_reg_reg(&self, out: &mut Vec<u8>, dst: HostReg, src: HostReg) {
        if dst == src {
            return;
        }
        let (dst_low3, dst_ext) = reg(dst);
        let (src_low3, src_ext) = reg(src);
        out.push(rex(true, src_ext, false, dst_ext));
        out.push(0x89); // mov r/m64, r64
        out.push(0xC0 | (src_low3 << 3) | dst_low3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epilogue_ends_in_ret() {
        let mut out = Vec::new();
        X86_64Backend.emit_epilogue(&mut out, 0x8000_1000);
        assert_eq!(*out.last().unwrap(), 0xC3);
    }

    #[test]
    fn load_gpr_uses_rdi_base() {
        let mut out = Vec::new();
        X86_64Backend.emit_load_gpr(&mut out, HostReg(0), 3);
        // REX.W, mov opcode, modrm with rm=RDI(111)
        assert_eq!(out[1], 0x8B);
        assert_eq!(out[2] & 0x07, RDI_LOW3);
    }
}
