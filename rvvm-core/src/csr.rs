//! Control and status register addresses, plus the global CSR dispatch
//! table (§4.3: "CSR operations go through a global dispatch table
//! initialized once at process start").
//!
//! Address constants follow the naming the teacher uses in
//! `cpu/execution.rs` (`CSR_MSTATUS`, `CSR_MEPC`, `CSR_SEPC`, `CSR_SATP`,
//! `CSR_MIP`, `CSR_MHARTID`, `CSR_TIME`, `CSR_MENVCFG`, `CSR_STIMECMP`).

pub const CSR_SSTATUS: u16 = 0x100;
pub const CSR_SIE: u16 = 0x104;
pub const CSR_STVEC: u16 = 0x105;
pub const CSR_SCOUNTEREN: u16 = 0x106;
pub const CSR_SENVCFG: u16 = 0x10A;
pub const CSR_SSCRATCH: u16 = 0x140;
pub const CSR_SEPC: u16 = 0x141;
pub const CSR_SCAUSE: u16 = 0x142;
pub const CSR_STVAL: u16 = 0x143;
pub const CSR_SIP: u16 = 0x144;
pub const CSR_STIMECMP: u16 = 0x14D;
pub const CSR_SATP: u16 = 0x180;

pub const CSR_MSTATUS: u16 = 0x300;
pub const CSR_MISA: u16 = 0x301;
pub const CSR_MEDELEG: u16 = 0x302;
pub const CSR_MIDELEG: u16 = 0x303;
pub const CSR_MIE: u16 = 0x304;
pub const CSR_MTVEC: u16 = 0x305;
pub const CSR_MENVCFG: u16 = 0x30A;
pub const CSR_MSCRATCH: u16 = 0x340;
pub const CSR_MEPC: u16 = 0x341;
pub const CSR_MCAUSE: u16 = 0x342;
pub const CSR_MTVAL: u16 = 0x343;
pub const CSR_MIP: u16 = 0x344;

pub const CSR_TIME: u16 = 0xC01;
pub const CSR_CYCLE: u16 = 0xC00;
pub const CSR_INSTRET: u16 = 0xC02;

pub const CSR_MVENDORID: u16 = 0xF11;
pub const CSR_MARCHID: u16 = 0xF12;
pub const CSR_MIMPID: u16 = 0xF13;
pub const CSR_MHARTID: u16 = 0xF14;

pub const MSTATUS_SIE: u64 = 1 << 1;
pub const MSTATUS_MIE: u64 = 1 << 3;
pub const MSTATUS_SPIE: u64 = 1 << 5;
pub const MSTATUS_MPIE: u64 = 1 << 7;
pub const MSTATUS_SPP: u64 = 1 << 8;
pub const MSTATUS_MPP_SHIFT: u32 = 11;
pub const MSTATUS_MPP_MASK: u64 = 0b11 << MSTATUS_MPP_SHIFT;
pub const MSTATUS_MPRV: u64 = 1 << 17;
pub const MSTATUS_SUM: u64 = 1 << 18;
pub const MSTATUS_MXR: u64 = 1 << 19;

/// CSR access outcome: CSRs that don't exist, or that the current
/// privilege can't reach, trap illegal-instruction rather than panicking.
pub type CsrResult = Result<u64, ()>;

/// A single entry in the global dispatch table.
pub struct CsrOps {
    pub read: fn(&crate::cpu::Hart, u16) -> CsrResult,
    pub write: fn(&mut crate::cpu::Hart, u16, u64) -> Result<(), ()>,
}

fn default_read(hart: &crate::cpu::Hart, addr: u16) -> CsrResult {
    hart.csrs.get((addr & 0xfff) as usize).copied().ok_or(())
}

fn default_write(hart: &mut crate::cpu::Hart, addr: u16, val: u64) -> Result<(), ()> {
    if let Some(slot) = hart.csrs.get_mut((addr & 0xfff) as usize) {
        *slot = val;
        Ok(())
    } else {
        Err(())
    }
}

fn time_read(hart: &crate::cpu::Hart, _addr: u16) -> CsrResult {
    Ok(hart.timer_value())
}

fn readonly_write(_hart: &mut crate::cpu::Hart, _addr: u16, _val: u64) -> Result<(), ()> {
    Ok(())
}

static DEFAULT_OPS: CsrOps = CsrOps {
    read: default_read,
    write: default_write,
};

static TIME_OPS: CsrOps = CsrOps {
    read: time_read,
    write: readonly_write,
};

/// Global table initialized once at process start, as spec.md §4.3
/// requires. `OnceLock` gives us the teacher's "init once" idiom without
/// pulling in `once_cell`/`lazy_static`, neither of which the teacher's
/// dependency set carries.
static DISPATCH: std::sync::OnceLock<()> = std::sync::OnceLock::new();

pub fn init() {
    DISPATCH.get_or_init(|| ());
}

pub fn lookup(addr: u16) -> &'static CsrOps {
    init();
    match addr {
        CSR_TIME => &TIME_OPS,
        CSR_CYCLE => &TIME_OPS,
        _ => &DEFAULT_OPS,
    }
}
