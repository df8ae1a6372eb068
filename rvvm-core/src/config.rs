//! CLI surface (§6's device-facing flags, ambient per SPEC_FULL.md §3).
//!
//! Grounded in `relay/src/main.rs`'s `#[derive(Parser)] struct Args` shape
//! and `vm/src/main.rs`'s single positional kernel path, merged into one
//! flag set covering RAM size, hart count, XLEN, image path, and the
//! port-forward/disk/gui surface named in spec.md §6.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "RISC-V virtual machine monitor")]
pub struct Args {
    /// Path to the guest kernel/firmware image (raw binary or ELF).
    pub kernel: String,

    /// RAM size in megabytes.
    #[arg(long, default_value_t = 256)]
    pub mem: u64,

    /// Number of harts.
    #[arg(long = "smp", default_value_t = 1)]
    pub hart_count: usize,

    /// Guest register width.
    #[arg(long, default_value = "rv64")]
    pub isa: String,

    /// Attach a disk image (RVVD); may be repeated.
    #[arg(long = "image")]
    pub disk_images: Vec<String>,

    /// Port-forward spec, `[tcp/|udp/]host_addr=guest_addr` (§6); may be
    /// repeated.
    #[arg(long = "portfwd")]
    pub port_forwards: Vec<String>,

    /// GUI backend override. Accepted for ABI compatibility with the
    /// device surface; GUI backends are out of scope for this crate
    /// (spec.md §1) so this flag is parsed but otherwise unused.
    #[arg(long)]
    pub gui: Option<String>,

    /// Reset the machine into firmware instead of starting execution.
    #[arg(long)]
    pub reset: bool,
}

impl Args {
    pub fn ram_bytes(&self) -> u64 {
        self.mem * 1024 * 1024
    }

    pub fn xlen(&self) -> crate::cpu::Xlen {
        match self.isa.as_str() {
            "rv32" => crate::cpu::Xlen::W32,
            _ => crate::cpu::Xlen::W64,
        }
    }
}
