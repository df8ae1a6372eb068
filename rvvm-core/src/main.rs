//! `rvvm` CLI: parses the flag surface of §6, creates a machine, loads the
//! guest image, attaches the syscon device, and runs to completion or
//! poweroff/reset.
//!
//! Grounded in `vm/src/main.rs`'s top-level shape (parse args, load image,
//! run a blocking loop, report the offending instruction on halt) widened
//! to the CLI surface `relay/src/main.rs` derives with `clap::Parser`.
//! Network attachment (`rvvm-tap`'s `TapMmioDevice`) is left to an
//! embedder composing both crates, since `rvvm-core` cannot depend back
//! on `rvvm-tap` — see DESIGN.md.

use clap::Parser;
use rvvm_core::config::Args;
use rvvm_core::machine::Machine;
use rvvm_core::rvvd::RvvdImage;
use std::path::Path;
use std::process::ExitCode;

/// Default syscon MMIO base, matching the window size declared in §6.
const SYSCON_BASE: u64 = 0x1000_0000;

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    for path in &args.disk_images {
        match RvvdImage::open(Path::new(path)) {
            Ok(image) => log::info!("attached disk image {path}: {} bytes", image.size_bytes()),
            Err(e) => {
                eprintln!("failed to open disk image {path}: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let xlen = args.xlen();
    let ram_base = 0x8000_0000u64;
    let mut machine = Machine::create(ram_base, args.ram_bytes(), args.hart_count, xlen, ram_base);

    if let Err(e) = machine.attach_syscon(SYSCON_BASE) {
        eprintln!("failed to attach syscon: {e}");
        return ExitCode::FAILURE;
    }

    let entry = {
        let bus_arc = machine.bus();
        let mut bus = bus_arc.lock().unwrap();
        match rvvm_core::loader::load_image(&mut bus, ram_base, Path::new(&args.kernel)) {
            Ok(entry) => entry,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        }
    };
    log::info!("guest entry point: {:#x}", entry);
    machine.set_entry_pc(entry);

    if args.hart_count <= 1 {
        machine.run_single_hart_blocking();
    } else {
        machine.start();
        while machine.running() {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        machine.pause();
    }

    if machine.needs_reset() {
        log::info!("machine requested reset; exiting (re-run to boot again)");
    }

    ExitCode::SUCCESS
}
