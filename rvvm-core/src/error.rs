//! Host-facing error kinds (§7). Guest traps are *not* represented here —
//! those are `crate::trap::Trap`, handled entirely inside the hart and never
//! propagated as a Rust `Result` past the dispatcher.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("address out of bounds: {0:#x}")]
    OutOfBounds(u64),
    #[error("operation size {size} at {addr:#x} outside region bounds [{min}, {max}]")]
    BadSize { addr: u64, size: u64, min: u64, max: u64 },
    #[error("MMIO region [{begin:#x}, {end:#x}) overlaps an existing region")]
    Overlap { begin: u64, end: u64 },
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("failed to read image {path}: {source}")]
    Image { path: String, #[source] source: std::io::Error },
    #[error("failed to parse ELF image: {0}")]
    Elf(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("port-forward spec {0:?} is invalid")]
    PortForward(String),
    #[error("failed to bind host port: {0}")]
    Bind(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RvvdError {
    #[error("bad magic in RVVD header")]
    BadMagic,
    #[error("unsupported RVVD version {0}")]
    UnsupportedVersion(u32),
    #[error("offset/count {0} is not 512-byte aligned")]
    Misaligned(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A deduplicated one-shot warning: logs a given message via `log::warn!`
/// only the first time it is seen. Used for host-fault degradation paths
/// (JIT heap allocation failure, mmap/mprotect failure) so a hot loop that
/// keeps hitting the same failure does not spam the log.
#[derive(Default)]
pub struct WarnOnce {
    seen: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl WarnOnce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&self, msg: impl Into<String>) {
        let msg = msg.into();
        let mut seen = self.seen.lock().unwrap();
        if seen.insert(msg.clone()) {
            log::warn!("{msg}");
        }
    }
}
