//! Minimal device models the dispatcher/machine observe directly (§6).
//! Everything else named as out of scope in spec.md (NVMe/VirtIO/PLIC/
//! CLINT/GUI) stays unimplemented; this module only carries what the spec
//! explicitly keeps.

pub mod syscon;
