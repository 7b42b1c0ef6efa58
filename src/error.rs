//! Crate-wide error kinds.
//!
//! Allocation paths never propagate these as `Result` — they return a
//! sentinel (`None` / `-1`) instead — but every failure is logged
//! through this type first so the failure reason is never silently
//! dropped.

use core::fmt;

/// The six error kinds the memory/scheduling core can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The PMM has no frame (or no run of frames) left to satisfy a request.
    OutOfPhysicalMemory,
    /// An address was null, misaligned, or outside an expected range.
    InvalidAddress,
    /// A call received a nonsensical argument (e.g. `pages == 0`).
    InvalidArgument,
    /// A VMA region lookup (`free`) found no region at the given start.
    RegionNotFound,
    /// A fixed-capacity table (the PCB table) is full.
    TableCapacityExceeded,
    /// The boot environment is missing something the kernel cannot run without.
    UnsupportedBootEnvironment,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfPhysicalMemory => "out of physical memory",
            KernelError::InvalidAddress => "invalid address",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::RegionNotFound => "region not found",
            KernelError::TableCapacityExceeded => "table capacity exceeded",
            KernelError::UnsupportedBootEnvironment => "unsupported boot environment",
        };
        f.write_str(msg)
    }
}
