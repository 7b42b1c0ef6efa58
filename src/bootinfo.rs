// =============================================================================
// nimbus kernel — Boot Information Snapshot
// =============================================================================
//
// One immutable struct gathering everything the memory-management core
// needs out of the Limine handshake: memory map, HHDM offset, the
// kernel's own load addresses, its stack, and an optional framebuffer.
// Built once in `_start`, before anything else runs, and passed down by
// reference from there — the rest of the kernel touches Limine's own
// request/response statics nowhere outside `arch::x86_64::boot`.
// =============================================================================

use crate::arch::x86_64::boot::{self, FramebufferInfo};

// `kernel_stack_top` is a linker-provided boundary symbol (build/linker.ld),
// which only exists when linking the real kernel image — the host test
// target has no such symbol, so this whole module is excluded under
// `cfg(test)`.
#[cfg(not(test))]
unsafe extern "C" {
    static kernel_stack_top: u8;
}

/// Snapshot of the boot environment, taken once and never mutated.
pub struct BootInfo {
    pub memmap: &'static [&'static limine::memory_map::Entry],
    pub hhdm_offset: u64,
    pub kernel_phys_base: u64,
    pub kernel_virt_base: u64,
    pub kernel_stack_top: u64,
    pub framebuffer: Option<FramebufferInfo>,
}

impl BootInfo {
    /// Reads every Limine response this kernel needs exactly once.
    ///
    /// # Safety
    /// Must run after Limine has filled in its responses (i.e. from
    /// `_start` onward) and only once — later callers should receive
    /// a reference to the value this returns, not call this again.
    #[cfg(not(test))]
    pub unsafe fn capture() -> Self {
        let (kernel_phys_base, kernel_virt_base) = boot::get_kernel_address();
        Self {
            memmap: boot::get_memory_map(),
            hhdm_offset: boot::get_hhdm_offset(),
            kernel_phys_base,
            kernel_virt_base,
            // SAFETY: `kernel_stack_top` is a linker-provided boundary
            // symbol (build/linker.ld); its address, not its pointee, is
            // the value we want.
            kernel_stack_top: unsafe { &kernel_stack_top as *const u8 as u64 },
            framebuffer: boot::get_framebuffer_info(),
        }
    }

    /// Memory map entries as `(base, length)` pairs, the shape
    /// `vmm::init_kernel_pagemap` and `pmm::init` both consume.
    pub fn memmap_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.memmap.iter().map(|e| (e.base, e.length))
    }
}
