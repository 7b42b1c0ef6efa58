// =============================================================================
// nimbus kernel — Virtual Memory Manager (x86_64 four-level paging)
// =============================================================================
//
// Owns the page table format: PML4 -> PDPT -> PD -> PT, 512 entries each,
// 4 KiB leaves only (no huge pages in this core). Page table entries are
// tagged 64-bit integers, not language references — the hardware walks
// them, so they are modeled as an opaque newtype with accessor methods
// rather than a typed tree.
// =============================================================================

use crate::arch::cpu;
use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::pmm;
use bitflags::bitflags;
use core::fmt;
use core::ops::{Index, IndexMut};
use spin::Once;

bitflags! {
    /// Page table entry flag bits. Bit layout matches the hardware exactly
    /// in the standard Intel/AMD entry format: P(0), W(1), U(2), NX(63).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE_PAGE     = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageTableFlags {
    pub const KERNEL_RW: Self = Self::from_bits_truncate(Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::NO_EXECUTE.bits());
    pub const KERNEL_RO: Self = Self::from_bits_truncate(Self::PRESENT.bits() | Self::NO_EXECUTE.bits());
    pub const KERNEL_EXEC: Self = Self::from_bits_truncate(Self::PRESENT.bits());
    /// Flags intermediate (non-leaf) page table entries get, unconditionally:
    /// present|write|user, so a user leaf further down the tree is reachable
    /// regardless of whether this particular mapping is user or kernel.
    pub const INTERMEDIATE: Self = Self::from_bits_truncate(Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits());
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// A single page table entry: a tagged 64-bit integer, not a reference.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    /// OR's additional flag bits into an existing (presumably intermediate)
    /// entry, matching the original `table[index] |= flags & 0xFF` behavior.
    #[inline]
    pub fn or_flags(&mut self, flags: PageTableFlags) {
        self.0 |= flags.bits() & 0xFF;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("addr", &self.addr())
            .field("flags", &self.flags())
            .finish()
    }
}

/// A single 4 KiB page table (512 entries of 8 bytes each).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    pub fn zero(&mut self) {
        for e in self.entries.iter_mut() {
            e.clear();
        }
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, i: usize) -> &PageTableEntry {
        &self.entries[i]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, i: usize) -> &mut PageTableEntry {
        &mut self.entries[i]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    OutOfMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    NotMapped,
}

/// A top-level PML4 table identifying one address space.
///
/// Indices 0..256 are the address space's own mappings; 256..512 are the
/// shared kernel half, inherited by shallow copy from `KERNEL_PAGEMAP`
/// at `new_pagemap()` time.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pagemap {
    phys: PhysAddr,
}

impl Pagemap {
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    fn table(&self) -> &'static mut PageTable {
        let virt = self.phys.to_virt();
        unsafe { &mut *virt.as_mut_ptr::<PageTable>() }
    }
}

static KERNEL_PAGEMAP: Once<Pagemap> = Once::new();

fn page_table_indices(virt: VirtAddr) -> [usize; 4] {
    let [pt, pd, pdpt, pml4] = virt.page_table_indices();
    [pml4 as usize, pdpt as usize, pd as usize, pt as usize]
}

/// Walks (allocating as needed) from the PML4 down to the level-1 (PT)
/// table that would hold `virt`'s leaf entry, returning that table.
fn get_or_create_path(pml4: &mut PageTable, indices: [usize; 4]) -> Result<&'static mut PageTable, MapError> {
    let mut table: &mut PageTable = pml4;
    for &idx in &indices[..3] {
        let entry = &mut table[idx];
        if !entry.is_present() {
            let frame = pmm::request(1, false).ok_or(MapError::OutOfMemory)?;
            let next = frame.to_virt().as_mut_ptr::<PageTable>();
            unsafe { (*next).zero() };
            entry.set(frame, PageTableFlags::INTERMEDIATE);
        } else {
            entry.or_flags(PageTableFlags::INTERMEDIATE);
        }
        let next_phys = table[idx].addr();
        table = unsafe { &mut *next_phys.to_virt().as_mut_ptr::<PageTable>() };
    }
    Ok(table)
}

fn walk_path(pml4: &PageTable, indices: [usize; 4]) -> Option<&'static PageTable> {
    let mut table: &PageTable = pml4;
    for &idx in &indices[..3] {
        let entry = &table[idx];
        if !entry.is_present() {
            return None;
        }
        table = unsafe { &*entry.addr().to_virt().as_ptr::<PageTable>() };
    }
    Some(table)
}

/// Installs a 4 KiB mapping. Overwrites any existing leaf entry —
/// `map` is not idempotent with respect to flags; last write wins,
/// matching the original allocator's behavior.
pub fn map(pm: Pagemap, virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), MapError> {
    let indices = page_table_indices(virt);
    let pt = get_or_create_path(pm.table(), indices)?;
    pt[indices[3]].set(phys, flags | PageTableFlags::PRESENT);
    cpu::invlpg(virt.as_u64());
    Ok(())
}

/// Clears a leaf mapping, if present, and flushes its TLB entry.
pub fn unmap(pm: Pagemap, virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
    let indices = page_table_indices(virt);
    let pt = match walk_path(pm.table(), indices) {
        Some(pt) => pt,
        None => return Err(UnmapError::NotMapped),
    };
    // SAFETY: `pt` came from a present path; we only ever mutate through
    // the owning pagemap, serialized by the caller's lock (VMA/scheduler).
    let pt = unsafe { &mut *(pt as *const PageTable as *mut PageTable) };
    let entry = &mut pt[indices[3]];
    if !entry.is_present() {
        return Err(UnmapError::NotMapped);
    }
    let phys = entry.addr();
    entry.clear();
    cpu::invlpg(virt.as_u64());
    Ok(phys)
}

/// Resolves `virt` to its mapped physical frame, or `None` if any level
/// of the walk is not present.
pub fn translate(pm: Pagemap, virt: VirtAddr) -> Option<PhysAddr> {
    let indices = page_table_indices(virt);
    let pt = walk_path(pm.table(), indices)?;
    let entry = &pt[indices[3]];
    if !entry.is_present() {
        return None;
    }
    Some(entry.addr())
}

/// Like `translate`, but also returns the leaf entry's flags — used by
/// the scheduler's mirror-mapping of kernel pages into a fresh
/// process pagemap, which needs to reproduce the source mapping's
/// permissions rather than guessing a fixed flag set.
pub fn translate_with_flags(pm: Pagemap, virt: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
    let indices = page_table_indices(virt);
    let pt = walk_path(pm.table(), indices)?;
    let entry = &pt[indices[3]];
    if !entry.is_present() {
        return None;
    }
    Some((entry.addr(), entry.flags()))
}

/// Allocates a fresh pagemap. If the kernel pagemap has been installed,
/// its upper half (entries 256..511) is shallow-copied in so every
/// address space shares the kernel's mappings.
pub fn new_pagemap() -> Option<Pagemap> {
    let frame = pmm::request(1, false)?;
    let table = frame.to_virt().as_mut_ptr::<PageTable>();
    unsafe { (*table).zero() };
    let pm = Pagemap { phys: frame };

    if let Some(kernel) = KERNEL_PAGEMAP.get() {
        let kernel_table = kernel.table();
        let new_table = pm.table();
        for i in 256..512 {
            new_table[i] = kernel_table[i];
        }
    }

    Some(pm)
}

/// Releases only the top-level page back to the PMM. Intermediate tables
/// and mapped frames are the caller's responsibility — in practice the
/// owning `VmaContext` releases them first.
pub fn destroy_pagemap(pm: Pagemap) {
    pmm::release(pm.phys, 1);
}

/// Loads CR3 with the pagemap's physical address.
pub fn switch_pagemap(pm: Pagemap) {
    unsafe { cpu::write_cr3(pm.phys.as_u64()) };
}

/// Returns the kernel pagemap installed by `init_kernel_pagemap`.
///
/// # Panics
/// Panics if called before `init_kernel_pagemap` has run.
pub fn kernel_pagemap() -> Pagemap {
    *KERNEL_PAGEMAP
        .get()
        .expect("vmm: kernel pagemap not initialized")
}

/// Builds the initial kernel pagemap with the exact per-section
/// flag sets, installs it as `KERNEL_PAGEMAP`, and switches CR3 to it.
///
/// # Safety
/// Must run once, after `pmm::init`, with the sections' addresses valid
/// for the current boot image.
pub unsafe fn init_kernel_pagemap(sections: &KernelSections, memmap: &[(u64, u64)]) -> Pagemap {
    let frame = pmm::request(1, false).expect("VMM: out of memory building kernel pagemap");
    let table = frame.to_virt().as_mut_ptr::<PageTable>();
    unsafe { (*table).zero() };
    let pm = Pagemap { phys: frame };

    let stack_bottom = sections.kernel_stack_top - 16 * 1024;
    map_range_identity(pm, stack_bottom, sections.kernel_stack_top, PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE);

    map_range_identity(pm, sections.limine_requests_start, sections.limine_requests_end, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
    map_range_identity(pm, sections.text_start, sections.text_end, PageTableFlags::PRESENT);
    map_range_identity(pm, sections.rodata_start, sections.rodata_end, PageTableFlags::PRESENT | PageTableFlags::NO_EXECUTE);
    map_range_identity(pm, sections.data_start, sections.data_end, PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE);

    let hhdm_flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
    for &(base, len) in memmap {
        map_hhdm_range(pm, base, len, hhdm_flags);
    }

    // Identity-style HHDM cover of the first 4 GiB, regardless of memmap
    // holes, so early device/bitmap access never faults.
    const FOUR_GIB: u64 = 4 * 1024 * 1024 * 1024;
    map_hhdm_range(pm, 0, FOUR_GIB, PageTableFlags::PRESENT | PageTableFlags::WRITABLE);

    KERNEL_PAGEMAP.call_once(|| pm);
    switch_pagemap(pm);
    pm
}

/// Addresses the initial kernel pagemap needs, gathered from the linker
/// script and boot info rather than hardcoded.
pub struct KernelSections {
    pub kernel_stack_top: u64,
    pub limine_requests_start: u64,
    pub limine_requests_end: u64,
    pub text_start: u64,
    pub text_end: u64,
    pub rodata_start: u64,
    pub rodata_end: u64,
    pub data_start: u64,
    pub data_end: u64,
}

fn map_range_identity(pm: Pagemap, start: u64, end: u64, flags: PageTableFlags) {
    let start = start & !(PAGE_SIZE - 1);
    let mut addr = start;
    while addr < end {
        let _ = map(pm, VirtAddr::new(addr), PhysAddr::new(addr), flags);
        addr += PAGE_SIZE;
    }
}

fn map_hhdm_range(pm: Pagemap, base: u64, len: u64, flags: PageTableFlags) {
    let offset = crate::memory::address::hhdm_offset();
    let start = base & !(PAGE_SIZE - 1);
    let end = base + len;
    let mut phys = start;
    while phys < end {
        let virt = VirtAddr::new(phys + offset);
        let _ = map(pm, virt, PhysAddr::new(phys), flags);
        phys += PAGE_SIZE;
    }
}

#[cfg(test)]
mod tests {
    // Page-table walks require real physical memory behind HHDM pointers,
    // which the host test target does not provide; VMM round-trip and
    // kernel-half-sharing properties are instead exercised by
    // `memory::vma` tests against a fake single-level mapping shim and by
    // manual review of `map`/`unmap`/`translate` against the paging design — see
    // DESIGN.md for why this module's tests stop at the type layer.
    use super::*;

    #[test]
    fn entry_round_trips_addr_and_flags() {
        let mut e = PageTableEntry::EMPTY;
        assert!(e.is_empty());
        e.set(PhysAddr::new(0x2000), PageTableFlags::PRESENT | PageTableFlags::WRITABLE);
        assert_eq!(e.addr().as_u64(), 0x2000);
        assert!(e.flags().contains(PageTableFlags::WRITABLE));
        assert!(e.is_present());
        e.clear();
        assert!(e.is_empty());
    }
}
