// =============================================================================
// nimbus kernel — Physical Memory Manager (bitmap frame allocator)
// =============================================================================
//
// One bit per 4 KiB frame: 1 = used, 0 = free. The bitmap itself lives in
// physical RAM described by the very memory map it consumes, so init has
// to carve its own backing frames out of a usable region before it can
// start handing out frames to anyone else.
//
// Allocation is first-fit over contiguous clear bits, with a small LIFO
// cache of single-page frees so the extremely common "free one page, then
// immediately allocate one page" pattern (stack teardown, VMA churn) never
// has to rescan the bitmap.
// =============================================================================

use crate::memory::address::{hhdm_offset, PhysAddr, PAGE_SIZE};
use crate::sync::spinlock::SpinLock;

/// Depth of the single-page free list cache.
const PAGE_CACHE_SIZE: usize = 1024;

/// Physical memory statistics, returned by `stats()`.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_frames: u64,
    pub used_frames: u64,
    pub free_frames: u64,
    pub bitmap_bytes: u64,
}

/// The bitmap allocator's mutable state.
///
/// Kept as a plain struct (rather than directly a `static`) so host-side
/// tests can construct one over a synthetic memmap without going through
/// Limine or a real physical address space.
pub struct BitmapAllocator {
    bitmap: *mut u8,
    bitmap_bytes: u64,
    bitmap_phys: PhysAddr,
    bitmap_frame_count: u64,
    total_frames: u64,
    used_frames: u64,
    /// Word index to resume scanning from; avoids rescanning known-full
    /// regions on every allocation.
    search_start: usize,
    /// LIFO cache of recently freed single-page frame indices.
    cache: [u64; PAGE_CACHE_SIZE],
    cache_len: usize,
}

// SAFETY: the allocator is only ever touched through the `PMM` SpinLock;
// the raw `bitmap` pointer is a stable HHDM-mapped allocation for the
// life of the kernel.
unsafe impl Send for BitmapAllocator {}

impl BitmapAllocator {
    /// Builds the allocator from a Limine-style usable-range list.
    ///
    /// `usable_ranges` holds `(base, length)` pairs for every `Usable`
    /// memmap entry, sorted by base address (as Limine provides).
    pub fn new(usable_ranges: &[(u64, u64)]) -> Self {
        let highest_addr = usable_ranges
            .iter()
            .map(|&(base, len)| base + len)
            .max()
            .unwrap_or(0);

        let total_frames = highest_addr / PAGE_SIZE;
        let bitmap_bytes = align_up(total_frames.div_ceil(8), PAGE_SIZE);
        let bitmap_frame_count = bitmap_bytes / PAGE_SIZE;

        // Find the first usable range big enough to hold the bitmap, and
        // carve the bitmap's own space out of it before the second pass.
        let mut bitmap_phys = PhysAddr::zero();
        let mut ranges: [(u64, u64); 64] = [(0, 0); 64];
        let n = usable_ranges.len().min(64);
        ranges[..n].copy_from_slice(&usable_ranges[..n]);

        for entry in ranges.iter_mut().take(n) {
            let (base, len) = *entry;
            if len >= bitmap_bytes {
                bitmap_phys = PhysAddr::new(base);
                *entry = (base + bitmap_bytes, len - bitmap_bytes);
                break;
            }
        }

        let bitmap = bitmap_phys.to_virt().as_mut_ptr::<u8>();

        // SAFETY: `bitmap_bytes` worth of physical RAM at `bitmap_phys` was
        // just carved out of a usable range above and is HHDM-accessible.
        unsafe {
            core::ptr::write_bytes(bitmap, 0xFF, bitmap_bytes as usize);
        }

        let mut allocator = Self {
            bitmap,
            bitmap_bytes,
            bitmap_phys,
            bitmap_frame_count,
            total_frames,
            used_frames: total_frames,
            search_start: 0,
            cache: [0; PAGE_CACHE_SIZE],
            cache_len: 0,
        };

        for &(base, len) in ranges.iter().take(n) {
            allocator.clear_range(base, len);
        }

        // The bitmap's own backing frames must stay marked used even
        // though they fall inside a (now-reduced) usable range.
        let bitmap_start_frame = bitmap_phys.as_u64() / PAGE_SIZE;
        for f in bitmap_start_frame..bitmap_start_frame + bitmap_frame_count {
            allocator.mark_used(f);
        }

        // Frame 0 is never handed out: a null-safety guard against a
        // stray zero `PhysAddr` being mistaken for a real allocation.
        allocator.mark_used(0);

        allocator
    }

    fn clear_range(&mut self, base: u64, len: u64) {
        if len == 0 {
            return;
        }
        let start_frame = base.div_ceil(PAGE_SIZE);
        let end_frame = (base + len) / PAGE_SIZE;
        for f in start_frame..end_frame {
            if f < self.total_frames && !self.is_free(f) {
                self.clear_bit(f);
                self.used_frames -= 1;
            }
        }
    }

    #[inline]
    fn is_free(&self, frame: u64) -> bool {
        // SAFETY: bounds-checked by callers against `total_frames`.
        let byte = unsafe { *self.bitmap.add((frame / 8) as usize) };
        byte & (1 << (frame % 8)) == 0
    }

    #[inline]
    fn mark_used(&mut self, frame: u64) {
        if self.is_free(frame) {
            self.used_frames += 1;
        }
        self.set_bit(frame);
    }

    #[inline]
    fn set_bit(&mut self, frame: u64) {
        unsafe {
            let ptr = self.bitmap.add((frame / 8) as usize);
            *ptr |= 1 << (frame % 8);
        }
    }

    #[inline]
    fn clear_bit(&mut self, frame: u64) {
        unsafe {
            let ptr = self.bitmap.add((frame / 8) as usize);
            *ptr &= !(1 << (frame % 8));
        }
    }

    /// Requests `pages` contiguous frames. Returns the physical address
    /// of the first frame, HHDM-tagged if `higher_half` is set.
    pub fn request(&mut self, pages: u64, higher_half: bool) -> Option<PhysAddr> {
        if pages == 0 || pages > self.free_frames() {
            return None;
        }

        if pages == 1 {
            if let Some(frame) = self.pop_cache() {
                self.mark_used(frame);
                return Some(self.frame_addr(frame, higher_half));
            }
        }

        let words = (self.bitmap_bytes as usize) / 8;
        // SAFETY: the bitmap buffer is `bitmap_bytes` long and 8-byte
        // aligned (it is page-aligned, allocated via `BitmapAllocator::new`).
        let bitmap_words =
            unsafe { core::slice::from_raw_parts(self.bitmap as *const u64, words) };

        // `run_start` is tracked explicitly as the bit where the current
        // streak of clear bits began — never derived from the scan cursor
        // after the fact, since computing `start` from the cursor only
        // works when the run happens to end exactly at the cursor.
        let mut run_start: Option<u64> = None;
        let mut consecutive: u64 = 0;

        let mut word_idx = self.search_start;
        'scan: while word_idx < words {
            let word = bitmap_words[word_idx];
            if word == u64::MAX {
                run_start = None;
                consecutive = 0;
                word_idx += 1;
                continue;
            }

            for bit in 0..64u64 {
                let frame = (word_idx as u64) * 64 + bit;
                if frame >= self.total_frames {
                    break;
                }
                let used = word & (1 << bit) != 0;
                if used {
                    run_start = None;
                    consecutive = 0;
                } else {
                    if consecutive == 0 {
                        run_start = Some(frame);
                    }
                    consecutive += 1;
                    if consecutive == pages {
                        break 'scan;
                    }
                }
            }
            word_idx += 1;
        }

        if consecutive < pages {
            return None;
        }
        let start = run_start?;

        for f in start..start + pages {
            self.mark_used(f);
        }
        self.search_start = (start / 64) as usize;

        Some(self.frame_addr(start, higher_half))
    }

    /// Releases `pages` frames starting at `addr` (physical or HHDM-tagged).
    pub fn release(&mut self, addr: PhysAddr, pages: u64) {
        if pages == 0 {
            return;
        }
        let mut raw = addr.as_u64();
        let offset = hhdm_offset();
        if offset != 0 && raw >= offset {
            raw -= offset;
        }
        let start = raw / PAGE_SIZE;

        for f in start..start + pages {
            self.clear_bit_if_used(f);
        }

        if pages == 1 && self.cache_len < PAGE_CACHE_SIZE {
            self.cache[self.cache_len] = start;
            self.cache_len += 1;
        }

        let start_word = (start / 64) as usize;
        if start_word < self.search_start {
            self.search_start = start_word;
        }
    }

    fn is_free_checked(&self, frame: u64) -> bool {
        frame < self.total_frames && self.is_free(frame)
    }

    /// Clearing an already-clear bit is a no-op — double-free must never
    /// corrupt the free counter.
    fn clear_bit_if_used(&mut self, frame: u64) {
        if frame >= self.total_frames {
            return;
        }
        if !self.is_free(frame) {
            self.clear_bit(frame);
            self.used_frames -= 1;
        }
    }

    fn pop_cache(&mut self) -> Option<u64> {
        while self.cache_len > 0 {
            self.cache_len -= 1;
            let frame = self.cache[self.cache_len];
            if self.is_free_checked(frame) {
                return Some(frame);
            }
            // Stale entry (already reused by a contiguous request since
            // it was cached) — keep popping.
        }
        None
    }

    #[inline]
    fn frame_addr(&self, frame: u64, higher_half: bool) -> PhysAddr {
        let phys = frame * PAGE_SIZE;
        if higher_half {
            PhysAddr::new(phys + hhdm_offset())
        } else {
            PhysAddr::new(phys)
        }
    }

    pub fn free_frames(&self) -> u64 {
        self.total_frames - self.used_frames
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            free_frames: self.free_frames(),
            bitmap_bytes: self.bitmap_bytes,
        }
    }
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

// =============================================================================
// Global singleton
// =============================================================================

static PMM: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);

/// Initializes the global PMM from the boot memory map's usable ranges.
///
/// Must be called exactly once, before any other `memory::pmm` function,
/// and after `address::init_hhdm` has run.
pub fn init(usable_ranges: &[(u64, u64)]) {
    let allocator = BitmapAllocator::new(usable_ranges);
    *PMM.lock() = Some(allocator);
}

/// Requests `pages` contiguous physical frames.
pub fn request(pages: u64, higher_half: bool) -> Option<PhysAddr> {
    PMM.lock()
        .as_mut()
        .expect("PMM: not initialized — call pmm::init() first")
        .request(pages, higher_half)
}

/// Releases `pages` frames starting at `addr`.
pub fn release(addr: PhysAddr, pages: u64) {
    PMM.lock()
        .as_mut()
        .expect("PMM: not initialized — call pmm::init() first")
        .release(addr, pages);
}

/// Number of frames not currently allocated.
pub fn free_pages() -> u64 {
    PMM.lock()
        .as_ref()
        .expect("PMM: not initialized — call pmm::init() first")
        .free_frames()
}

/// Snapshot of allocator-wide counters.
pub fn stats() -> MemoryStats {
    PMM.lock()
        .as_ref()
        .expect("PMM: not initialized — call pmm::init() first")
        .stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a `BitmapAllocator` over a synthetic memmap. No real MMU or
    /// bootloader is needed since `BitmapAllocator` never touches anything
    /// outside the byte range it is told is usable.
    ///
    /// The range starts at `0x10_000`, not `0`: with `hhdm_offset` forced
    /// to 0 for the test, "physical" and host-process addresses are the
    /// same number, and a bitmap carved out of a range starting at 0
    /// would try to write through a null pointer.
    const FAKE_BASE: u64 = 0x10_000;

    fn fake_pmm(total_bytes: u64) -> BitmapAllocator {
        unsafe { crate::memory::address::init_hhdm(0) };
        BitmapAllocator::new(&[(FAKE_BASE, total_bytes)])
    }

    #[test]
    fn conservation_holds_across_request_release() {
        let mut pmm = fake_pmm(0x700_000);
        let total = pmm.free_frames();
        let a = pmm.request(4, false).unwrap();
        assert_eq!(pmm.free_frames(), total - 4);
        pmm.release(a, 4);
        assert_eq!(pmm.free_frames(), total);
    }

    #[test]
    fn no_overlap_between_two_requests() {
        let mut pmm = fake_pmm(0x700_000);
        let a = pmm.request(4, false).unwrap().as_u64();
        let b = pmm.request(4, false).unwrap().as_u64();
        let a_end = a + 4 * PAGE_SIZE;
        let b_end = b + 4 * PAGE_SIZE;
        assert!(b >= a_end || a >= b_end);
    }

    #[test]
    fn single_page_cache_hit_returns_same_frame() {
        let mut pmm = fake_pmm(0x700_000);
        let a = pmm.request(1, false).unwrap();
        pmm.release(a, 1);
        let b = pmm.request(1, false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhaustion_returns_none_without_panicking() {
        let mut pmm = fake_pmm(0x10_000);
        let free = pmm.free_frames();
        assert!(pmm.request(free + 1, false).is_none());
        assert!(pmm.request(0, false).is_none());
    }

    #[test]
    fn bitmap_frames_stay_marked_used() {
        let pmm = fake_pmm(0x700_000);
        let start_frame = pmm.bitmap_phys.as_u64() / PAGE_SIZE;
        assert!(!pmm.is_free(start_frame));
        assert!(!pmm.is_free(0));
    }
}
