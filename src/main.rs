#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![feature(alloc_error_handler)]

extern crate alloc;

mod arch;
mod bootinfo;
mod error;
mod memory;
mod sync;
mod task;
mod util;

#[cfg(not(test))]
use limine::BaseRevision;

#[cfg(not(test))]
use bootinfo::BootInfo;
#[cfg(not(test))]
use memory::address;
#[cfg(not(test))]
use memory::vmm::KernelSections;
#[cfg(not(test))]
use error::KernelError;

/// Base revision supported by this kernel.
#[cfg(not(test))]
#[used]
#[link_section = ".limine_requests"]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[cfg(not(test))]
unsafe extern "C" {
    static text_start: u8;
    static text_end: u8;
    static rodata_start: u8;
    static rodata_end: u8;
    static limine_requests_start: u8;
    static limine_requests_end: u8;
    static data_start: u8;
    static data_end: u8;
}

/// Kernel entry point called by the Limine bootloader.
///
/// Drives the init order documented on each stage below; nothing here
/// is reentrant, and every stage assumes the previous one's invariant
/// already holds.
///
/// Excluded under `cfg(test)`: the extern statics above and the linker
/// script that backs them only exist for the real kernel link, not the
/// host test harness.
#[cfg(not(test))]
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    // Stage 1: validate the handshake, snapshot everything Limine gave us.
    assert!(
        BASE_REVISION.is_supported(),
        "limine: {}",
        KernelError::UnsupportedBootEnvironment
    );
    let boot_info = unsafe { BootInfo::capture() };
    unsafe { address::init_hhdm(boot_info.hhdm_offset) };

    // Stage 2: logging before anything else can report failure usefully.
    util::logger::init();
    log::info!("nimbus kernel booting");

    // Stage 3: physical frame allocator over the usable ranges only.
    let usable_ranges: alloc::vec::Vec<(u64, u64)> = boot_info
        .memmap
        .iter()
        .filter(|e| e.entry_type == limine::memory_map::EntryType::USABLE)
        .map(|e| (e.base, e.length))
        .collect();
    memory::pmm::init(&usable_ranges);
    log::info!("pmm: {} free frames after init", memory::pmm::free_pages());

    // Stage 4: kernel pagemap, built from linker-provided section bounds.
    let sections = KernelSections {
        kernel_stack_top: boot_info.kernel_stack_top,
        limine_requests_start: unsafe { &limine_requests_start as *const u8 as u64 },
        limine_requests_end: unsafe { &limine_requests_end as *const u8 as u64 },
        text_start: unsafe { &text_start as *const u8 as u64 },
        text_end: unsafe { &text_end as *const u8 as u64 },
        rodata_start: unsafe { &rodata_start as *const u8 as u64 },
        rodata_end: unsafe { &rodata_end as *const u8 as u64 },
        data_start: unsafe { &data_start as *const u8 as u64 },
        data_end: unsafe { &data_end as *const u8 as u64 },
    };
    let memmap_ranges: alloc::vec::Vec<(u64, u64)> = boot_info.memmap_ranges().collect();
    let kernel_pagemap = unsafe { memory::vmm::init_kernel_pagemap(&sections, &memmap_ranges) };
    log::info!("vmm: kernel pagemap installed and active");

    // Stage 5: kernel address-space bookkeeping, then the heap on top of it.
    memory::vma::init_kernel(kernel_pagemap);
    memory::vma::with_kernel(|vma| memory::heap::init(vma));
    log::info!(
        "heap: {} KiB available",
        memory::heap::total_bytes() / 1024
    );

    // Stage 6: descriptor tables. GDT/TSS first (the IDT's gates reference
    // the kernel code selector the GDT defines).
    static mut TSS: arch::tss::Tss = arch::tss::Tss::new();
    static mut GDT: Option<arch::gdt::Gdt> = None;
    static mut SELECTORS: Option<arch::gdt::Selectors> = None;

    unsafe {
        #[allow(static_mut_refs)]
        TSS.init();
        #[allow(static_mut_refs)]
        let (gdt, selectors) = arch::gdt::Gdt::new(&TSS);
        GDT = Some(gdt);
        SELECTORS = Some(selectors);
        #[allow(static_mut_refs)]
        let gdt_ref = GDT.as_ref().unwrap();
        #[allow(static_mut_refs)]
        let selectors_ref = SELECTORS.as_ref().unwrap();
        gdt_ref.load(selectors_ref);
        arch::interrupts::init(selectors_ref);
    }
    log::info!("gdt/idt: descriptor tables loaded");

    // Stage 7: scheduler table, then the kernel's own first process.
    task::scheduler::init();
    task::scheduler::set_final(halt_system);
    let pid = task::scheduler::spawn(false, idle_task as u64, None);
    assert!(pid >= 0, "scheduler: failed to spawn the initial kernel process");
    log::info!("scheduler: initial process spawned as pid {}", pid);

    // Stage 8: PIT/PIC, contract-only stubs this kernel owns outright.
    unsafe {
        arch::pic::init();
        arch::pit::init();
    }
    log::info!("pit: programmed for ~200Hz, irq0 unmasked");

    // Stage 9: go live.
    unsafe {
        core::arch::asm!("sti");
    }
    loop {
        arch::cpu::halt();
    }
}

/// The kernel's only always-runnable process: nothing to do but idle
/// between ticks, so the scheduler always has at least one `Ready` slot.
#[cfg(not(test))]
extern "C" fn idle_task() -> ! {
    loop {
        arch::cpu::halt();
    }
}

/// Installed as the scheduler's "no processes left" hook. Unreachable in
/// practice (`idle_task` never exits), kept as the documented contract
/// `task::scheduler::set_final` expects.
#[cfg(not(test))]
fn halt_system() {
    crate::kprintln!("scheduler: process table empty, halting");
}
