// =============================================================================
// nimbus kernel — Kernel Panic Handler
// =============================================================================
//
// When Rust code panics (assert failure, unwrap on None, explicit panic!()),
// this handler is called. Since we're `#![no_std]`, we must provide our own.
//
// PHILOSOPHY:
//   In nimbus kernel, panics in the kernel are FATAL. They indicate a
//   kernel bug — violated invariants, corrupted state, impossible conditions.
//   Unlike userspace panics (which kill one process), a kernel panic means
//   something is fundamentally wrong with the system's trusted computing base.
//
// WHAT WE DO:
//   1. Print the panic message and location to serial (our most reliable output)
//   2. Halt all CPU cores permanently
//   3. Never return
//
// WHAT WE DON'T DO (yet):
//   - Stack unwinding (we compile with panic=abort)
//   - Core dumps
//   - Crash logging to disk
//   - Automatic reboot
//   These are future improvements. For now, halting and printing is correct.
//
// WHY halt_forever() AND NOT A REBOOT?
//   During development, we WANT the system to freeze on panic so we can:
//   - Read the error message on serial output
//   - Attach a debugger
//   - Examine the state of memory
//   Automatic reboots would make debugging much harder.
//
// =============================================================================

use crate::arch::cpu;
use crate::arch::interrupts::RegisterCtx;
use crate::kprintln;
use core::panic::PanicInfo;

/// The kernel panic handler.
///
/// This function is called by the Rust runtime whenever a panic occurs.
/// It is marked `#[panic_handler]` which tells the compiler to use it
/// as the global panic handler for this `#![no_std]` binary.
///
/// # Arguments
/// - `info`: Contains the panic message and source location (file:line).
///
/// # Never Returns
/// This function halts the CPU permanently. The `-> !` return type
/// tells the compiler this function diverges.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    // =======================================================================
    // CRITICAL: We're in a panic — the kernel state may be corrupted.
    // We use the serial port directly (not through the spinlock) to avoid
    // potential deadlock if the panic occurred while the serial lock was held.
    //
    // Yes, this means output might be garbled if another core is also
    // printing. That's acceptable — getting SOME output is better than
    // deadlocking silently.
    // =======================================================================

    // Print the panic header.
    // We use kprintln! which goes through the spinlock. If this deadlocks,
    // at least the serial FIFO should have flushed some partial output.
    // A future improvement could write directly to the serial port without
    // the lock.
    kprintln!();
    kprintln!("==========================================================");
    kprintln!("  KERNEL PANIC — nimbus kernel");
    kprintln!("==========================================================");

    // Print the panic location (file and line number) if available.
    if let Some(location) = info.location() {
        kprintln!("  Location: {}:{}", location.file(), location.line());
    } else {
        kprintln!("  Location: <unknown>");
    }

    // Print the panic message.
    // PanicInfo::message() returns the format arguments passed to panic!().
    kprintln!("  Message: {}", info.message());

    kprintln!("==========================================================");
    kprintln!("  System halted. Reboot required.");
    kprintln!("==========================================================");

    // Halt forever — disable interrupts and loop on HLT.
    // No interrupt can wake us, no code can run after this.
    cpu::halt_forever()
}

/// Entry point for every CPU exception the interrupt stubs route here
/// (anything other than the timer vector — see `arch::interrupts::dispatch`).
///
/// There's no page-fault-driven demand paging and no signal delivery in
/// this kernel, so a fault reaching here — divide error, GP fault, an
/// unmapped page access — is unrecoverable by construction. We dump the
/// full trapped register state and halt, the same as a Rust-level panic
/// but with the machine context a `PanicInfo` can't carry.
///
/// # Safety
/// `ctx` must point at a valid `RegisterCtx` pushed by one of the
/// `arch::interrupts` stubs. Only those stubs call this function.
pub fn fault(ctx: *mut RegisterCtx) -> ! {
    let ctx = unsafe { &*ctx };

    kprintln!();
    kprintln!("==========================================================");
    kprintln!("  KERNEL FAULT — nimbus kernel");
    kprintln!("==========================================================");
    kprintln!("  vector: {}   error: {:#X}", ctx.vector, ctx.err);
    kprintln!(
        "  rip: {:#018X}   cs: {:#06X}   rflags: {:#018X}",
        ctx.rip, ctx.cs, ctx.rflags
    );
    kprintln!("  rsp: {:#018X}   ss: {:#06X}", ctx.rsp, ctx.ss);
    kprintln!(
        "  rax: {:#018X}  rbx: {:#018X}  rcx: {:#018X}  rdx: {:#018X}",
        ctx.rax, ctx.rbx, ctx.rcx, ctx.rdx
    );
    kprintln!(
        "  rsi: {:#018X}  rdi: {:#018X}  rbp: {:#018X}",
        ctx.rsi, ctx.rdi, ctx.rbp
    );
    kprintln!(
        "  r8:  {:#018X}  r9:  {:#018X}  r10: {:#018X}  r11: {:#018X}",
        ctx.r8, ctx.r9, ctx.r10, ctx.r11
    );
    kprintln!(
        "  r12: {:#018X}  r13: {:#018X}  r14: {:#018X}  r15: {:#018X}",
        ctx.r12, ctx.r13, ctx.r14, ctx.r15
    );
    kprintln!(
        "  cr0: {:#018X}  cr2: {:#018X}  cr3: {:#018X}  cr4: {:#018X}",
        ctx.cr0, ctx.cr2, ctx.cr3, ctx.cr4
    );
    kprintln!("  ds: {:#06X}   es: {:#06X}", ctx.ds, ctx.es);
    kprintln!("==========================================================");
    kprintln!("  System halted. Reboot required.");
    kprintln!("==========================================================");

    cpu::halt_forever()
}
