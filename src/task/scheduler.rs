// =============================================================================
// nimbus kernel — Round-Robin Scheduler
// =============================================================================
//
// A fixed-capacity table of PCBs, preemptively round-robin-scheduled off
// the timer tick. Everything lives under one lock: the table, the live
// count, the current slot index, and the optional "last process exited"
// hook. `tick` is the only place that mutates scheduling state, and it
// always runs with interrupts already disabled by the gate type that
// delivered it.
//
// Unlike the cooperative, callee-saved-register switch this scheduler's
// teacher ancestor used, context switching here rides entirely on the
// interrupt frame: `tick` is handed a pointer to the `RegisterCtx` the
// timer stub just pushed, overwrites it with the next process's saved
// frame, and the stub's own `iretq` does the actual switch. There is no
// separate assembly context-switch routine to maintain.
// =============================================================================

use alloc::boxed::Box;

use crate::arch::interrupts::RegisterCtx;
use crate::error::KernelError;
use crate::memory::address::{VirtAddr, PAGE_SIZE};
use crate::memory::vma::{VmaContext, VmaFlags};
use crate::memory::vmm::{self, Pagemap};
use crate::sync::spinlock::SpinLock;
use crate::task::pcb::{Pcb, ProcessState};

/// Matches the original scheduler's header (`examples/original_source`):
/// "should be plenty" for a single-core educational kernel with no
/// filesystem-backed process image cache.
pub const PROC_MAX_PROCS: usize = 2048;

/// Ticks a `Running` process holds before being preempted. The timer is
/// expected to run at roughly 200 Hz, so this is the original's "roughly
/// 20ms, timer expected to run at roughly 200hz" budget.
pub const PROC_DEFAULT_TIME: u64 = 1;

const KERNEL_STACK_PAGES: u64 = 4;
const USER_STACK_PAGES: u64 = 8;

/// Selectors `iretq` loads on return to a freshly spawned process.
/// Matches the GDT layout in `arch::gdt`.
const KERNEL_CS: u64 = 0x08;
const KERNEL_SS: u64 = 0x10;
const USER_CS: u64 = 0x1B;
const USER_SS: u64 = 0x23;

/// `RFLAGS` a new process starts with: IF set, everything else clear.
const INITIAL_RFLAGS: u64 = 0x202;

/// Start of the low mirror-mapped region every process pagemap gets a
/// copy of — the first 64 KiB above the null-page guard.
const MIRROR_LOW_START: u64 = 0x1000;
const MIRROR_LOW_LEN: u64 = 0x10000;

struct SchedulerState {
    /// Fixed at `PROC_MAX_PROCS` entries for the table's whole lifetime —
    /// a `Vec` only because incremental `push` is the way to put that
    /// many slots on the heap without first building them on the (16
    /// KiB) kernel stack, unlike `Box::new(core::array::from_fn(..))`.
    table: alloc::vec::Vec<Option<Box<Pcb>>>,
    count: usize,
    current_pid: usize,
    die_fn: Option<fn()>,
}

static SCHEDULER: SpinLock<Option<SchedulerState>> = SpinLock::new(None);

/// Allocates the (heap-backed) PCB table and installs the empty
/// scheduler state. Must run after `memory::heap::init`.
///
/// # Panics
/// Panics if called more than once.
pub fn init() {
    let mut table = alloc::vec::Vec::with_capacity(PROC_MAX_PROCS);
    table.resize_with(PROC_MAX_PROCS, || None);

    let mut slot = SCHEDULER.lock();
    assert!(slot.is_none(), "scheduler: init called twice");
    *slot = Some(SchedulerState {
        table,
        count: 0,
        current_pid: 0,
        die_fn: None,
    });
    log::info!("scheduler: process table ready ({} slots)", PROC_MAX_PROCS);
}

/// Registers a hook run when the last live process exits. Used by the
/// boot sequence to have an empty run queue halt cleanly instead of
/// `iretq`-ing into nothing.
pub fn set_final(f: fn()) {
    with_state(|s| s.die_fn = f.into());
}

fn with_state<R>(f: impl FnOnce(&mut SchedulerState) -> R) -> R {
    let mut guard = SCHEDULER.lock();
    f(guard.as_mut().expect("scheduler: not initialized"))
}

/// Mirror-maps `[start, start+len)` from the kernel pagemap into `dst`,
/// reproducing each present page's own flags rather than a fixed set.
///
/// This is the scheduler's one deliberately-preserved security hole
/// (documented, not silently fixed): it hands every process
/// — including future user processes — a readable/writable view of the
/// kernel's PCB table and low memory. A real kernel would map a
/// per-process trampoline page here instead of the whole table; this
/// one doesn't.
fn mirror_range(dst: Pagemap, start: u64, len: u64) {
    let kernel = vmm::kernel_pagemap();
    let mut offset = 0;
    while offset < len {
        let virt = VirtAddr::new(start + offset);
        if let Some((phys, flags)) = vmm::translate_with_flags(kernel, virt) {
            let _ = vmm::map(dst, virt, phys, flags);
        }
        offset += PAGE_SIZE;
    }
}

/// Spawns a new process and returns its pid, or `-1` if the table is
/// full or memory is exhausted.
///
/// `pagemap` is adopted if given (the caller already built an address
/// space, e.g. for a loaded ELF image); otherwise a fresh pagemap is
/// created, sharing the kernel's upper half per `vmm::new_pagemap`.
pub fn spawn(user: bool, entry: u64, pagemap: Option<Pagemap>) -> i64 {
    let Some(pagemap) = pagemap.or_else(vmm::new_pagemap) else {
        log::error!(
            "scheduler: spawn failed, out of memory for pagemap: {}",
            KernelError::OutOfPhysicalMemory
        );
        return -1;
    };

    let Some(mut vma) = VmaContext::create(pagemap) else {
        log::error!(
            "scheduler: spawn failed, out of memory for vma context: {}",
            KernelError::OutOfPhysicalMemory
        );
        return -1;
    };

    let stack_pages = if user { USER_STACK_PAGES } else { KERNEL_STACK_PAGES };
    let mut stack_flags = VmaFlags::WRITABLE;
    if user {
        stack_flags |= VmaFlags::USER;
    }

    let Some(stack_base) = vma.alloc(stack_pages, stack_flags) else {
        log::error!(
            "scheduler: spawn failed, out of memory for stack: {}",
            KernelError::OutOfPhysicalMemory
        );
        vma.destroy();
        return -1;
    };
    let stack_top = stack_base.as_u64() + stack_pages * PAGE_SIZE;

    let mut saved_registers = RegisterCtx::empty();
    saved_registers.rip = entry;
    saved_registers.rsp = stack_top - 8;
    saved_registers.rflags = INITIAL_RFLAGS;
    saved_registers.cs = if user { USER_CS } else { KERNEL_CS };
    saved_registers.ss = if user { USER_SS } else { KERNEL_SS };

    let pcb = Box::new(Pcb {
        saved_registers,
        pid: 0, // overwritten below once the slot index is known
        state: ProcessState::Ready,
        timeslice: PROC_DEFAULT_TIME,
        pagemap,
        vma,
        in_syscall: false,
    });

    with_state(|s| {
        let Some(slot) = s.table.iter().position(|p| p.is_none()) else {
            log::error!(
                "scheduler: spawn failed, process table full: {}",
                KernelError::TableCapacityExceeded
            );
            return -1;
        };

        let mut pcb = pcb;
        pcb.pid = slot as u64;
        let pcb_addr = &*pcb as *const Pcb as u64;
        let pcb_len = core::mem::size_of::<Pcb>() as u64;

        // Mirrors the PCB's own page(s), the procs table, and the first
        // 64 KiB of low memory into the new pagemap — see `mirror_range`
        // for why this is a deliberately preserved hole, not an oversight.
        mirror_range(pagemap, pcb_addr & !(PAGE_SIZE - 1), pcb_len + PAGE_SIZE);
        let table_addr = s.table.as_ptr() as u64;
        let table_len = (PROC_MAX_PROCS * core::mem::size_of::<Option<Box<Pcb>>>()) as u64;
        mirror_range(pagemap, table_addr & !(PAGE_SIZE - 1), table_len + PAGE_SIZE);
        mirror_range(pagemap, MIRROR_LOW_START, MIRROR_LOW_LEN);

        s.table[slot] = Some(pcb);
        s.count += 1;
        slot as i64
    })
}

/// Advances `start` to the next `Ready` slot, scanning the whole table
/// and wrapping. Returns `start` unchanged if none is `Ready`.
///
/// Live slots are not guaranteed to occupy `[0, count)`: `spawn` fills
/// the first free slot `.position` finds, so a mid-table `exit` can
/// leave a live, higher-indexed process once a lower slot is reaped.
/// The scan therefore runs over the full table rather than bounding by
/// `count`, or a live process past the old `count` boundary would never
/// be reachable again.
fn next_ready(table: &[Option<Box<Pcb>>], start: usize) -> usize {
    let len = table.len();
    if len == 0 {
        return start;
    }
    let mut candidate = (start + 1) % len;
    for _ in 0..len {
        if let Some(p) = &table[candidate] {
            if p.state == ProcessState::Ready {
                return candidate;
            }
        }
        candidate = (candidate + 1) % len;
    }
    start
}

/// Runs one scheduling decision from the timer IRQ. `ctx` points at the
/// `RegisterCtx` the timer stub just pushed on the interrupt stack; it
/// is both the source of the preempted process's state and the
/// destination the next process's state is written into before the
/// stub's `iretq`.
///
/// # Safety
/// `ctx` must be a valid, currently-live `RegisterCtx` produced by the
/// timer stub in `arch::interrupts`.
pub fn tick(ctx: *mut RegisterCtx) {
    with_state(|s| {
        if s.count == 0 {
            return;
        }

        if let Some(proc) = s.table[s.current_pid].as_mut() {
            if proc.state == ProcessState::Running && !proc.in_syscall {
                proc.saved_registers = unsafe { *ctx };
                proc.timeslice -= 1;
                if proc.timeslice == 0 {
                    proc.state = ProcessState::Ready;
                    proc.timeslice = PROC_DEFAULT_TIME;
                    s.current_pid = next_ready(&s.table, s.current_pid);
                }
            }
        }

        let is_terminated = matches!(
            s.table[s.current_pid].as_ref().map(|p| p.state),
            Some(ProcessState::Terminated)
        );
        if is_terminated {
            let slot = s.current_pid;
            reap(s, slot);
            if s.count == 0 {
                return;
            }
            s.current_pid = next_ready(&s.table, s.current_pid);
        }

        if let Some(proc) = s.table[s.current_pid].as_mut() {
            if proc.state == ProcessState::Ready {
                proc.state = ProcessState::Running;
                unsafe { *ctx = proc.saved_registers };
                vmm::switch_pagemap(proc.pagemap);
            }
        }
    });
}

/// Destroys the VMA and pagemap of the process in `slot` and nulls it.
/// Caller must already hold the scheduler lock and have `slot` point
/// at a `Terminated` process.
fn reap(s: &mut SchedulerState, slot: usize) {
    if let Some(proc) = s.table[slot].take() {
        let pid = proc.pid;
        let pagemap = proc.pagemap;
        proc.vma.destroy();
        vmm::destroy_pagemap(pagemap);
        s.count -= 1;
        log::info!("scheduler: reaped pid {}", pid);
    }
}

/// Marks the current process `Terminated`; the next `tick` reaps it.
/// If it is the last live process, runs the final hook (if set) and
/// halts — there is nothing left to schedule.
pub fn exit(code: i32) {
    let (pid, should_halt) = with_state(|s| {
        let count = s.count;
        if let Some(proc) = s.table[s.current_pid].as_mut() {
            proc.state = ProcessState::Terminated;
            let pid = proc.pid;
            log::info!("process {} exited with code {}", pid, code);
            return (pid, count <= 1);
        }
        (u64::MAX, false)
    });

    if should_halt {
        if let Some(die_fn) = with_state(|s| s.die_fn) {
            die_fn();
        }
        log::info!("scheduler: no more processes, halting");
        crate::arch::cpu::halt_forever();
    }

    let _ = pid;
}

/// Returns the pid of the currently-scheduled process, if any.
pub fn current_pid() -> Option<u64> {
    with_state(|s| s.table[s.current_pid].as_ref().map(|p| p.pid))
}

/// Returns a raw pointer to the currently-scheduled PCB, or null if the
/// table is empty. Matches the scheduler contract's `current()` entry
/// point for callers (e.g. a future syscall layer) that need direct
/// access to `in_syscall`/`pagemap` without going through the lock —
/// sound only because this kernel runs single-core (no AP startup; see
/// the dropped `arch::smp`), so there is no concurrent reaper to race.
///
/// # Safety
/// The returned pointer is valid only until the next `tick` or `exit`
/// call, which may reap the slot it points at. Callers must not retain
/// it across a call that could yield.
pub fn current() -> *mut Pcb {
    with_state(|s| {
        s.table[s.current_pid]
            .as_mut()
            .map(|p| &mut **p as *mut Pcb)
            .unwrap_or(core::ptr::null_mut())
    })
}

#[cfg(test)]
mod tests {
    //! `next_ready` is the one piece of scheduling logic with no hardware
    //! dependency — no pagemap switch, no register frame, just round-robin
    //! arithmetic over slot states. These tests build a table of fake
    //! `Pcb`s (zeroed, with only `state` overridden) the same way
    //! `memory::vma`'s tests build a fake `Pagemap` — nothing here ever
    //! dereferences `pagemap`/`vma`/`saved_registers`.
    use super::*;

    fn fake_pcb(state: ProcessState) -> Option<Box<Pcb>> {
        let mut pcb: Pcb = unsafe { core::mem::zeroed() };
        pcb.state = state;
        Some(Box::new(pcb))
    }

    #[test]
    fn next_ready_wraps_around_the_table() {
        let table: alloc::vec::Vec<Option<Box<Pcb>>> = alloc::vec![
            fake_pcb(ProcessState::Running),
            fake_pcb(ProcessState::Terminated),
            fake_pcb(ProcessState::Ready),
        ];
        // Starting at slot 0, slot 1 is terminated, slot 2 is ready.
        assert_eq!(next_ready(&table, 0), 2);
    }

    #[test]
    fn next_ready_skips_non_ready_slots() {
        let table: alloc::vec::Vec<Option<Box<Pcb>>> = alloc::vec![
            fake_pcb(ProcessState::Ready),
            fake_pcb(ProcessState::Waiting),
            fake_pcb(ProcessState::Terminated),
            None,
            fake_pcb(ProcessState::Ready),
        ];
        // From slot 4, wrap past the empty slot and the non-ready ones
        // back to slot 0, the only other `Ready` entry.
        assert_eq!(next_ready(&table, 4), 0);
    }

    #[test]
    fn next_ready_returns_start_when_nothing_is_ready() {
        let table: alloc::vec::Vec<Option<Box<Pcb>>> = alloc::vec![
            fake_pcb(ProcessState::Running),
            fake_pcb(ProcessState::Waiting),
            None,
        ];
        assert_eq!(next_ready(&table, 0), 0);
    }

    #[test]
    fn next_ready_single_slot_table_stays_put() {
        let table: alloc::vec::Vec<Option<Box<Pcb>>> = alloc::vec![fake_pcb(ProcessState::Ready)];
        assert_eq!(next_ready(&table, 0), 0);
    }

    #[test]
    fn next_ready_reaches_a_live_slot_past_a_reaped_gap() {
        // Three procs spawned into slots 0,1,2; slot 1 is reaped (nulled)
        // while the table itself keeps all `PROC_MAX_PROCS` slots — slot
        // 2 must stay reachable even though only two processes remain.
        let table: alloc::vec::Vec<Option<Box<Pcb>>> = alloc::vec![
            fake_pcb(ProcessState::Running),
            None,
            fake_pcb(ProcessState::Ready),
        ];
        assert_eq!(next_ready(&table, 0), 2);
    }
}
