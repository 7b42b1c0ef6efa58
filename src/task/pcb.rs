// =============================================================================
// nimbus kernel — Process Control Block
// =============================================================================
//
// The scheduler's unit of work. One `Pcb` per live process: its saved
// register frame, the pagemap and VMA that back its address space, and
// the bookkeeping the round-robin tick logic needs to decide whether to
// keep running it.
// =============================================================================

use crate::arch::interrupts::RegisterCtx;
use crate::memory::vma::VmaContext;
use crate::memory::vmm::Pagemap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    /// Never entered by the core scheduler itself — reserved for a
    /// future blocking-I/O path to move a process here without it
    /// being selected by round-robin.
    Waiting,
    Terminated,
}

/// One process's saved context plus the address space it owns.
///
/// `pid` always equals this PCB's slot index in the scheduler's table —
/// not a separately-incrementing counter — so a reaped slot's index is
/// immediately reusable by the next `spawn`.
pub struct Pcb {
    pub saved_registers: RegisterCtx,
    pub pid: u64,
    pub state: ProcessState,
    pub timeslice: u64,
    pub pagemap: Pagemap,
    pub vma: VmaContext,
    pub in_syscall: bool,
}
