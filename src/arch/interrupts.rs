//! Exception and IRQ dispatch: the saved-register ABI, the per-vector
//! assembly stubs, and the IDT wiring that ties them together.
//!
//! Every stub below pushes the same `RegisterCtx` layout and hands the
//! Rust dispatcher a single pointer into the interrupt stack — no vector
//! ever takes a different path through Rust code. The one exception that
//! matters to the rest of the kernel is vector 32 (the PIT tick), whose
//! dispatcher calls into `task::scheduler::tick` instead of the fault
//! formatter.

use core::arch::global_asm;

use crate::arch::gdt;
use crate::arch::idt::{GateType, Idt, PrivilegeLevel};
use crate::sync::spinlock::SpinLock;

/// IRQ0 (PIT) arrives at this vector once `arch::pic::init` has moved
/// the legacy 8259 vectors out of the way of the CPU's own exception
/// vectors 0-31.
pub const TIMER_VECTOR: u8 = 32;

/// Double-fault handler runs on its own IST stack so a kernel stack
/// overflow elsewhere doesn't also fault delivering the double fault.
const DOUBLE_FAULT_IST: u8 = 1;

// =============================================================================
// RegisterCtx — the interrupt stub ABI
// =============================================================================

/// The exact snapshot of machine state an interrupt stub leaves on the
/// stack and hands to Rust as `*mut RegisterCtx`.
///
/// Field order is address-ascending, matching the order the stub
/// epilogue pops them in reverse: the control-register/segment
/// snapshot is pushed last (by the stub, after the general-purpose
/// registers are already safely saved and free to use as scratch), so
/// it sits at the lowest address — where the stub's `call` passes
/// `rsp`. `ss` is what the CPU itself pushed first on entry, so it
/// sits at the highest address, popped last by `iretq`. Every stub —
/// exception or IRQ, with or without a hardware error code — produces
/// this same shape; vectors with no hardware error code have the stub
/// push a synthetic zero so the frame size never varies.
///
/// This layout is part of the kernel's internal ABI: the scheduler's
/// `tick` reads and rewrites it in place, and a mismatch between this
/// struct and the push/pop sequence in the stubs below is silent
/// stack corruption, not a compile error.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RegisterCtx {
    pub cr4: u64,
    pub cr3: u64,
    pub cr2: u64,
    pub cr0: u64,
    pub es: u64,
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub err: u64,
    // CPU-pushed on entry, consumed by `iretq` on exit.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl RegisterCtx {
    /// A zeroed frame, used only to seed a new process's initial
    /// `saved_registers` before it has ever actually trapped.
    pub const fn empty() -> Self {
        // SAFETY-equivalent: all-zero bits are a valid `u64` for every
        // field here, so a `mem::zeroed`-style value is well-defined.
        Self {
            cr4: 0, cr3: 0, cr2: 0, cr0: 0, es: 0, ds: 0,
            r15: 0, r14: 0, r13: 0, r12: 0, r11: 0, r10: 0, r9: 0, r8: 0,
            rbp: 0, rdi: 0, rsi: 0, rdx: 0, rcx: 0, rbx: 0, rax: 0,
            vector: 0, err: 0,
            rip: 0, cs: 0, rflags: 0, rsp: 0, ss: 0,
        }
    }
}

// =============================================================================
// Stub generation
// =============================================================================
//
// `push_frame`/`pop_frame` are textual asm snippets shared by every
// stub, so the push order only needs to be correct in one place.
// =============================================================================

macro_rules! push_frame {
    () => {
        concat!(
            // General-purpose registers first, while every one of them
            // still holds its original value — this is what buys us a
            // scratch register (rax) to read the control/segment
            // registers into below.
            "push rax\n", "push rbx\n", "push rcx\n", "push rdx\n",
            "push rsi\n", "push rdi\n", "push rbp\n",
            "push r8\n", "push r9\n", "push r10\n", "push r11\n",
            "push r12\n", "push r13\n", "push r14\n", "push r15\n",
            "mov rax, ds\n", "push rax\n",
            "mov rax, es\n", "push rax\n",
            "mov rax, cr0\n", "push rax\n",
            "mov rax, cr2\n", "push rax\n",
            "mov rax, cr3\n", "push rax\n",
            "mov rax, cr4\n", "push rax\n",
        )
    };
}

macro_rules! pop_frame {
    () => {
        concat!(
            "add rsp, 48\n", // cr4, cr3, cr2, cr0, es, ds: read-only snapshots
            "pop r15\n", "pop r14\n", "pop r13\n", "pop r12\n",
            "pop r11\n", "pop r10\n", "pop r9\n", "pop r8\n",
            "pop rbp\n", "pop rdi\n", "pop rsi\n", "pop rdx\n",
            "pop rcx\n", "pop rbx\n", "pop rax\n",
            "add rsp, 16\n", // vector, err
        )
    };
}

/// Defines a naked stub for a vector that has no hardware error code.
/// Pushes a synthetic `0` so every frame has the same shape.
macro_rules! stub_no_error {
    ($name:ident, $vector:literal) => {
        global_asm!(
            concat!(".global ", stringify!($name)),
            concat!(stringify!($name), ":"),
            "push 0",           // synthetic error code
            concat!("push ", stringify!($vector)),
            push_frame!(),
            "mov rdi, rsp",
            "call dispatch",
            pop_frame!(),
            "iretq",
        );
    };
}

/// Defines a naked stub for a vector where the CPU itself pushes an
/// error code (8, 10-14, 17) before entry.
macro_rules! stub_with_error {
    ($name:ident, $vector:literal) => {
        global_asm!(
            concat!(".global ", stringify!($name)),
            concat!(stringify!($name), ":"),
            // error code already pushed by the CPU
            concat!("push ", stringify!($vector)),
            push_frame!(),
            "mov rdi, rsp",
            "call dispatch",
            pop_frame!(),
            "iretq",
        );
    };
}

stub_no_error!(stub_divide_error, 0);
stub_no_error!(stub_debug, 1);
stub_no_error!(stub_nmi, 2);
stub_no_error!(stub_breakpoint, 3);
stub_no_error!(stub_overflow, 4);
stub_no_error!(stub_bound_range, 5);
stub_no_error!(stub_invalid_opcode, 6);
stub_no_error!(stub_device_not_available, 7);
stub_with_error!(stub_double_fault, 8);
stub_with_error!(stub_invalid_tss, 10);
stub_with_error!(stub_segment_not_present, 11);
stub_with_error!(stub_stack_segment_fault, 12);
stub_with_error!(stub_general_protection, 13);
stub_with_error!(stub_page_fault, 14);
stub_no_error!(stub_x87_fp, 16);
stub_with_error!(stub_alignment_check, 17);
stub_no_error!(stub_machine_check, 18);
stub_no_error!(stub_simd_fp, 19);
stub_no_error!(stub_timer, 32);

unsafe extern "C" {
    fn stub_divide_error();
    fn stub_debug();
    fn stub_nmi();
    fn stub_breakpoint();
    fn stub_overflow();
    fn stub_bound_range();
    fn stub_invalid_opcode();
    fn stub_device_not_available();
    fn stub_double_fault();
    fn stub_invalid_tss();
    fn stub_segment_not_present();
    fn stub_stack_segment_fault();
    fn stub_general_protection();
    fn stub_page_fault();
    fn stub_x87_fp();
    fn stub_alignment_check();
    fn stub_machine_check();
    fn stub_simd_fp();
    fn stub_timer();
}

// =============================================================================
// Dispatch
// =============================================================================

static IDT: SpinLock<Idt> = SpinLock::new(Idt::new());

/// Builds and loads the IDT. Must run after the GDT is loaded (the
/// gates reference the kernel code selector) and before `sti`.
///
/// # Safety
/// Must only be called once, from single-threaded boot code.
pub unsafe fn init(selectors: &gdt::Selectors) {
    let mut idt = IDT.lock();

    let exceptions: &[(u8, unsafe extern "C" fn(), u8)] = &[
        (0, stub_divide_error as unsafe extern "C" fn(), 0),
        (1, stub_debug as unsafe extern "C" fn(), 0),
        (2, stub_nmi as unsafe extern "C" fn(), 0),
        (3, stub_breakpoint as unsafe extern "C" fn(), 0),
        (4, stub_overflow as unsafe extern "C" fn(), 0),
        (5, stub_bound_range as unsafe extern "C" fn(), 0),
        (6, stub_invalid_opcode as unsafe extern "C" fn(), 0),
        (7, stub_device_not_available as unsafe extern "C" fn(), 0),
        (8, stub_double_fault as unsafe extern "C" fn(), DOUBLE_FAULT_IST),
        (10, stub_invalid_tss as unsafe extern "C" fn(), 0),
        (11, stub_segment_not_present as unsafe extern "C" fn(), 0),
        (12, stub_stack_segment_fault as unsafe extern "C" fn(), 0),
        (13, stub_general_protection as unsafe extern "C" fn(), 0),
        (14, stub_page_fault as unsafe extern "C" fn(), 0),
        (16, stub_x87_fp as unsafe extern "C" fn(), 0),
        (17, stub_alignment_check as unsafe extern "C" fn(), 0),
        (18, stub_machine_check as unsafe extern "C" fn(), 0),
        (19, stub_simd_fp as unsafe extern "C" fn(), 0),
    ];

    for &(vector, handler, ist) in exceptions {
        idt.set_handler(
            vector,
            handler as u64,
            selectors.kernel_code,
            GateType::Trap,
            PrivilegeLevel::Ring0,
            ist,
        );
    }

    idt.set_handler(
        TIMER_VECTOR,
        stub_timer as u64,
        selectors.kernel_code,
        GateType::Interrupt,
        PrivilegeLevel::Ring0,
        0,
    );

    // SAFETY: `idt` lives in a `'static` spinlock that is never moved or
    // dropped, so reborrowing through a raw pointer with a `'static`
    // lifetime is sound. Every installed handler above is a valid naked
    // stub producing the `RegisterCtx` layout `dispatch` expects.
    let idt_ptr: *const Idt = &*idt;
    unsafe {
        (*idt_ptr).load();
    }
}

/// Called by every stub with a pointer to the frame it just pushed.
///
/// The timer vector hands off to the scheduler; everything else is an
/// unrecoverable fault in this kernel (no page-in-on-demand, no signal
/// delivery) and goes to the panic path with the full register dump.
#[unsafe(no_mangle)]
extern "C" fn dispatch(ctx: *mut RegisterCtx) {
    let vector = unsafe { (*ctx).vector };
    if vector == TIMER_VECTOR as u64 {
        crate::task::scheduler::tick(ctx);
        // SAFETY: only ever reached from the IRQ0 stub, after `pic::init`
        // has run as part of boot.
        unsafe {
            crate::arch::pic::eoi(0);
        }
        return;
    }

    crate::util::panic::fault(ctx);
}
