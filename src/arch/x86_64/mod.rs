// =============================================================================
// nimbus kernel — x86_64 Architecture HAL (Hardware Abstraction Layer)
// =============================================================================
//
// This module contains ALL hardware-specific code for x86_64. If we ever
// port to another architecture (aarch64, riscv64), we add a sibling module
// and the rest of the kernel doesn't change.
//
// DESIGN RULE: All `unsafe` in the kernel should be concentrated here.
// Higher-level kernel code (capability system, IPC, scheduler logic) should
// be safe Rust calling into safe abstractions defined here.
//
// This module provides:
//   serial.rs    — COM1 UART for debug I/O (the first thing that works)
//   cpu.rs       — CPU feature detection, control registers, HLT
//   boot.rs      — Limine boot protocol request/response handling
//
// The privilege-level and interrupt plumbing (gdt.rs, tss.rs, idt.rs,
// interrupts.rs) lives one level up in `arch::`, since none of it is
// specific to this HAL split — it would look identical on day one of
// an aarch64 port's exception-vector table.
// =============================================================================

pub mod serial;
pub mod cpu;
pub mod boot;

