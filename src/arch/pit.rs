//! Programmable Interval Timer (8253/8254): the preemption clock.
//!
//! Channel 0, mode 3 (square wave), divisor 5966 against the PIT's
//! 1.193182 MHz input clock — about 200 Hz, the tick rate
//! `task::scheduler`'s `PROC_DEFAULT_TIME` budget assumes.

use crate::arch::{pic, x86_64::cpu::outb};

const PIT_CHANNEL0_DATA: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

const PIT_MODE3_LOHI_CHANNEL0: u8 = 0x36;

/// ~200 Hz against the PIT's 1,193,182 Hz input clock.
const DIVISOR: u16 = 5966;

/// Programs channel 0 and unmasks IRQ0 on the PIC.
///
/// # Safety
/// Must run after `pic::init` and before `sti`, or the first tick could
/// arrive before the IDT's timer vector is wired up.
pub unsafe fn init() {
    unsafe {
        outb(PIT_COMMAND, PIT_MODE3_LOHI_CHANNEL0);
        outb(PIT_CHANNEL0_DATA, (DIVISOR & 0xFF) as u8);
        outb(PIT_CHANNEL0_DATA, (DIVISOR >> 8) as u8);
        pic::unmask(0);
    }
}
