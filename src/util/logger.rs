// =============================================================================
// nimbus kernel — Kernel Logger (kprint! / kprintln!)
// =============================================================================
//
// Provides formatted text output for the kernel, similar to Linux's printk().
// Output goes to the serial port (COM1) from the earliest boot instruction.
// Terminal/framebuffer rendering is a named external collaborator (not this
// kernel's job) and is never wired in here.
//
// WHY NOT USE THE `log` CRATE DIRECTLY FOR EARLY BOOT?
//   `log`'s macros route through a global logger set once via
//   `log::set_logger`, which this module installs in `init()` — but only
//   once interrupts and the heap exist. Before that point (parsing boot
//   info, building the PMM bitmap), `kprintln!` is the only way to get a
//   message out, so it stays a direct macro rather than a `log::Log` call.
//
// DESIGN:
//   - kprint!() / kprintln!() always output to serial, with no dependency
//     on `log` being installed yet — usable from the first instruction.
//   - `KernelLogger` is a thin `log::Log` impl over the same serial path,
//     installed once logging's prerequisites (interrupts masked correctly)
//     are in place, so the rest of the kernel can use `log::info!` etc.
//   - The macros use Rust's format_args!() for zero-allocation formatting.
//
// USAGE:
//   kprintln!("Hello, {}!", "world");
//   kprintln!("Memory: {} MB free", free_pages * 4096 / 1024 / 1024);
//   kprint!("Loading..."); // No newline
//   kprintln!(" done!");
//
// THREAD SAFETY:
//   The serial port is protected by a SpinLock. Concurrent callers
//   (including an interrupt handler preempting a kprintln! in progress on
//   the same core) serialize on it — the lock disables interrupts on
//   acquire, so there is no same-core re-entrancy deadlock.
//
// =============================================================================

use crate::arch::serial::SERIAL;
use core::fmt;
use core::fmt::Write;

/// The internal print function that sends formatted text to serial output.
///
/// This is not meant to be called directly — use the `kprint!()` and
/// `kprintln!()` macros instead.
///
/// # Arguments
/// - `args`: Format arguments created by `format_args!()` macro.
///
/// # How it works
/// 1. Acquires the serial port spinlock (disabling interrupts)
/// 2. Writes the formatted text to serial
/// 3. Releases the lock (restoring interrupts)
///
/// The lock ensures that a complete message is written atomically — no
/// interleaving from other cores or interrupt handlers.
#[doc(hidden)]
pub fn _kprint(args: fmt::Arguments) {
    // Acquire the serial port lock. This disables interrupts on the
    // current core to prevent deadlock if an interrupt handler also
    // tries to print.
    let mut serial = SERIAL.lock();
    let _ = serial.write_fmt(args);
}

/// Prints formatted text to the kernel console (serial + framebuffer).
///
/// Works exactly like `print!()` in standard Rust, but outputs to serial
/// and framebuffer instead of stdout.
///
/// # Examples
/// ```
/// kprint!("Loading");
/// kprint!(".");
/// kprint!(".");
/// kprintln!(" done!"); // "Loading... done!\n"
/// ```
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::util::logger::_kprint(format_args!($($arg)*))
    };
}

/// Prints formatted text followed by a newline to the kernel console.
///
/// Works exactly like `println!()` in standard Rust.
///
/// # Examples
/// ```
/// kprintln!();                          // Just a newline
/// kprintln!("Hello!");                  // Simple string
/// kprintln!("x = {}", 42);             // Formatted
/// kprintln!("addr = {:#018X}", 0xDEAD); // Hex formatted
/// ```
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::kprint!("{}\n", format_args!($($arg)*))
    };
}

// =============================================================================
// `log` facade
// =============================================================================

/// Routes `log::info!`/`log::warn!`/etc. through the same serial path as
/// `kprintln!`. The two coexist rather than one replacing the other: the
/// bespoke macros remain available for code that runs before `init()`
/// installs this logger (early boot, before the heap and GDT/IDT exist).
struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        _kprint(format_args!(
            "[{:>5} {}] {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs `KernelLogger` as the global `log` facade. Idempotent-unsafe:
/// like `log::set_logger` itself, calling this twice returns an error that
/// we deliberately ignore, since a double `init()` only means boot called
/// it from two stages and the first installation already won.
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Trace);
}
