//! Console output for the filesystem core.
//!
//! The host environment registers a sink once; everything the crate prints
//! goes through it. Verbose output is gated by a debug mask, settable
//! through the `dbgmask` mount option.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use conquer_once::spin::OnceCell;

/// Receives every formatted console line emitted by the crate.
pub type ConsoleSink = fn(fmt::Arguments);

static CONSOLE: OnceCell<ConsoleSink> = OnceCell::uninit();

/// Debug mask currently in effect (see the `DBGMASK_*` bits).
pub static DBGMASK: AtomicU32 = AtomicU32::new(0);

/// Verbose tracing of log appends, block-map walks and similar.
pub const DBGMASK_VERBOSE: u32 = 0x0000_0010;

/// Tracing of lite-journal transactions.
pub const DBGMASK_TRANSACTION: u32 = 0x0000_0020;

/// Registers the console sink. Later registrations are ignored.
pub fn register_console(sink: ConsoleSink) {
    CONSOLE.init_once(|| sink);
}

/// Replaces the debug mask.
pub fn set_dbgmask(mask: u32) {
    DBGMASK.store(mask, Ordering::Relaxed);
}

pub fn verbose_enabled() -> bool {
    DBGMASK.load(Ordering::Relaxed) & DBGMASK_VERBOSE != 0
}

pub fn arg_print(args: fmt::Arguments) {
    if let Ok(sink) = CONSOLE.try_get() {
        sink(args);
    }
}

pub fn print(msg: &str) {
    arg_print(format_args!("{msg}"));
}

/// Prints a standard information message to the output.
///
/// The first argument is a 'context' literal, inserted at the beginning of
/// the message.
///
/// # Examples
///
/// ```
/// use pmfs::info;
///
/// info!("pmfs", "mounted persistent-memory region");
/// ```
#[macro_export]
macro_rules! info {
    ($ctx: literal, $($arg: tt)*) => {{
        $crate::cons::print("[info] ");
        $crate::cons::print($ctx);
        $crate::cons::print(" : ");
        $crate::cons::arg_print(format_args!($($arg)*));
        $crate::cons::print("\n");
    }};
}

/// Prints a warning message to the output.
#[macro_export]
macro_rules! warn {
    ($ctx: literal, $($arg: tt)*) => {{
        $crate::cons::print("[warn] ");
        $crate::cons::print($ctx);
        $crate::cons::print(" : ");
        $crate::cons::arg_print(format_args!($($arg)*));
        $crate::cons::print("\n");
    }};
}

/// Prints a standard error message to the output.
///
/// # Examples
///
/// ```
/// use pmfs::error;
///
/// error!("pmfs", "invalid superblock checksum");
/// ```
#[macro_export]
macro_rules! error {
    ($ctx: literal, $($arg: tt)*) => {{
        $crate::cons::print("[error] ");
        $crate::cons::print($ctx);
        $crate::cons::print(" : ");
        $crate::cons::arg_print(format_args!($($arg)*));
        $crate::cons::print("\n");
    }};
}

/// Prints a message only when verbose debugging is enabled in [`DBGMASK`].
#[macro_export]
macro_rules! dbg_verbose {
    ($ctx: literal, $($arg: tt)*) => {{
        if $crate::cons::verbose_enabled() {
            $crate::cons::print("[debug] ");
            $crate::cons::print($ctx);
            $crate::cons::print(" : ");
            $crate::cons::arg_print(format_args!($($arg)*));
            $crate::cons::print("\n");
        }
    }};
}
