//! Console output of the kernel.
//!
//! Output goes to the host console. Debug messages are grouped into
//! categories ([`DebugFlags`]) and only printed when their category is
//! turned on with [`set_debug_flags`].

use core::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// Categories of debug messages.
    ///
    /// Each category has a single-character name, which is what the `-d`
    /// option of the kernel takes.
    pub struct DebugFlags: u32 {
        /// General messages (`+`).
        const GENERAL = 1 << 0;
        /// Thread creation and switching (`t`).
        const THREAD = 1 << 1;
        /// Ready queue manipulation (`r`).
        const READY = 1 << 2;
        /// Interrupt delivery (`i`).
        const INTERRUPT = 1 << 3;
        /// Frame allocation and demand paging (`M`).
        const MEMORY = 1 << 4;
        /// Address translation (`a`).
        const ADDRESS = 1 << 5;
        /// System calls (`S`).
        const SYSCALL = 1 << 6;
        /// Join (`J`).
        const JOIN = 1 << 7;
        /// Fork (`F`).
        const FORK = 1 << 8;
    }
}

impl DebugFlags {
    const CHARS: [(char, DebugFlags); 9] = [
        ('+', DebugFlags::GENERAL),
        ('t', DebugFlags::THREAD),
        ('r', DebugFlags::READY),
        ('i', DebugFlags::INTERRUPT),
        ('M', DebugFlags::MEMORY),
        ('a', DebugFlags::ADDRESS),
        ('S', DebugFlags::SYSCALL),
        ('J', DebugFlags::JOIN),
        ('F', DebugFlags::FORK),
    ];

    /// Parse a string of category characters. `*` enables every category.
    ///
    /// Returns `None` on an unknown character.
    pub fn from_chars(s: &str) -> Option<Self> {
        s.chars().try_fold(DebugFlags::empty(), |acc, c| {
            if c == '*' {
                return Some(DebugFlags::all());
            }
            Self::CHARS
                .iter()
                .find(|(ch, _)| *ch == c)
                .map(|(_, flag)| acc | *flag)
        })
    }
}

static DEBUG_FLAGS: AtomicU32 = AtomicU32::new(0);

/// Turn on exactly the categories in `flags`.
pub fn set_debug_flags(flags: DebugFlags) {
    DEBUG_FLAGS.store(flags.bits(), Ordering::SeqCst);
}

/// Whether any of the categories in `flags` is turned on.
pub fn enabled(flags: DebugFlags) -> bool {
    DebugFlags::from_bits_truncate(DEBUG_FLAGS.load(Ordering::SeqCst)).intersects(flags)
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    std::print!("{fmt}");
}

/// Like [`std::print!`], on the kernel console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Like [`std::println!`], on the kernel console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// An `[INFO]` line, unless the kernel runs quietly.
#[macro_export]
macro_rules! info {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO] {}\n", format_args!($($arg)*)) });
}

/// A `[WARN]` line, unless the kernel runs quietly.
#[macro_export]
macro_rules! warning {
    () => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN]\n") });
    ($($arg:tt)*) => (if !$crate::QUITE.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN] {}\n", format_args!($($arg)*)) });
}

/// Display a debug message of a category.
///
/// The first argument names a [`DebugFlags`] constant; the message is printed
/// only when that category is turned on.
///
/// ```
/// machine::debug!(MEMORY, "allocated frame {}", 3);
/// ```
#[macro_export]
macro_rules! debug {
    ($flag:ident, $($arg:tt)*) => (
        if $crate::kprint::enabled($crate::kprint::DebugFlags::$flag) {
            $crate::print!("[{:?}] {}\n", $crate::kprint::DebugFlags::$flag, format_args!($($arg)*))
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_category_characters() {
        assert_eq!(
            DebugFlags::from_chars("tM"),
            Some(DebugFlags::THREAD | DebugFlags::MEMORY)
        );
        assert_eq!(DebugFlags::from_chars("a*"), Some(DebugFlags::all()));
        assert_eq!(DebugFlags::from_chars(""), Some(DebugFlags::empty()));
        assert_eq!(DebugFlags::from_chars("tz"), None);
    }
}
