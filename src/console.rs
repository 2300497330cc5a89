// vm_traps/src/console.rs

//! # Signal-safe Console Output
//!
//! Formatted output that can be used from inside a signal handler. Text is
//! formatted into a fixed buffer on the stack and flushed straight to file
//! descriptor 2 with `write(2)`, so printing never allocates and never takes
//! a lock that the interrupted thread could be holding.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

/// Output verbosity, ordered from most to least severe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Level::Off,
            1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        }
    }

    /// Level selected at build time through the `LOG` environment variable.
    pub fn from_build_env() -> Self {
        match option_env!("LOG") {
            Some("ERROR") => Level::Error,
            Some("WARN") => Level::Warn,
            Some("INFO") => Level::Info,
            Some("DEBUG") => Level::Debug,
            Some("TRACE") => Level::Trace,
            Some("OFF") => Level::Off,
            _ => Level::Warn,
        }
    }
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Warn as u8);

/// Sets the maximum level that will be printed.
pub fn init(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Returns the current maximum level.
pub fn max_level() -> Level {
    Level::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

/// Checks whether messages at `level` are currently printed.
#[inline]
pub fn enabled(level: Level) -> bool {
    level != Level::Off && level <= max_level()
}

const BUFFER_SIZE: usize = 256;

/// A stack-resident writer that batches formatted text and flushes it to
/// stderr whenever the buffer fills up.
struct Stderr {
    buf: [u8; BUFFER_SIZE],
    len: usize,
}

impl Stderr {
    const fn new() -> Self {
        Self {
            buf: [0; BUFFER_SIZE],
            len: 0,
        }
    }

    fn flush(&mut self) {
        write_all(&self.buf[..self.len]);
        self.len = 0;
    }
}

impl Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            if self.len == BUFFER_SIZE {
                self.flush();
            }
            let room = BUFFER_SIZE - self.len;
            let take = room.min(bytes.len());
            self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
            self.len += take;
            bytes = &bytes[take..];
        }
        Ok(())
    }
}

fn write_all(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // Safety: the pointer and length describe a live, initialised slice.
        let written = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if written <= 0 {
            // EINTR is retried; anything else drops the rest of the message.
            if written < 0 && last_errno() == libc::EINTR {
                continue;
            }
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Formats `args` and writes them to stderr.
pub fn print(args: fmt::Arguments) {
    let mut out = Stderr::new();
    let _ = out.write_fmt(args);
    out.flush();
}

/// Prints a message at `level` with the usual colour prefix.
pub fn print_level(level: Level, args: fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    let (colour, tag) = match level {
        Level::Error => ("\x1b[31m", "[ERROR] "),
        Level::Warn => ("\x1b[33m", "[WARN] "),
        Level::Info => ("\x1b[32m", "[INFO] "),
        Level::Debug => ("\x1b[36m", "[DEBUG] "),
        Level::Trace | Level::Off => ("\x1b[90m", "[TRACE] "),
    };
    let mut out = Stderr::new();
    let _ = out.write_str(colour);
    let _ = out.write_str(tag);
    let _ = out.write_fmt(args);
    let _ = out.write_str("\x1b[0m\n");
    out.flush();
}

/// Debug output, prefixed with the source location.
#[macro_export]
macro_rules! debug_print {
    ($($arg:tt)*) => {
        $crate::console::print_level(
            $crate::console::Level::Debug,
            format_args!("[{}:{}] {}", file!(), line!(), format_args!($($arg)*)),
        )
    };
}

/// Error output, highlighted in red.
#[macro_export]
macro_rules! error_print {
    ($($arg:tt)*) => {
        $crate::console::print_level($crate::console::Level::Error, format_args!($($arg)*))
    };
}

/// Warning output, highlighted in yellow.
#[macro_export]
macro_rules! warn_print {
    ($($arg:tt)*) => {
        $crate::console::print_level($crate::console::Level::Warn, format_args!($($arg)*))
    };
}

/// Informational output, highlighted in green.
#[macro_export]
macro_rules! info_print {
    ($($arg:tt)*) => {
        $crate::console::print_level($crate::console::Level::Info, format_args!($($arg)*))
    };
}

/// Unconditional, uncoloured output used by the fatal error report.
#[macro_export]
macro_rules! report_print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}
