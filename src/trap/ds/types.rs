// vm_traps/src/trap/ds/types.rs

//! # Trap Type Definitions
//!
//! Signals the dispatcher handles, the fault information delivered with
//! them, and the execution state of the faulting thread.

use core::fmt;

/// `si_code` values for integer and floating-point divide by zero. The
/// numbering differs between kernels.
mod fpe_codes {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            pub const FPE_INTDIV: i32 = 7;
            pub const FPE_FLTDIV: i32 = 1;
        } else if #[cfg(target_os = "freebsd")] {
            pub const FPE_INTDIV: i32 = 2;
            pub const FPE_FLTDIV: i32 = 3;
        } else {
            pub const FPE_INTDIV: i32 = 1;
            pub const FPE_FLTDIV: i32 = 3;
        }
    }
}

pub use self::fpe_codes::{FPE_FLTDIV, FPE_INTDIV};

/// The signals the trap dispatcher is installed for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Signal {
    Segv,
    Bus,
    Ill,
    Trap,
    Fpe,
    Pipe,
    Xfsz,
    Other(i32),
}

impl Signal {
    /// Every signal the dispatcher installs a handler for.
    pub const HANDLED: [Signal; 7] = [
        Signal::Segv,
        Signal::Bus,
        Signal::Ill,
        Signal::Fpe,
        Signal::Trap,
        Signal::Pipe,
        Signal::Xfsz,
    ];

    pub fn from_raw(signo: i32) -> Self {
        match signo {
            libc::SIGSEGV => Signal::Segv,
            libc::SIGBUS => Signal::Bus,
            libc::SIGILL => Signal::Ill,
            libc::SIGTRAP => Signal::Trap,
            libc::SIGFPE => Signal::Fpe,
            libc::SIGPIPE => Signal::Pipe,
            libc::SIGXFSZ => Signal::Xfsz,
            other => Signal::Other(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            Signal::Segv => libc::SIGSEGV,
            Signal::Bus => libc::SIGBUS,
            Signal::Ill => libc::SIGILL,
            Signal::Trap => libc::SIGTRAP,
            Signal::Fpe => libc::SIGFPE,
            Signal::Pipe => libc::SIGPIPE,
            Signal::Xfsz => libc::SIGXFSZ,
            Signal::Other(signo) => signo,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Segv => "SIGSEGV",
            Signal::Bus => "SIGBUS",
            Signal::Ill => "SIGILL",
            Signal::Trap => "SIGTRAP",
            Signal::Fpe => "SIGFPE",
            Signal::Pipe => "SIGPIPE",
            Signal::Xfsz => "SIGXFSZ",
            Signal::Other(_) => "SIG?",
        }
    }

    /// Signals that never carry a managed-language meaning.
    pub fn is_broken_pipe_class(self) -> bool {
        matches!(self, Signal::Pipe | Signal::Xfsz)
    }

    /// Synchronous error signals, which stay unblocked while handling.
    pub fn is_error_signal(self) -> bool {
        matches!(self, Signal::Segv | Signal::Bus | Signal::Ill | Signal::Fpe | Signal::Trap)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Other(signo) => write!(f, "signal {}", signo),
            _ => f.write_str(self.name()),
        }
    }
}

/// The fault information that came with a signal. Either field may be
/// missing, e.g. for signals sent with `kill`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    pub signal: Signal,
    pub code: Option<i32>,
    pub fault_address: Option<usize>,
}

impl SignalInfo {
    pub const fn new(signal: Signal, code: Option<i32>, fault_address: Option<usize>) -> Self {
        Self {
            signal,
            code,
            fault_address,
        }
    }

    /// A memory fault at `addr`.
    pub const fn fault(signal: Signal, addr: usize) -> Self {
        Self::new(signal, None, Some(addr))
    }

    /// Reads the kernel's `siginfo_t`. A null `info` yields a record with
    /// only the signal set.
    ///
    /// # Safety
    /// `info` must be null or point to the `siginfo_t` delivered with `signo`.
    pub unsafe fn from_raw(signo: i32, info: *const libc::siginfo_t) -> Self {
        let signal = Signal::from_raw(signo);
        let Some(info) = info.as_ref() else {
            return Self::new(signal, None, None);
        };
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "openbsd"))] {
                let addr = info.si_addr() as usize;
            } else {
                let addr = info.si_addr as usize;
            }
        }
        Self::new(signal, Some(info.si_code), Some(addr))
    }

    pub fn is_divide_by_zero(&self) -> bool {
        self.signal == Signal::Fpe && matches!(self.code, Some(FPE_INTDIV) | Some(FPE_FLTDIV))
    }
}

impl fmt::Display for SignalInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signal)?;
        if let Some(code) = self.code {
            write!(f, " (si_code={})", code)?;
        }
        if let Some(addr) = self.fault_address {
            write!(f, " at 0x{:x}", addr)?;
        }
        Ok(())
    }
}

/// What the faulting thread was doing when the signal arrived.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecState {
    /// Running interpreted or compiled managed code.
    Managed,
    /// Running runtime-internal code on behalf of the managed program.
    Runtime,
    /// Inside a native call.
    Native,
    /// Parked or waiting; treated like native for stack overflow.
    Blocked,
}

impl ExecState {
    pub fn is_managed(self) -> bool {
        self == ExecState::Managed
    }
}

/// The implicit exceptions a hardware fault can stand in for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImplicitException {
    DivideByZero,
    Null,
    StackOverflow,
}
