// vm_traps/src/trap/ds/error.rs

//! # Error Handling Data Structures
//!
//! Severity of a handled trap, the record describing a fatal trap, and the
//! entries of the recent-trap log.

use super::context::RegisterSnapshot;
use super::handler::{Rule, TrapDisposition};
use super::types::{Signal, SignalInfo};
use crate::frame::StackBounds;
use core::fmt;

/// How bad a trap turned out to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TrapSeverity {
    /// The faulting instruction is simply executed again.
    RecoverableByRetry = 0,
    /// Control continues in a recovery stub.
    RecoverableByRedirect = 1,
    /// The process is going down.
    Fatal = 2,
}

impl fmt::Display for TrapSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrapSeverity::RecoverableByRetry => "recoverable (retry)",
            TrapSeverity::RecoverableByRedirect => "recoverable (redirect)",
            TrapSeverity::Fatal => "fatal",
        })
    }
}

/// Everything known about a trap that could not be recovered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FatalTrap {
    /// Id of the faulting managed thread, if the fault happened on one.
    pub thread_id: Option<u64>,
    pub info: SignalInfo,
    pub pc: usize,
    pub rule: Rule,
    pub registers: RegisterSnapshot,
    /// The faulting thread's stack, when known; bounds the stack dump.
    pub stack_bounds: Option<StackBounds>,
}

impl fmt::Display for FatalTrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at pc=0x{:016x}", self.info.signal, self.pc)?;
        match self.thread_id {
            Some(id) => write!(f, ", thread {}", id)?,
            None => f.write_str(", non-managed thread")?,
        }
        if let Some(code) = self.info.code {
            write!(f, ", si_code={}", code)?;
        }
        if let Some(addr) = self.info.fault_address {
            write!(f, ", si_addr=0x{:016x}", addr)?;
        }
        write!(f, " [{}]", self.rule)
    }
}

/// An entry of the recent-trap log.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TrapEvent {
    pub sequence: u64,
    pub thread_id: Option<u64>,
    pub info: SignalInfo,
    pub pc: usize,
    pub rule: Rule,
    pub disposition: TrapDisposition,
}

impl TrapEvent {
    /// Filler for preallocated event buffers.
    pub const EMPTY: TrapEvent = TrapEvent {
        sequence: 0,
        thread_id: None,
        info: SignalInfo::new(Signal::Other(0), None, None),
        pc: 0,
        rule: Rule::Unrecognized,
        disposition: TrapDisposition::Ignore,
    };

    pub fn severity(&self) -> TrapSeverity {
        self.disposition.severity()
    }
}

impl fmt::Display for TrapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} pc=0x{:x} {} -> {}",
            self.sequence, self.info, self.pc, self.rule, self.disposition
        )
    }
}
