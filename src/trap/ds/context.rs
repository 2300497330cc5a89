// vm_traps/src/trap/ds/context.rs

//! # Register Snapshot
//!
//! A portable copy of the AArch64 register file, used for diagnostics and as
//! a context the classifier can run against outside a real signal.

use crate::context::HardwareContext;
use core::fmt;

/// Index of the frame pointer among the general purpose registers.
pub const FP_REGISTER: usize = 29;
/// Index of the link register among the general purpose registers.
pub const LR_REGISTER: usize = 30;
pub const GPR_COUNT: usize = 31;

/// # Register Snapshot
///
/// Registers x0-x30 followed by sp, pc and pstate, in the order a trap frame
/// would save them.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSnapshot {
    /// General purpose registers x0-x30.
    pub x: [usize; GPR_COUNT],
    pub sp: usize,
    pub pc: usize,
    pub pstate: usize,
}

impl RegisterSnapshot {
    /// Creates a zeroed snapshot.
    pub const fn new() -> Self {
        Self {
            x: [0; GPR_COUNT],
            sp: 0,
            pc: 0,
            pstate: 0,
        }
    }

    /// A snapshot with only the three frame registers set.
    pub const fn with_frame(pc: usize, sp: usize, fp: usize) -> Self {
        let mut snapshot = Self::new();
        snapshot.pc = pc;
        snapshot.sp = sp;
        snapshot.x[FP_REGISTER] = fp;
        snapshot
    }

    /// Copies every register `context` exposes.
    pub fn capture<C: HardwareContext + ?Sized>(context: &C) -> Self {
        let mut snapshot = Self::new();
        for i in 0..context.gpr_count().min(GPR_COUNT) {
            snapshot.x[i] = context.gpr(i).unwrap_or(0);
        }
        snapshot.x[FP_REGISTER] = context.fp();
        if let Some(lr) = context.lr() {
            snapshot.x[LR_REGISTER] = lr;
        }
        snapshot.sp = context.sp();
        snapshot.pc = context.pc();
        snapshot
    }

    pub fn set_lr(&mut self, lr: usize) {
        self.x[LR_REGISTER] = lr;
    }
}

impl Default for RegisterSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareContext for RegisterSnapshot {
    fn pc(&self) -> usize {
        self.pc
    }

    fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    fn sp(&self) -> usize {
        self.sp
    }

    fn fp(&self) -> usize {
        self.x[FP_REGISTER]
    }

    fn lr(&self) -> Option<usize> {
        Some(self.x[LR_REGISTER])
    }

    fn gpr(&self, index: usize) -> Option<usize> {
        self.x.get(index).copied()
    }

    fn gpr_count(&self) -> usize {
        GPR_COUNT
    }

    fn snapshot(&self) -> RegisterSnapshot {
        *self
    }
}

impl fmt::Display for RegisterSnapshot {
    /// Four registers per line, the layout of the fatal error report.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.x.iter().enumerate() {
            write!(f, "R{:<2}=0x{:016x}", i, value)?;
            if i % 4 == 3 {
                writeln!(f)?;
            } else {
                write!(f, "  ")?;
            }
        }
        writeln!(f, "SP =0x{:016x}", self.sp)?;
        write!(f, "PC =0x{:016x}  PSTATE=0x{:08x}", self.pc, self.pstate)
    }
}
