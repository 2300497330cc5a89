// vm_traps/src/trap/infrastructure/error_manager.rs

//! # Trap Log and Fatal Error Path
//!
//! Implements the `ErrorManager` trait: a fixed ring buffer of recent traps
//! and the once-only hand-off of an unrecoverable trap to the reporter.

use crate::config::WORD_SIZE;
use crate::trap::collections::RingBuffer;
use crate::trap::ds::{FatalTrap, RawTrap, TrapEvent};
use crate::trap::infrastructure::di::traits::{CodeRanges, ErrorManager, FatalErrorReporter};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

pub const TRAP_LOG_CAPACITY: usize = 32;

/// Words of stack shown in the fatal report.
const TOP_OF_STACK_WORDS: usize = 8;

pub struct FatalErrorManager {
    log: Mutex<RingBuffer<TrapEvent, TRAP_LOG_CAPACITY>>,
    reporter: Arc<dyn FatalErrorReporter>,
    code_ranges: Arc<dyn CodeRanges>,
    fatal_in_progress: AtomicBool,
    /// `pthread_self` of the thread that won the right to report.
    reporting_thread: AtomicUsize,
}

impl FatalErrorManager {
    pub fn new(reporter: Arc<dyn FatalErrorReporter>, code_ranges: Arc<dyn CodeRanges>) -> Self {
        Self {
            log: Mutex::new(RingBuffer::new()),
            reporter,
            code_ranges,
            fatal_in_progress: AtomicBool::new(false),
            reporting_thread: AtomicUsize::new(0),
        }
    }

    fn current_thread() -> usize {
        // Safety: pthread_self has no preconditions.
        unsafe { libc::pthread_self() as usize }
    }

    fn print_report(&self, trap: &FatalTrap) {
        crate::report_print!("#");
        crate::report_print!("# A fatal error has been detected by the runtime:");
        crate::report_print!("#");
        crate::report_print!("#  {}", trap);
        crate::report_print!("#");
        crate::report_print!("");
        crate::report_print!("Registers:");
        crate::report_print!("{}", trap.registers);
        crate::report_print!("");

        self.print_top_of_stack(trap);
        self.print_register_info(trap);
        self.print_recent_traps();
    }

    fn print_top_of_stack(&self, trap: &FatalTrap) {
        let sp = trap.registers.sp;
        let Some(bounds) = trap.stack_bounds else {
            crate::report_print!("Top of Stack: (sp=0x{:016x}) unavailable", sp);
            return;
        };
        let end = sp.saturating_add(TOP_OF_STACK_WORDS * WORD_SIZE);
        if sp % WORD_SIZE != 0 || !bounds.contains(sp) || end > bounds.base {
            crate::report_print!("Top of Stack: (sp=0x{:016x}) outside the thread stack", sp);
            return;
        }
        crate::report_print!("Top of Stack: (sp=0x{:016x})", sp);
        for row in 0..TOP_OF_STACK_WORDS / 2 {
            let addr = sp + row * 2 * WORD_SIZE;
            // Safety: both words lie inside the faulting thread's stack.
            let (a, b) = unsafe { (*(addr as *const usize), *((addr + WORD_SIZE) as *const usize)) };
            crate::report_print!("0x{:016x}:   0x{:016x} 0x{:016x}", addr, a, b);
        }
        crate::report_print!("");
    }

    fn describe(&self, trap: &FatalTrap, value: usize) -> &'static str {
        if value == 0 {
            "NULL"
        } else if trap.stack_bounds.map_or(false, |b| b.contains(value)) {
            "pointer into the thread stack"
        } else if self.code_ranges.in_interpreter(value) {
            "in the interpreter"
        } else if self.code_ranges.compiled_method_at(value).is_some() {
            "in a compiled method"
        } else {
            "unknown value"
        }
    }

    fn print_register_info(&self, trap: &FatalTrap) {
        crate::report_print!("Register to memory mapping:");
        crate::report_print!("");
        for (i, value) in trap.registers.x.iter().enumerate() {
            crate::report_print!("R{:<2}=0x{:016x} {}", i, value, self.describe(trap, *value));
        }
        crate::report_print!("SP =0x{:016x} {}", trap.registers.sp, self.describe(trap, trap.registers.sp));
        crate::report_print!("");
    }

    fn print_recent_traps(&self) {
        crate::report_print!("Recent traps:");
        match self.log.try_lock() {
            Some(log) => {
                for event in log.iter() {
                    crate::report_print!("  {}", event);
                }
            }
            None => crate::report_print!("  (log busy)"),
        }
    }
}

impl ErrorManager for FatalErrorManager {
    fn log_trap(&self, event: TrapEvent) {
        // Skip rather than wait: the holder may be the interrupted code.
        if let Some(mut log) = self.log.try_lock() {
            log.push(event);
        }
    }

    fn recent_traps(&self, out: &mut [TrapEvent]) -> usize {
        self.log.lock().copy_to(out)
    }

    fn escalate(&self, trap: &FatalTrap, raw: RawTrap) -> ! {
        let me = Self::current_thread();
        if self
            .fatal_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.reporting_thread.store(me, Ordering::Release);
            self.print_report(trap);
            self.reporter.report_and_die(trap, raw);
        }

        if self.reporting_thread.load(Ordering::Acquire) == me {
            crate::report_print!("[error occurred during error reporting: {}]", trap);
            // Safety: abort has no preconditions.
            unsafe { libc::abort() }
        }
        // Another thread is reporting and will end the process.
        loop {
            // Safety: pause has no preconditions.
            unsafe { libc::pause() };
        }
    }

    fn is_fatal_in_progress(&self) -> bool {
        self.fatal_in_progress.load(Ordering::Acquire)
    }
}
