// vm_traps/src/trap/infrastructure/di/traits.rs

//! # Dependency Injection Traits
//!
//! The interfaces the trap system is assembled from. The first group are the
//! runtime collaborators the classifier consults; the second group are the
//! trap system's own managers.
//!
//! The collaborator methods, `HandlerManager::dispatch`, `SignalController::unblock`
//! and every `ErrorManager` method except `recent_traps` are called from
//! inside a signal handler on the faulting thread. Implementations of those
//! must not allocate and must not block on a lock the interrupted code could
//! hold. The remaining methods are for ordinary code and may block.

use crate::config::{INTERPRETER_FRAME_INITIAL_SP_OFFSET, WORD_SIZE};
use crate::frame::Frame;
use crate::guard::StackGuardState;
use crate::trap::api::TrapApiError;
use crate::trap::ds::{
    ExecState, FatalTrap, HandlerEntry, HandlerHandle, ImplicitException, RawTrap, RegistrarId, Signal, SignalInfo, TrapEvent,
};

/// What the code cache knows about the compiled method containing a pc.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CompiledMethodInfo {
    /// The method has finished building its frame at this pc.
    pub frame_complete: bool,
    /// The method performs unchecked memory accesses.
    pub has_unsafe_access: bool,
}

/// Answers which kind of code a program counter belongs to.
pub trait CodeRanges: Send + Sync {
    fn in_interpreter(&self, pc: usize) -> bool;

    fn compiled_method_at(&self, pc: usize) -> Option<CompiledMethodInfo>;

    /// `pc` is the patched entry of a compiled method that has been made not
    /// entrant.
    fn is_zombie_entry(&self, pc: usize) -> bool;

    fn in_managed_code(&self, pc: usize) -> bool {
        self.in_interpreter(pc) || self.compiled_method_at(pc).is_some()
    }
}

/// The frame of a method annotated as needing reserved stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReservedActivation {
    pub frame: Frame,
    pub unextended_sp: usize,
    pub interpreted: bool,
}

impl ReservedActivation {
    /// The address recorded as the reserved-stack activation: the initial
    /// expression stack slot for interpreted frames, the unextended sp for
    /// compiled ones.
    pub fn address(&self) -> usize {
        if self.interpreted {
            let offset = INTERPRETER_FRAME_INITIAL_SP_OFFSET * WORD_SIZE as isize;
            self.frame.fp.wrapping_add_signed(offset)
        } else {
            self.unextended_sp
        }
    }
}

/// Picks the code a redirected thread resumes at.
pub trait ContinuationResolver: Send + Sync {
    /// Stub that raises `kind` for a fault at `pc`. `None` if `pc` has no
    /// such continuation.
    fn implicit_exception(&self, thread: &dyn TrapThread, pc: usize, kind: ImplicitException) -> Option<usize>;

    /// Stub that re-resolves the call of a not-entrant method.
    fn wrong_method_stub(&self) -> usize;

    /// Stub that handles the safepoint poll at `pc`.
    fn poll_stub(&self, pc: usize) -> Option<usize>;

    /// Continuation after a failed unchecked access; execution resumes at
    /// `next_pc` with the pending error flagged.
    fn unsafe_access(&self, thread: &dyn TrapThread, next_pc: usize) -> usize;

    /// Looks for a reserved-stack annotated method in the frame enclosing
    /// `frame`.
    fn reserved_stack_activation(&self, thread: &dyn TrapThread, frame: &Frame) -> Option<ReservedActivation>;
}

/// Registered speculative-read sites.
pub trait SafeFetchTable: Send + Sync {
    /// The continuation for a safe fetch at `pc`, if `pc` is one.
    fn continuation(&self, pc: usize) -> Option<usize>;
}

/// Fast primitive-field accessors and their slow paths.
pub trait FastAccessorTable: Send + Sync {
    fn slowcase_entry(&self, pc: usize) -> Option<usize>;
}

/// The memory pages the runtime protects for thread coordination.
pub trait SafepointMemory: Send + Sync {
    fn is_poll_address(&self, addr: usize) -> bool;

    fn is_serialize_page(&self, addr: usize) -> bool;

    /// Blocks until the serialization page is writable again.
    fn block_on_serialize_page_trap(&self);
}

/// Terminates the process with a diagnostic report.
pub trait FatalErrorReporter: Send + Sync {
    fn report_and_die(&self, trap: &FatalTrap, raw: RawTrap) -> !;
}

/// The trap system's view of a managed thread.
pub trait TrapThread: Sync {
    fn id(&self) -> u64;

    fn exec_state(&self) -> ExecState;

    fn stack_guard(&self) -> Option<&StackGuardState>;

    /// Runtime code on this thread is performing a flagged unchecked access.
    fn doing_unsafe_access(&self) -> bool;

    /// Records the faulting pc before the thread is redirected.
    fn set_saved_exception_pc(&self, pc: usize);
}

/// Finds the managed thread running on the current OS thread.
pub trait ThreadLookup: Send + Sync {
    fn current(&self) -> Option<&dyn TrapThread>;
}

/// Interface for the chained handler registry.
///
/// Everything except `dispatch` blocks on the registry lock and must not be
/// called inside a signal handler.
pub trait HandlerManager: Send + Sync {
    fn register(&self, entry: HandlerEntry) -> Result<HandlerHandle, TrapApiError>;

    fn unregister(&self, handle: HandlerHandle, requester_id: RegistrarId) -> Result<(), TrapApiError>;

    fn transfer_ownership(
        &self,
        handle: HandlerHandle,
        current_owner: RegistrarId,
        new_owner: RegistrarId,
    ) -> Result<(), TrapApiError>;

    /// Offers the signal to every accepting handler in priority order until
    /// one handles it.
    fn dispatch(&self, info: &SignalInfo, raw: RawTrap) -> bool;

    fn handler_count(&self, signal: Signal) -> usize;
}

/// Interface for the trap log and the fatal error path.
pub trait ErrorManager: Send + Sync {
    fn log_trap(&self, event: TrapEvent);

    /// Copies the most recent events, oldest first, into `out`. Blocks on the
    /// log lock; not for use inside a signal handler.
    fn recent_traps(&self, out: &mut [TrapEvent]) -> usize;

    /// Prints the diagnostic report and hands over to the reporter. Only the
    /// first caller in the process gets that far.
    fn escalate(&self, trap: &FatalTrap, raw: RawTrap) -> !;

    fn is_fatal_in_progress(&self) -> bool;
}

/// Installation of the OS-level signal handlers.
pub trait SignalController: Send + Sync {
    /// Installs the dispatcher for `signals`, registering any handlers they
    /// replace with `handlers`. Called once, outside any signal handler.
    fn install(&self, signals: &[Signal], handlers: &dyn HandlerManager) -> Result<(), TrapApiError>;

    /// Unblocks `signal` for the current thread.
    fn unblock(&self, signal: Signal);
}
