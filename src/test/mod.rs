// vm_traps/src/test/mod.rs

//! Test suites, one file per subsystem, and the fake runtime they share.
//!
//! The fake runtime lays out a small address space: an interpreter, one
//! compiled code region with a frame-incomplete prologue and an unsafe-access
//! method, a polling page and a serialization page. Guard zones always run in
//! `Virtual` mode so no test touches page protections by accident.

mod dispatch_test;
mod handler_manager_test;

use crate::config::{GuardProtection, TrapConfig};
use crate::frame::{Frame, StackBounds};
use crate::guard::{StackGuardState, ZoneLayout};
use crate::trap::ds::{ChainedHandler, ExecState, FatalTrap, ImplicitException, RawTrap, Signal, SignalInfo};
use crate::trap::infrastructure::di::traits::{
    CodeRanges, CompiledMethodInfo, ContinuationResolver, ErrorManager, FastAccessorTable, FatalErrorReporter,
    HandlerManager, ReservedActivation, SafeFetchTable, SafepointMemory, SignalController, ThreadLookup, TrapThread,
};
use crate::trap::infrastructure::di::{TrapCollaborators, TrapSystem};
use crate::trap::infrastructure::error_manager::FatalErrorManager;
use crate::trap::infrastructure::handler_manager::ChainedHandlerRegistry;
use crate::trap::TrapApiError;
use alloc::sync::Arc;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const PAGE: usize = 4096;

pub const STACK_BASE: usize = 0x7f00_0010_0000;
pub const STACK_SIZE: usize = 64 * PAGE;

pub const INTERPRETER: Range<usize> = 0x1000_0000..0x1001_0000;
pub const COMPILED: Range<usize> = 0x2000_0000..0x2001_0000;
/// Part of `COMPILED` that has not finished building its frame.
pub const COMPILED_PROLOGUE: Range<usize> = 0x2000_0000..0x2000_0040;
/// Part of `COMPILED` belonging to a method with unchecked accesses.
pub const UNSAFE_METHOD: Range<usize> = 0x2000_8000..0x2000_9000;
pub const ZOMBIE_ENTRY: usize = 0x2000_4000;

pub const SAFEFETCH_PC: usize = 0x3000_0010;
pub const SAFEFETCH_CONTINUATION: usize = 0x3000_0020;
pub const SLOWCASE_PC: usize = 0x3000_0100;
pub const SLOWCASE_ENTRY: usize = 0x3000_0200;

pub const POLL_PAGE: usize = 0x5000_0000;
pub const SERIALIZE_PAGE: usize = 0x5100_0000;

pub const NULL_STUB: usize = 0x6000_0100;
pub const DIV_STUB: usize = 0x6000_0200;
pub const SOE_STUB: usize = 0x6000_0300;
pub const WRONG_METHOD_STUB: usize = 0x6000_0400;
pub const POLL_STUB: usize = 0x6000_0500;
pub const UNSAFE_STUB: usize = 0x6000_0600;

/// A pc inside a frame-complete compiled method.
pub const COMPILED_PC: usize = 0x2000_1000;
pub const INTERPRETER_PC: usize = 0x1000_0800;

pub fn test_config() -> TrapConfig {
    TrapConfig {
        page_size: PAGE,
        guard_protection: GuardProtection::Virtual,
        ..TrapConfig::default()
    }
}

pub fn test_layout() -> ZoneLayout {
    ZoneLayout::new(StackBounds::new(STACK_BASE, STACK_SIZE), &test_config())
}

/// Code ranges, continuations and safepoint pages of the fake runtime.
#[derive(Default)]
pub struct FakeRuntime {
    pub reservation_annotated: AtomicBool,
    pub serialize_waits: AtomicUsize,
    pub unsafe_next_pc: AtomicUsize,
}

impl CodeRanges for FakeRuntime {
    fn in_interpreter(&self, pc: usize) -> bool {
        INTERPRETER.contains(&pc)
    }

    fn compiled_method_at(&self, pc: usize) -> Option<CompiledMethodInfo> {
        COMPILED.contains(&pc).then(|| CompiledMethodInfo {
            frame_complete: !COMPILED_PROLOGUE.contains(&pc),
            has_unsafe_access: UNSAFE_METHOD.contains(&pc),
        })
    }

    fn is_zombie_entry(&self, pc: usize) -> bool {
        pc == ZOMBIE_ENTRY
    }
}

impl ContinuationResolver for FakeRuntime {
    fn implicit_exception(&self, _thread: &dyn TrapThread, pc: usize, kind: ImplicitException) -> Option<usize> {
        if !self.in_managed_code(pc) {
            return None;
        }
        Some(match kind {
            ImplicitException::DivideByZero => DIV_STUB,
            ImplicitException::Null => NULL_STUB,
            ImplicitException::StackOverflow => SOE_STUB,
        })
    }

    fn wrong_method_stub(&self) -> usize {
        WRONG_METHOD_STUB
    }

    fn poll_stub(&self, pc: usize) -> Option<usize> {
        COMPILED.contains(&pc).then_some(POLL_STUB)
    }

    fn unsafe_access(&self, _thread: &dyn TrapThread, next_pc: usize) -> usize {
        self.unsafe_next_pc.store(next_pc, Ordering::SeqCst);
        UNSAFE_STUB
    }

    fn reserved_stack_activation(&self, _thread: &dyn TrapThread, frame: &Frame) -> Option<ReservedActivation> {
        if !self.reservation_annotated.load(Ordering::SeqCst) {
            return None;
        }
        Some(ReservedActivation {
            frame: *frame,
            unextended_sp: frame.sp,
            interpreted: self.in_interpreter(frame.pc),
        })
    }
}

impl SafeFetchTable for FakeRuntime {
    fn continuation(&self, pc: usize) -> Option<usize> {
        (pc == SAFEFETCH_PC).then_some(SAFEFETCH_CONTINUATION)
    }
}

impl FastAccessorTable for FakeRuntime {
    fn slowcase_entry(&self, pc: usize) -> Option<usize> {
        (pc == SLOWCASE_PC).then_some(SLOWCASE_ENTRY)
    }
}

impl SafepointMemory for FakeRuntime {
    fn is_poll_address(&self, addr: usize) -> bool {
        (POLL_PAGE..POLL_PAGE + PAGE).contains(&addr)
    }

    fn is_serialize_page(&self, addr: usize) -> bool {
        (SERIALIZE_PAGE..SERIALIZE_PAGE + PAGE).contains(&addr)
    }

    fn block_on_serialize_page_trap(&self) {
        self.serialize_waits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts reports and unwinds instead of terminating the test process.
#[derive(Default)]
pub struct FakeReporter {
    pub reports: AtomicUsize,
}

impl FatalErrorReporter for FakeReporter {
    fn report_and_die(&self, trap: &FatalTrap, _raw: RawTrap) -> ! {
        self.reports.fetch_add(1, Ordering::SeqCst);
        panic!("fatal trap: {}", trap);
    }
}

pub struct FakeThread {
    pub id: u64,
    pub state: ExecState,
    pub guard: Option<StackGuardState>,
    pub doing_unsafe: AtomicBool,
    pub saved_pc: AtomicUsize,
}

impl FakeThread {
    pub fn new(state: ExecState) -> Self {
        Self {
            id: 7,
            state,
            guard: None,
            doing_unsafe: AtomicBool::new(false),
            saved_pc: AtomicUsize::new(0),
        }
    }

    /// A thread whose guard zones are laid out by [`test_layout`] and armed.
    pub fn with_guard(state: ExecState) -> Self {
        let guard = StackGuardState::with_layout(test_layout(), GuardProtection::Virtual);
        guard.arm();
        Self {
            guard: Some(guard),
            ..Self::new(state)
        }
    }

    pub fn guard(&self) -> &StackGuardState {
        self.guard.as_ref().expect("thread has no guard zones")
    }
}

impl TrapThread for FakeThread {
    fn id(&self) -> u64 {
        self.id
    }

    fn exec_state(&self) -> ExecState {
        self.state
    }

    fn stack_guard(&self) -> Option<&StackGuardState> {
        self.guard.as_ref()
    }

    fn doing_unsafe_access(&self) -> bool {
        self.doing_unsafe.load(Ordering::SeqCst)
    }

    fn set_saved_exception_pc(&self, pc: usize) {
        self.saved_pc.store(pc, Ordering::SeqCst);
    }
}

pub struct FakeThreads {
    pub current: Option<Arc<FakeThread>>,
}

impl ThreadLookup for FakeThreads {
    fn current(&self) -> Option<&dyn TrapThread> {
        self.current.as_deref().map(|t| t as &dyn TrapThread)
    }
}

/// Leaves the process signal dispositions alone.
#[derive(Default)]
pub struct NoopSignalController {
    pub unblocked: AtomicUsize,
}

impl SignalController for NoopSignalController {
    fn install(&self, _signals: &[Signal], _handlers: &dyn HandlerManager) -> Result<(), TrapApiError> {
        Ok(())
    }

    fn unblock(&self, _signal: Signal) {
        self.unblocked.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fails every installation with a fixed errno.
pub struct FailingSignalController(pub i32);

impl SignalController for FailingSignalController {
    fn install(&self, _signals: &[Signal], _handlers: &dyn HandlerManager) -> Result<(), TrapApiError> {
        Err(TrapApiError::InstallFailed(self.0))
    }

    fn unblock(&self, _signal: Signal) {}
}

/// Counts invocations and reports a fixed result.
pub struct CountingHandler {
    pub calls: AtomicUsize,
    pub handles: bool,
}

impl CountingHandler {
    pub fn new(handles: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            handles,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChainedHandler for CountingHandler {
    fn try_handle(&self, _info: &SignalInfo, _raw: RawTrap) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.handles
    }
}

/// A private trap system wired to the fakes. Never installed globally.
pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub reporter: Arc<FakeReporter>,
    pub registry: Arc<ChainedHandlerRegistry>,
    pub errors: Arc<FatalErrorManager>,
    pub thread: Option<Arc<FakeThread>>,
    pub system: Arc<TrapSystem>,
}

impl Harness {
    pub fn new(thread: Option<FakeThread>) -> Self {
        Self::with_config(test_config(), thread)
    }

    pub fn with_config(config: TrapConfig, thread: Option<FakeThread>) -> Self {
        Self::with_controller(config, thread, alloc::boxed::Box::new(NoopSignalController::default()))
    }

    pub fn with_controller(
        config: TrapConfig,
        thread: Option<FakeThread>,
        controller: alloc::boxed::Box<dyn SignalController>,
    ) -> Self {
        let runtime = Arc::new(FakeRuntime::default());
        let reporter = Arc::new(FakeReporter::default());
        let thread = thread.map(Arc::new);
        let collaborators = TrapCollaborators {
            code_ranges: runtime.clone(),
            resolver: runtime.clone(),
            safefetch: runtime.clone(),
            fast_accessors: runtime.clone(),
            safepoint: runtime.clone(),
            reporter: reporter.clone(),
            threads: Arc::new(FakeThreads {
                current: thread.clone(),
            }),
        };
        let registry = Arc::new(ChainedHandlerRegistry::new());
        let errors = Arc::new(FatalErrorManager::new(reporter.clone(), runtime.clone()));
        let system = TrapSystem::new(
            config,
            collaborators,
            Arc::clone(&registry) as Arc<dyn HandlerManager>,
            Arc::clone(&errors) as Arc<dyn ErrorManager>,
            controller,
        );
        Self {
            runtime,
            reporter,
            registry,
            errors,
            thread,
            system: Arc::new(system),
        }
    }

    pub fn thread(&self) -> &FakeThread {
        self.thread.as_deref().expect("harness has no thread")
    }

    pub fn reports(&self) -> usize {
        self.reporter.reports.load(Ordering::SeqCst)
    }
}
