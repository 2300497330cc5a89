// vm_traps/src/test/dispatch_test.rs

use super::*;
use crate::context::HardwareContext;
use crate::trap::ds::{
    HandlerEntry, HandlerHandle, ProtectionLevel, RegisterSnapshot, Rule, TrapDisposition, TrapEvent, TrapSeverity,
    RUNTIME_REGISTRAR_ID,
};
use crate::trap::infrastructure::di::container::SignalHandlerMark;
use crate::trap::infrastructure::error_manager::TRAP_LOG_CAPACITY;
use crate::trap::infrastructure::initialize_trap_system;
use alloc::boxed::Box;
use alloc::sync::Weak;
use std::panic::{catch_unwind, AssertUnwindSafe};

fn raw(signal: Signal) -> RawTrap {
    RawTrap::synthetic(signal.raw())
}

fn events(harness: &Harness) -> Vec<TrapEvent> {
    let mut buffer = [TrapEvent::EMPTY; TRAP_LOG_CAPACITY];
    let count = harness.errors.recent_traps(&mut buffer);
    buffer[..count].to_vec()
}

#[test]
fn redirect_rewrites_pc_and_records_the_faulting_pc() {
    let harness = Harness::new(Some(FakeThread::new(ExecState::Managed)));
    let mut ctx = RegisterSnapshot::with_frame(COMPILED_PC, STACK_BASE - PAGE, STACK_BASE - 64);
    let info = SignalInfo::fault(Signal::Segv, 0x8);

    let handled = harness
        .system
        .handle_signal(info, raw(Signal::Segv), Some(&mut ctx), true);

    assert!(handled);
    assert_eq!(ctx.pc(), NULL_STUB);
    assert_eq!(harness.thread().saved_pc.load(Ordering::SeqCst), COMPILED_PC);
    let log = events(&harness);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].rule, Rule::ImplicitNull);
    assert_eq!(log[0].pc, COMPILED_PC);
    assert_eq!(log[0].thread_id, Some(7));
    assert_eq!(log[0].severity(), TrapSeverity::RecoverableByRedirect);
}

/// Enters the signal handler `depth` frames down and never leaves it, as a
/// chained handler that jumps out with `siglongjmp` does.
#[inline(never)]
fn abandon_handler_mark(depth: usize) {
    let pad = core::hint::black_box([0u8; 1024]);
    if depth == 0 {
        core::mem::forget(SignalHandlerMark::enter());
    } else {
        abandon_handler_mark(depth - 1);
    }
    core::hint::black_box(&pad);
}

#[test]
fn abandoned_handler_does_not_make_later_faults_nested() {
    let harness = Harness::new(Some(FakeThread::new(ExecState::Managed)));
    abandon_handler_mark(32);

    for _ in 0..2 {
        let mut ctx = RegisterSnapshot::with_frame(COMPILED_PC, STACK_BASE - PAGE, STACK_BASE - 64);
        let handled = harness.system.handle_signal(
            SignalInfo::fault(Signal::Segv, 0x8),
            raw(Signal::Segv),
            Some(&mut ctx),
            true,
        );
        assert!(handled);
        assert_eq!(ctx.pc(), NULL_STUB);
    }
    let log = events(&harness);
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|event| event.rule == Rule::ImplicitNull));
}

#[test]
fn reservation_retry_leaves_saved_pc_alone() {
    let harness = Harness::new(Some(FakeThread::with_guard(ExecState::Managed)));
    harness.runtime.reservation_annotated.store(true, Ordering::SeqCst);
    let addr = test_layout().reserved_zone_base() - 8;
    let mut ctx = RegisterSnapshot::with_frame(INTERPRETER_PC, STACK_BASE - 2 * PAGE, STACK_BASE - PAGE);

    let handled = harness
        .system
        .handle_signal(SignalInfo::fault(Signal::Segv, addr), raw(Signal::Segv), Some(&mut ctx), true);

    assert!(handled);
    assert_eq!(ctx.pc(), INTERPRETER_PC);
    assert_eq!(harness.thread().saved_pc.load(Ordering::SeqCst), 0);
    assert_eq!(events(&harness)[0].rule, Rule::ReservedStack);
}

#[test]
fn end_to_end_yellow_zone_overflow() {
    let harness = Harness::new(Some(FakeThread::with_guard(ExecState::Managed)));
    let addr = test_layout().yellow_zone_base() - 8;
    let mut ctx = RegisterSnapshot::with_frame(COMPILED_PC, addr + 64, addr + 128);

    let handled = harness
        .system
        .handle_signal(SignalInfo::fault(Signal::Segv, addr), raw(Signal::Segv), Some(&mut ctx), true);

    assert!(handled);
    assert_eq!(ctx.pc, SOE_STUB);
    assert!(!harness.thread().guard().is_yellow_reserved_enabled());
    assert_eq!(harness.reports(), 0);
}

#[test]
fn ignore_leaves_the_context_alone() {
    let harness = Harness::new(Some(FakeThread::with_guard(ExecState::Managed)));
    let mut ctx = RegisterSnapshot::with_frame(COMPILED_PC, STACK_BASE - PAGE, STACK_BASE - 64);
    let before = ctx;

    let handled = harness.system.handle_signal(
        SignalInfo::new(Signal::Pipe, None, None),
        raw(Signal::Pipe),
        Some(&mut ctx),
        true,
    );

    assert!(handled);
    assert_eq!(ctx, before);
    assert_eq!(harness.thread().saved_pc.load(Ordering::SeqCst), 0);
    assert_eq!(events(&harness)[0].severity(), TrapSeverity::RecoverableByRetry);
}

#[test]
fn unrecognized_without_abort_reports_not_handled() {
    let harness = Harness::new(None);
    let mut ctx = RegisterSnapshot::with_frame(0x4000_0000, STACK_BASE - PAGE, 0);

    let handled = harness.system.handle_signal(
        SignalInfo::fault(Signal::Segv, 0x10),
        raw(Signal::Segv),
        Some(&mut ctx),
        false,
    );

    assert!(!handled);
    assert_eq!(ctx.pc, 0x4000_0000);
    assert_eq!(harness.reports(), 0);
    assert!(!harness.errors.is_fatal_in_progress());
}

#[test]
fn unrecognized_with_abort_reaches_the_reporter_once() {
    let harness = Harness::new(Some(FakeThread::new(ExecState::Native)));
    let mut ctx = RegisterSnapshot::with_frame(0x4000_0000, STACK_BASE - PAGE, 0);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        harness.system.handle_signal(
            SignalInfo::fault(Signal::Ill, 0x4000_0000),
            raw(Signal::Ill),
            Some(&mut ctx),
            true,
        )
    }));

    assert!(outcome.is_err());
    assert_eq!(harness.reports(), 1);
    assert!(harness.errors.is_fatal_in_progress());
    assert_eq!(events(&harness)[0].disposition, TrapDisposition::Escalate);
}

#[test]
fn redirect_without_context_is_not_applied() {
    let harness = Harness::new(Some(FakeThread::new(ExecState::Managed)));

    // Only rules that need no registers can match; the null check cannot.
    let handled = harness.system.handle_signal::<RegisterSnapshot>(
        SignalInfo::fault(Signal::Segv, 0x8),
        raw(Signal::Segv),
        None,
        false,
    );

    assert!(!handled);
    assert_eq!(harness.thread().saved_pc.load(Ordering::SeqCst), 0);
}

/// Re-enters the trap system from inside a chained handler, as a fault in
/// the handler itself would.
struct Reentrant {
    system: spin::Once<Weak<TrapSystem>>,
    inner_result: AtomicUsize,
}

impl ChainedHandler for Reentrant {
    fn try_handle(&self, info: &SignalInfo, raw: RawTrap) -> bool {
        let Some(system) = self.system.get().and_then(Weak::upgrade) else {
            return false;
        };
        let handled = system.handle_signal::<RegisterSnapshot>(*info, raw, None, false);
        self.inner_result.store(handled as usize + 1, Ordering::SeqCst);
        true
    }
}

#[test]
fn fault_inside_the_handler_is_not_classified_again() {
    let harness = Harness::new(None);
    let reentrant = Arc::new(Reentrant {
        system: spin::Once::new(),
        inner_result: AtomicUsize::new(0),
    });
    reentrant.system.call_once(|| Arc::downgrade(&harness.system));
    harness
        .registry
        .register(HandlerEntry {
            handler: reentrant.clone(),
            priority: 0,
            description: "reentrant",
            signal: None,
            protection_level: ProtectionLevel::Runtime,
            registrar_id: RUNTIME_REGISTRAR_ID,
            handle: HandlerHandle::next(),
        })
        .unwrap();
    let mut ctx = RegisterSnapshot::with_frame(0x4000_0000, STACK_BASE - PAGE, 0);

    let handled = harness.system.handle_signal(
        SignalInfo::fault(Signal::Segv, 0x10),
        raw(Signal::Segv),
        Some(&mut ctx),
        false,
    );

    assert!(handled);
    // The nested call escalated and, without abort, reported failure.
    assert_eq!(reentrant.inner_result.load(Ordering::SeqCst), 1);
    let log = events(&harness);
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].rule, Rule::NestedFault);
    assert_eq!(log[1].rule, Rule::Chained);
}

/// Uses the managers' handler-safe calls from inside a chained handler,
/// while dispatch holds the registry.
struct UsesManagers {
    registry: Arc<ChainedHandlerRegistry>,
    errors: Arc<FatalErrorManager>,
    completed: AtomicBool,
}

impl ChainedHandler for UsesManagers {
    fn try_handle(&self, info: &SignalInfo, raw: RawTrap) -> bool {
        let mut event = TrapEvent::EMPTY;
        event.info = *info;
        event.rule = Rule::Chained;
        self.errors.log_trap(event);
        let inner = self.registry.dispatch(&SignalInfo::new(Signal::Bus, None, None), raw);
        self.completed
            .store(!inner && !self.errors.is_fatal_in_progress(), Ordering::SeqCst);
        true
    }
}

#[test]
fn handler_safe_manager_calls_complete_inside_dispatch() {
    let harness = Harness::new(None);
    let handler = Arc::new(UsesManagers {
        registry: harness.registry.clone(),
        errors: harness.errors.clone(),
        completed: AtomicBool::new(false),
    });
    harness
        .registry
        .register(HandlerEntry {
            handler: handler.clone(),
            priority: 0,
            description: "uses managers",
            signal: Some(Signal::Pipe),
            protection_level: ProtectionLevel::Runtime,
            registrar_id: RUNTIME_REGISTRAR_ID,
            handle: HandlerHandle::next(),
        })
        .unwrap();

    assert!(harness
        .registry
        .dispatch(&SignalInfo::new(Signal::Pipe, None, None), raw(Signal::Pipe)));

    assert!(handler.completed.load(Ordering::SeqCst));
    // The blocking calls work again once dispatch has returned.
    assert_eq!(harness.registry.handler_count(Signal::Pipe), 1);
    let log = events(&harness);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].info.signal, Signal::Pipe);
}

#[test]
fn trap_log_keeps_the_most_recent_events() {
    let harness = Harness::new(None);
    for i in 0..TRAP_LOG_CAPACITY + 5 {
        let mut ctx = RegisterSnapshot::with_frame(0x4000_0000 + i * 4, 0, 0);
        harness.system.handle_signal(
            SignalInfo::new(Signal::Pipe, None, None),
            raw(Signal::Pipe),
            Some(&mut ctx),
            false,
        );
    }

    let log = events(&harness);
    assert_eq!(log.len(), TRAP_LOG_CAPACITY);
    assert_eq!(log[0].sequence, 5);
    assert_eq!(log[TRAP_LOG_CAPACITY - 1].sequence, (TRAP_LOG_CAPACITY + 4) as u64);
}

#[test]
fn api_before_initialization() {
    use crate::trap::api;

    // No test installs the global trap system.
    assert!(!crate::trap::is_initialized());

    // A failed installation withdraws the system again and may be retried.
    // Kept here since it publishes the global system for a moment.
    for _ in 0..2 {
        let harness = Harness::with_controller(test_config(), None, Box::new(FailingSignalController(libc::EINVAL)));
        let system = match Arc::try_unwrap(harness.system) {
            Ok(system) => system,
            Err(_) => panic!("trap system is shared"),
        };
        assert_eq!(
            initialize_trap_system(system).err(),
            Some(TrapApiError::InstallFailed(libc::EINVAL))
        );
        assert!(!crate::trap::is_initialized());
        assert!(crate::trap::trap_system().is_none());
    }

    assert!(api::recent_traps().is_empty());
    assert_eq!(
        api::register_chained_handler(
            CountingHandler::new(true),
            None,
            0,
            "early",
            ProtectionLevel::User,
            api::get_registrar_id(),
        ),
        Err(TrapApiError::SystemNotInitialized)
    );
    // Safety: null info and context are accepted and the system is absent.
    let handled = unsafe {
        api::vm_traps_handle_signal(libc::SIGSEGV, core::ptr::null_mut(), core::ptr::null_mut(), 0)
    };
    assert_eq!(handled, 0);
}

#[test]
fn api_error_messages_and_registrar_ids() {
    use crate::trap::api;

    assert_eq!(
        TrapApiError::InstallFailed(22).to_string(),
        "Installing the signal handler failed (errno 22)."
    );
    let first = api::get_registrar_id();
    let second = api::get_registrar_id();
    assert!(second > first);
    assert!(first > crate::trap::EMBEDDER_REGISTRAR_ID);
}
