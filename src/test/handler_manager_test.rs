// vm_traps/src/test/handler_manager_test.rs

use super::CountingHandler;
use crate::trap::ds::{
    HandlerEntry, HandlerHandle, ProtectionLevel, RawTrap, RegistrarId, Signal, SignalInfo, EMBEDDER_REGISTRAR_ID,
    RUNTIME_REGISTRAR_ID,
};
use crate::trap::infrastructure::di::traits::HandlerManager;
use crate::trap::infrastructure::handler_manager::ChainedHandlerRegistry;
use crate::trap::infrastructure::low_level::{install_signal_handlers, PreviousAction};
use crate::trap::{ChainedHandler, TrapApiError};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

const USER_ID: RegistrarId = 40;
const OTHER_USER_ID: RegistrarId = 41;

fn entry(
    handler: Arc<dyn ChainedHandler>,
    priority: u8,
    description: &'static str,
    signal: Option<Signal>,
    protection_level: ProtectionLevel,
    registrar_id: RegistrarId,
) -> HandlerEntry {
    HandlerEntry {
        handler,
        priority,
        description,
        signal,
        protection_level,
        registrar_id,
        handle: HandlerHandle::next(),
    }
}

fn user_entry(priority: u8, description: &'static str) -> HandlerEntry {
    entry(CountingHandler::new(false), priority, description, None, ProtectionLevel::User, USER_ID)
}

fn segv() -> SignalInfo {
    SignalInfo::fault(Signal::Segv, 0x10)
}

#[test]
fn handlers_run_in_priority_order() {
    let registry = ChainedHandlerRegistry::new();
    registry.register(user_entry(10, "b")).unwrap();
    registry.register(user_entry(5, "a")).unwrap();
    registry.register(user_entry(10, "c")).unwrap();
    assert_eq!(registry.descriptions(), ["a", "b", "c"]);
}

#[test]
fn duplicate_description_per_signal_is_rejected() {
    let registry = ChainedHandlerRegistry::new();
    let handler = CountingHandler::new(false);
    let pipe = entry(handler.clone(), 1, "logger", Some(Signal::Pipe), ProtectionLevel::User, USER_ID);
    let again = entry(handler.clone(), 2, "logger", Some(Signal::Pipe), ProtectionLevel::User, USER_ID);
    let bus = entry(handler, 1, "logger", Some(Signal::Bus), ProtectionLevel::User, USER_ID);

    registry.register(pipe).unwrap();
    assert_eq!(registry.register(again), Err(TrapApiError::DuplicateHandler));
    assert!(registry.register(bus).is_ok());
    assert_eq!(registry.handler_count(Signal::Pipe), 1);
    assert_eq!(registry.handler_count(Signal::Segv), 0);
}

#[test]
fn dispatch_stops_at_the_first_handler_that_handles() {
    let registry = ChainedHandlerRegistry::new();
    let declines = CountingHandler::new(false);
    let handles = CountingHandler::new(true);
    let never = CountingHandler::new(true);
    let bus_only = CountingHandler::new(true);
    registry
        .register(entry(declines.clone(), 0, "declines", None, ProtectionLevel::User, USER_ID))
        .unwrap();
    registry
        .register(entry(bus_only.clone(), 0, "bus only", Some(Signal::Bus), ProtectionLevel::User, USER_ID))
        .unwrap();
    registry
        .register(entry(handles.clone(), 1, "handles", None, ProtectionLevel::User, USER_ID))
        .unwrap();
    registry
        .register(entry(never.clone(), 2, "never", None, ProtectionLevel::User, USER_ID))
        .unwrap();

    assert!(registry.dispatch(&segv(), RawTrap::synthetic(libc::SIGSEGV)));
    assert_eq!(declines.calls(), 1);
    assert_eq!(bus_only.calls(), 0);
    assert_eq!(handles.calls(), 1);
    assert_eq!(never.calls(), 0);
}

#[test]
fn dispatch_without_takers_is_unhandled() {
    let registry = ChainedHandlerRegistry::new();
    assert!(!registry.dispatch(&segv(), RawTrap::synthetic(libc::SIGSEGV)));
    registry.register(user_entry(0, "declines")).unwrap();
    assert!(!registry.dispatch(&segv(), RawTrap::synthetic(libc::SIGSEGV)));
}

#[test]
fn unregister_checks_protection_level() {
    let registry = ChainedHandlerRegistry::new();
    let runtime = registry
        .register(entry(CountingHandler::new(false), 0, "runtime", None, ProtectionLevel::Runtime, RUNTIME_REGISTRAR_ID))
        .unwrap();
    let embedder = registry
        .register(entry(CountingHandler::new(false), 0, "embedder", None, ProtectionLevel::Embedder, EMBEDDER_REGISTRAR_ID))
        .unwrap();
    let user = registry.register(user_entry(0, "user")).unwrap();

    assert_eq!(registry.unregister(runtime, EMBEDDER_REGISTRAR_ID), Err(TrapApiError::PermissionDenied));
    assert_eq!(registry.unregister(embedder, USER_ID), Err(TrapApiError::PermissionDenied));
    assert_eq!(registry.unregister(user, OTHER_USER_ID), Err(TrapApiError::PermissionDenied));

    assert_eq!(registry.unregister(user, USER_ID), Ok(()));
    assert_eq!(registry.unregister(embedder, EMBEDDER_REGISTRAR_ID), Ok(()));
    assert_eq!(registry.unregister(runtime, RUNTIME_REGISTRAR_ID), Ok(()));
    assert_eq!(registry.unregister(runtime, RUNTIME_REGISTRAR_ID), Err(TrapApiError::HandlerNotFound));
    assert!(registry.descriptions().is_empty());
}

#[test]
fn ownership_transfer_moves_unregister_rights() {
    let registry = ChainedHandlerRegistry::new();
    let handle = registry.register(user_entry(0, "user")).unwrap();

    assert_eq!(
        registry.transfer_ownership(handle, OTHER_USER_ID, OTHER_USER_ID),
        Err(TrapApiError::PermissionDenied)
    );
    registry.transfer_ownership(handle, USER_ID, OTHER_USER_ID).unwrap();
    assert_eq!(registry.unregister(handle, USER_ID), Err(TrapApiError::PermissionDenied));

    // The runtime may re-own anything.
    registry
        .transfer_ownership(handle, RUNTIME_REGISTRAR_ID, USER_ID)
        .unwrap();
    assert_eq!(registry.unregister(handle, USER_ID), Ok(()));
}

fn sigaction_with(handler: usize, flags: libc::c_int) -> libc::sigaction {
    // Safety: sigaction is plain old data; the mask is initialised below.
    let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
    // Safety: sa_mask is a valid sigset_t.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    action.sa_sigaction = handler;
    action.sa_flags = flags as _;
    action
}

#[test]
fn previous_default_and_ignore_actions() {
    let info = SignalInfo::new(Signal::Pipe, None, None);

    let ignore = PreviousAction::new(Signal::Pipe, &sigaction_with(libc::SIG_IGN, 0));
    assert!(ignore.try_handle(&info, RawTrap::synthetic(libc::SIGPIPE)));

    let default = PreviousAction::new(Signal::Pipe, &sigaction_with(libc::SIG_DFL, 0));
    assert!(default.is_default());
    assert!(!default.try_handle(&info, RawTrap::synthetic(libc::SIGPIPE)));
}

static SIGINFO_CALLS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn counting_action(_signo: libc::c_int, _info: *mut libc::siginfo_t, _context: *mut libc::c_void) {
    SIGINFO_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn previous_one_shot_action_runs_once() {
    let info = SignalInfo::new(Signal::Xfsz, None, None);
    let action = sigaction_with(
        counting_action as usize,
        libc::SA_SIGINFO | libc::SA_RESETHAND,
    );
    let previous = PreviousAction::new(Signal::Xfsz, &action);

    assert!(previous.try_handle(&info, RawTrap::synthetic(libc::SIGXFSZ)));
    assert_eq!(SIGINFO_CALLS.load(Ordering::SeqCst), 1);
    assert!(previous.is_default());
    assert!(!previous.try_handle(&info, RawTrap::synthetic(libc::SIGXFSZ)));
    assert_eq!(SIGINFO_CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_install_restores_replaced_actions() {
    let registry = ChainedHandlerRegistry::new();
    let ignore = sigaction_with(libc::SIG_IGN, 0);
    // Safety: both structs are initialised; SIGXFSZ is not raised by the tests.
    let mut original: libc::sigaction = unsafe { core::mem::zeroed() };
    unsafe { libc::sigaction(libc::SIGXFSZ, &ignore, &mut original) };

    let result = install_signal_handlers(&[Signal::Xfsz, Signal::Other(-1)], &registry);

    // Safety: as above.
    let mut current: libc::sigaction = unsafe { core::mem::zeroed() };
    unsafe { libc::sigaction(libc::SIGXFSZ, &original, &mut current) };
    assert_eq!(result, Err(TrapApiError::InstallFailed(libc::EINVAL)));
    assert_eq!(current.sa_sigaction, libc::SIG_IGN);
    assert_eq!(registry.handler_count(Signal::Xfsz), 0);
}
