// vm_traps/src/trap/api.rs

//! # Public API for the Trap Subsystem
//!
//! Chained handler registration, the C entry point for embedders that
//! install their own signal handlers, and diagnostic access to the trap log.

use crate::context::SignalContext;
use crate::trap::ds::{
    self, ChainedHandler, HandlerEntry, HandlerHandle, ProtectionLevel, RawTrap, RegistrarId, Signal, SignalInfo,
    TrapEvent,
};
use crate::trap::infrastructure::di::{self, with_trap_system};
use crate::trap::infrastructure::error_manager::TRAP_LOG_CAPACITY;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Errors that can occur when interacting with the Trap API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapApiError {
    SystemNotInitialized,
    AlreadyInitialized,
    DuplicateHandler,
    HandlerNotFound,
    PermissionDenied, // For ownership or protection level issues
    /// `sigaction` failed with the given errno.
    InstallFailed(i32),
}

impl core::fmt::Display for TrapApiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SystemNotInitialized => write!(f, "Trap system has not been initialized."),
            Self::AlreadyInitialized => write!(f, "Trap system has already been initialized."),
            Self::DuplicateHandler => write!(f, "A handler with this description is already registered for the signal."),
            Self::HandlerNotFound => write!(f, "The specified handler could not be found."),
            Self::PermissionDenied => write!(f, "Operation denied due to ownership or protection level."),
            Self::InstallFailed(errno) => write!(f, "Installing the signal handler failed (errno {}).", errno),
        }
    }
}

impl std::error::Error for TrapApiError {}

/// Returns a new, unique `RegistrarId` for a module.
/// Modules should obtain an ID once and use it for all their registrations.
pub fn get_registrar_id() -> RegistrarId {
    ds::generate_registrar_id()
}

/// Registers a chained handler, offered every signal no classification rule
/// claimed (and every broken-pipe class signal).
///
/// # Arguments
/// * `signal` - Restricts the handler to one signal; `None` for all.
/// * `priority` - Lower values run first.
/// * `description` - Must be unique per signal.
pub fn register_chained_handler(
    handler: Arc<dyn ChainedHandler>,
    signal: Option<Signal>,
    priority: u8,
    description: &'static str,
    protection_level: ProtectionLevel,
    registrar_id: RegistrarId,
) -> Result<HandlerHandle, TrapApiError> {
    let entry = HandlerEntry {
        handler,
        priority,
        description,
        signal,
        protection_level,
        registrar_id,
        handle: HandlerHandle::next(),
    };
    with_trap_system(|ts| ts.handler_manager().register(entry))?
}

/// Unregisters a chained handler. `requester_id` must own the handler or be
/// privileged enough for its protection level.
pub fn unregister_chained_handler(handle: HandlerHandle, requester_id: RegistrarId) -> Result<(), TrapApiError> {
    with_trap_system(|ts| ts.handler_manager().unregister(handle, requester_id))?
}

/// Transfers ownership of a registered chained handler to a new registrar.
pub fn transfer_handler_ownership(
    handle: HandlerHandle,
    current_owner_id: RegistrarId,
    new_owner_id: RegistrarId,
) -> Result<(), TrapApiError> {
    with_trap_system(|ts| {
        ts.handler_manager()
            .transfer_ownership(handle, current_owner_id, new_owner_id)
    })?
}

/// The most recent classified traps, oldest first.
pub fn recent_traps() -> Vec<TrapEvent> {
    with_trap_system(|ts| {
        let mut buffer = [TrapEvent::EMPTY; TRAP_LOG_CAPACITY];
        let count = ts.error_manager().recent_traps(&mut buffer);
        buffer[..count].to_vec()
    })
    .unwrap_or_default()
}

/// Entry point for embedders that own the process signal handlers and
/// forward faults to the trap system.
///
/// Returns 1 if the signal was handled. With `abort_if_unrecognized` set, an
/// unrecognized signal terminates the process; otherwise 0 is returned so the
/// caller can try something else. Also returns 0 before initialization.
///
/// # Safety
/// The arguments must be those passed to an `SA_SIGINFO` signal handler, and
/// the call must happen inside that handler.
#[no_mangle]
pub unsafe extern "C" fn vm_traps_handle_signal(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
    abort_if_unrecognized: libc::c_int,
) -> libc::c_int {
    let Some(system) = di::trap_system() else {
        return 0;
    };
    let sig_info = SignalInfo::from_raw(signo, info);
    let raw = RawTrap::new(signo, info, context);
    let mut uc = SignalContext::from_raw(context);
    system.handle_signal(sig_info, raw, uc.as_mut(), abort_if_unrecognized != 0) as libc::c_int
}
