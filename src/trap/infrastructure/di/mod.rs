// vm_traps/src/trap/infrastructure/di/mod.rs

//! # Dependency Injection System - Global Access and Initialization
//!
//! Manages the process-wide `TrapSystem` instance the OS signal handler
//! dispatches to. A published instance is never freed, so the signal handler
//! reads it without taking a lock.

pub mod container;
pub mod traits;

pub use self::container::{TrapCollaborators, TrapSystem};

use self::traits::{HandlerManager, SignalController};
use crate::config::TrapConfig;
use crate::trap::api::TrapApiError;
use crate::trap::ds::Signal;
use crate::trap::infrastructure::{
    error_manager::FatalErrorManager, handler_manager::ChainedHandlerRegistry, low_level,
};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// The global `TrapSystem` instance, or null.
static GLOBAL_TRAP_SYSTEM: AtomicPtr<TrapSystem> = AtomicPtr::new(ptr::null_mut());

/// Flag to ensure the trap system is initialized only once.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Concrete implementation for `SignalController`.
pub struct LowLevelSignalController;

impl SignalController for LowLevelSignalController {
    fn install(&self, signals: &[Signal], handlers: &dyn HandlerManager) -> Result<(), TrapApiError> {
        low_level::install_signal_handlers(signals, handlers)
    }

    fn unblock(&self, signal: Signal) {
        low_level::unblock_signal(signal);
    }
}

/// Assembles a `TrapSystem` from the default managers.
pub fn build_trap_system(config: TrapConfig, collaborators: TrapCollaborators) -> TrapSystem {
    let handler_manager = Arc::new(ChainedHandlerRegistry::new());
    let error_manager = Arc::new(FatalErrorManager::new(
        Arc::clone(&collaborators.reporter),
        Arc::clone(&collaborators.code_ranges),
    ));
    TrapSystem::new(
        config,
        collaborators,
        handler_manager,
        error_manager,
        Box::new(LowLevelSignalController),
    )
}

/// Publishes `system` as the global trap system and installs its signal
/// handlers.
///
/// If installation fails the system is withdrawn and initialization may be
/// retried.
pub fn initialize_trap_system(system: TrapSystem) -> Result<&'static TrapSystem, TrapApiError> {
    if INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        return Err(TrapApiError::AlreadyInitialized);
    }
    // Published before installing so a signal arriving in between finds it.
    // A withdrawn system is leaked, as a handler on another thread may still
    // hold it.
    let system: &'static TrapSystem = Box::leak(Box::new(system));
    GLOBAL_TRAP_SYSTEM.store(system as *const TrapSystem as *mut TrapSystem, Ordering::Release);
    if let Err(err) = system.install() {
        GLOBAL_TRAP_SYSTEM.store(ptr::null_mut(), Ordering::Release);
        INITIALIZED.store(false, Ordering::SeqCst);
        crate::error_print!("trap system installation failed: {}", err);
        return Err(err);
    }
    crate::info_print!("trap system installed for {} signals", Signal::HANDLED.len());
    Ok(system)
}

/// The global trap system, once initialization has published it.
pub fn trap_system() -> Option<&'static TrapSystem> {
    // Safety: a non-null pointer comes from `Box::leak` and is never freed.
    unsafe { GLOBAL_TRAP_SYSTEM.load(Ordering::Acquire).as_ref() }
}

/// Runs `f` against the global `TrapSystem`.
pub fn with_trap_system<F, R>(f: F) -> Result<R, TrapApiError>
where
    F: FnOnce(&TrapSystem) -> R,
{
    trap_system().map(f).ok_or(TrapApiError::SystemNotInitialized)
}

/// Checks if the trap system has been initialized.
pub fn is_initialized() -> bool {
    trap_system().is_some()
}
