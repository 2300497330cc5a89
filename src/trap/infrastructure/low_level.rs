// vm_traps/src/trap/infrastructure/low_level.rs

//! # Low-Level Signal Control
//!
//! Installs the process-wide `sigaction` handlers, keeps the actions they
//! replace as chained handlers, and provides the `extern "C"` entry point
//! the kernel calls on a fault.

use crate::trap::api::TrapApiError;
use crate::trap::ds::{
    ChainedHandler, HandlerEntry, HandlerHandle, ProtectionLevel, RawTrap, Signal, SignalInfo,
    RUNTIME_REGISTRAR_ID,
};
use crate::trap::infrastructure::di::traits::HandlerManager;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Priority of the replaced OS actions: after every explicitly registered
/// handler.
pub const PREVIOUS_ACTION_PRIORITY: u8 = u8::MAX;

/// The action that was installed for a signal before ours.
pub struct PreviousAction {
    signal: Signal,
    /// Handler address; cleared to `SIG_DFL` after one call if the action
    /// asked for `SA_RESETHAND`.
    handler: AtomicUsize,
    flags: libc::c_int,
    mask: libc::sigset_t,
}

// Safety: sigset_t is a plain bit set that is never mutated after creation.
unsafe impl Sync for PreviousAction {}
unsafe impl Send for PreviousAction {}

impl PreviousAction {
    pub fn new(signal: Signal, action: &libc::sigaction) -> Self {
        Self {
            signal,
            handler: AtomicUsize::new(action.sa_sigaction),
            flags: action.sa_flags as libc::c_int,
            mask: action.sa_mask,
        }
    }

    pub fn is_default(&self) -> bool {
        self.handler.load(Ordering::Relaxed) == libc::SIG_DFL
    }
}

impl ChainedHandler for PreviousAction {
    fn try_handle(&self, info: &SignalInfo, raw: RawTrap) -> bool {
        let handler = self.handler.load(Ordering::Relaxed);
        if handler == libc::SIG_DFL {
            return false;
        }
        if handler == libc::SIG_IGN {
            return true;
        }

        let signo = self.signal.raw();
        let mut mask = self.mask;
        // Safety: every sigset_t here is a valid, initialised set, and
        // `handler` was installed by the program for exactly this signal.
        unsafe {
            if self.flags & libc::SA_NODEFER == 0 {
                libc::sigaddset(&mut mask, signo);
            }
            if self.flags & libc::SA_RESETHAND != 0 {
                self.handler.store(libc::SIG_DFL, Ordering::Relaxed);
            }

            let mut old_mask: libc::sigset_t = core::mem::zeroed();
            libc::pthread_sigmask(libc::SIG_SETMASK, &mask, &mut old_mask);
            if self.flags & libc::SA_SIGINFO != 0 {
                let action: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    core::mem::transmute(handler);
                action(signo, raw.info, raw.context);
            } else {
                let action: extern "C" fn(libc::c_int) = core::mem::transmute(handler);
                action(signo);
            }
            libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, core::ptr::null_mut());
        }
        crate::debug_print!("{} forwarded to previous handler ({})", self.signal, info);
        true
    }
}

/// A replaced action and the chained handler registered for it.
type Replaced = (libc::c_int, libc::sigaction, Option<HandlerHandle>);

/// Installs [`signal_entry`] for each of `signals`. Replaced actions other
/// than `SIG_DFL` are registered with `handlers` as the lowest-priority
/// chained handlers.
///
/// On failure every action already replaced is restored and its chained
/// handler unregistered, leaving the process as it was.
pub fn install_signal_handlers(signals: &[Signal], handlers: &dyn HandlerManager) -> Result<(), TrapApiError> {
    let mut installed: Vec<Replaced> = Vec::with_capacity(signals.len());
    for &signal in signals {
        if let Err(err) = install_one(signal, handlers, &mut installed) {
            rollback(&installed, handlers);
            return Err(err);
        }
    }
    Ok(())
}

fn install_one(
    signal: Signal,
    handlers: &dyn HandlerManager,
    installed: &mut Vec<Replaced>,
) -> Result<(), TrapApiError> {
    let signo = signal.raw();
    // Safety: both sigaction structs are fully initialised before the
    // kernel reads them.
    let old = unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        libc::sigfillset(&mut action.sa_mask);
        for error_signal in Signal::HANDLED.iter().filter(|s| s.is_error_signal()) {
            libc::sigdelset(&mut action.sa_mask, error_signal.raw());
        }
        action.sa_sigaction = signal_entry as usize;
        action.sa_flags = (libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_ONSTACK) as _;

        let mut old: libc::sigaction = core::mem::zeroed();
        if libc::sigaction(signo, &action, &mut old) != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            crate::error_print!("sigaction({}) failed: errno {}", signal, errno);
            return Err(TrapApiError::InstallFailed(errno));
        }
        old
    };
    installed.push((signo, old, None));

    if old.sa_sigaction == signal_entry as usize || old.sa_sigaction == libc::SIG_DFL {
        return Ok(());
    }
    crate::info_print!("{}: chaining to previously installed handler 0x{:x}", signal, old.sa_sigaction);
    let handle = handlers.register(HandlerEntry {
        handler: Arc::new(PreviousAction::new(signal, &old)),
        priority: PREVIOUS_ACTION_PRIORITY,
        description: "previous sigaction",
        signal: Some(signal),
        protection_level: ProtectionLevel::Runtime,
        registrar_id: RUNTIME_REGISTRAR_ID,
        handle: HandlerHandle::next(),
    })?;
    if let Some(last) = installed.last_mut() {
        last.2 = Some(handle);
    }
    Ok(())
}

fn rollback(installed: &[Replaced], handlers: &dyn HandlerManager) {
    for (signo, old, handle) in installed.iter().rev() {
        // Safety: `old` is the action the kernel handed back for `signo`.
        unsafe {
            libc::sigaction(*signo, old, core::ptr::null_mut());
        }
        if let Some(handle) = handle {
            let _ = handlers.unregister(*handle, RUNTIME_REGISTRAR_ID);
        }
    }
    crate::warn_print!("signal handler installation rolled back for {} signals", installed.len());
}

/// Unblocks `signal` for the calling thread, so a fault during fatal error
/// reporting is delivered instead of hanging the thread.
pub fn unblock_signal(signal: Signal) {
    // Safety: the set is initialised by sigemptyset before use.
    unsafe {
        let mut set: libc::sigset_t = core::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal.raw());
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, core::ptr::null_mut());
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        unsafe fn errno_location() -> *mut libc::c_int { libc::__errno_location() }
    } else if #[cfg(any(target_os = "macos", target_os = "freebsd"))] {
        unsafe fn errno_location() -> *mut libc::c_int { libc::__error() }
    } else if #[cfg(target_os = "openbsd")] {
        unsafe fn errno_location() -> *mut libc::c_int { libc::__errno() }
    }
}

/// Restores the default action for `signo`. The faulting instruction then
/// re-executes and the OS terminates the process.
fn reset_to_default(signo: libc::c_int) {
    // Safety: the action is fully initialised before the kernel reads it.
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(signo, &action, core::ptr::null_mut());
    }
}

/// The `SA_SIGINFO` handler installed for every trap signal. Preserves
/// `errno` for the interrupted code.
pub extern "C" fn signal_entry(signo: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    // Safety: errno_location returns this thread's errno slot, and the
    // arguments are the kernel's.
    unsafe {
        let saved_errno = *errno_location();
        if crate::trap::api::vm_traps_handle_signal(signo, info, context, 1) == 0 {
            reset_to_default(signo);
        }
        *errno_location() = saved_errno;
    }
}
