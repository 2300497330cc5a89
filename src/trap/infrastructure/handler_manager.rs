// vm_traps/src/trap/infrastructure/handler_manager.rs

//! # Chained Handler Registry
//!
//! Implements the `HandlerManager` trait with a priority-ordered list behind
//! a spin `RwLock`. Registration happens outside signal context; dispatch
//! runs inside the handler and only ever tries the read lock, so a thread
//! that faults while registering cannot deadlock on itself.

use crate::trap::api::TrapApiError;
use crate::trap::ds::{HandlerEntry, HandlerHandle, RawTrap, RegistrarId, Signal, SignalInfo, RUNTIME_REGISTRAR_ID};
use crate::trap::infrastructure::di::traits::HandlerManager;
use alloc::vec::Vec;
use spin::RwLock;

/// How often dispatch retries the read lock before giving up.
const READ_ATTEMPTS: usize = 1024;

pub struct ChainedHandlerRegistry {
    /// Sorted by priority; equal priorities keep registration order.
    handlers: RwLock<Vec<HandlerEntry>>,
}

impl ChainedHandlerRegistry {
    pub const fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Descriptions of the registered handlers, in dispatch order.
    pub fn descriptions(&self) -> Vec<&'static str> {
        self.handlers.read().iter().map(|e| e.description).collect()
    }
}

impl Default for ChainedHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerManager for ChainedHandlerRegistry {
    fn register(&self, entry: HandlerEntry) -> Result<HandlerHandle, TrapApiError> {
        let mut handlers = self.handlers.write();
        if handlers
            .iter()
            .any(|e| e.description == entry.description && e.signal == entry.signal)
        {
            return Err(TrapApiError::DuplicateHandler);
        }
        let handle = entry.handle;
        let index = handlers.partition_point(|e| e.priority <= entry.priority);
        handlers.insert(index, entry);
        Ok(handle)
    }

    fn unregister(&self, handle: HandlerHandle, requester_id: RegistrarId) -> Result<(), TrapApiError> {
        let mut handlers = self.handlers.write();
        let index = handlers
            .iter()
            .position(|e| e.handle == handle)
            .ok_or(TrapApiError::HandlerNotFound)?;
        if !handlers[index].can_be_unregistered_by(requester_id) {
            return Err(TrapApiError::PermissionDenied);
        }
        handlers.remove(index);
        Ok(())
    }

    fn transfer_ownership(
        &self,
        handle: HandlerHandle,
        current_owner: RegistrarId,
        new_owner: RegistrarId,
    ) -> Result<(), TrapApiError> {
        let mut handlers = self.handlers.write();
        let entry = handlers
            .iter_mut()
            .find(|e| e.handle == handle)
            .ok_or(TrapApiError::HandlerNotFound)?;
        // The runtime can transfer any ownership. Others must be the current owner.
        if entry.registrar_id != current_owner && current_owner != RUNTIME_REGISTRAR_ID {
            return Err(TrapApiError::PermissionDenied);
        }
        entry.registrar_id = new_owner;
        Ok(())
    }

    fn dispatch(&self, info: &SignalInfo, raw: RawTrap) -> bool {
        let mut attempts = 0;
        let handlers = loop {
            if let Some(guard) = self.handlers.try_read() {
                break guard;
            }
            attempts += 1;
            if attempts == READ_ATTEMPTS {
                crate::warn_print!("chained handler registry busy; {} not forwarded", info.signal);
                return false;
            }
            core::hint::spin_loop();
        };
        handlers
            .iter()
            .filter(|e| e.accepts(info.signal))
            .any(|e| e.handler.try_handle(info, raw))
    }

    fn handler_count(&self, signal: Signal) -> usize {
        self.handlers.read().iter().filter(|e| e.accepts(signal)).count()
    }
}
