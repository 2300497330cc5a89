// vm_traps/src/trap/mod.rs

//! # Trap Classification and Dispatch Subsystem
//!
//! Turns synchronous hardware faults into managed-language control flow:
//! each fault is classified against the faulting thread's state and the
//! runtime's code ranges, then ignored, redirected to a recovery stub, or
//! escalated to fatal error reporting.

pub mod api;
pub mod classifier;
pub mod collections;
pub mod ds;
pub mod infrastructure;

// Publicly re-export the entire API module.
pub use self::api::*;

pub use self::classifier::{Classifier, TrapInput};

// Re-export key data structures that users of the API might need directly.
pub use self::ds::{
    ChainedHandler, Classification, ExecState, FatalTrap, HandlerHandle, ImplicitException, ProtectionLevel,
    RawTrap, RegisterSnapshot, RegistrarId, Rule, Signal, SignalInfo, TrapDisposition, TrapEvent, TrapSeverity,
    EMBEDDER_REGISTRAR_ID, RUNTIME_REGISTRAR_ID,
};

pub use self::infrastructure::di::traits::{
    CodeRanges, CompiledMethodInfo, ContinuationResolver, FastAccessorTable, FatalErrorReporter, SafeFetchTable,
    SafepointMemory, ReservedActivation, ThreadLookup, TrapThread,
};
pub use self::infrastructure::di::{build_trap_system, is_initialized, trap_system, TrapCollaborators, TrapSystem};

use crate::config::TrapConfig;

/// Builds the trap system from `collaborators` and installs its signal
/// handlers.
///
/// Must be called once, before any managed code runs. A second call fails
/// with [`TrapApiError::AlreadyInitialized`].
pub fn init(config: TrapConfig, collaborators: TrapCollaborators) -> Result<&'static TrapSystem, TrapApiError> {
    infrastructure::initialize_trap_system(build_trap_system(config, collaborators))
}
