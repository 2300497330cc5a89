// vm_traps/src/trap/ds/mod.rs

//! # Trap Data Structures Module
//!
//! Signals and fault information, the register snapshot, dispositions,
//! chained-handler entries and the fatal trap record.

pub mod types;
pub mod context;
pub mod error;
pub mod handler;

pub use self::types::{
    ExecState, ImplicitException, Signal, SignalInfo, FPE_FLTDIV, FPE_INTDIV,
};

pub use self::context::RegisterSnapshot;

pub use self::error::{FatalTrap, TrapEvent, TrapSeverity};

pub use self::handler::{
    generate_registrar_id, ChainedHandler, Classification, HandlerEntry, HandlerHandle,
    ProtectionLevel, RawTrap, RegistrarId, Rule, TrapDisposition, EMBEDDER_REGISTRAR_ID,
    RUNTIME_REGISTRAR_ID,
};
