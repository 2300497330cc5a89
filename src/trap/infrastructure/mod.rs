// vm_traps/src/trap/infrastructure/mod.rs

//! # Trap Infrastructure Module
//!
//! The signal-level plumbing, the dependency injection container, and the
//! concrete managers for chained handlers and fatal errors.

// The Dependency Injection (DI) framework.
pub mod di;

// Signal installation and the OS entry point.
pub mod low_level;

// Concrete manager implementations.
pub mod error_manager;
pub mod handler_manager;

pub use di::initialize_trap_system;
