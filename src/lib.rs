// vm_traps/src/lib.rs

//! Hardware trap handling for a managed-language runtime.
//!
//! Probes the CPU once at startup, carves guard zones out of each managed
//! thread's stack, and installs signal handlers that classify segmentation
//! faults, bus errors, illegal instructions and arithmetic traps into
//! implicit exceptions, safepoint stops, stack overflow recovery, or fatal
//! error reports.

extern crate alloc;

// Macros must be defined before the modules that use them.
pub mod console;

pub mod config;
pub mod context;
pub mod cpu;
pub mod frame;
pub mod guard;
pub mod trap;

#[cfg(test)]
mod test;

pub use config::TrapConfig;
pub use trap::{TrapApiError, TrapCollaborators, TrapSystem};

/// Initializes the crate: logging, the CPU feature probe and the trap
/// system, in that order.
pub fn init(config: TrapConfig, collaborators: TrapCollaborators) -> Result<&'static TrapSystem, TrapApiError> {
    console::init(config.log_level);

    let features = cpu::initialize();
    info_print!("CPU: {}", features);
    debug_print!(
        "icache line {} bytes, dcache line {} bytes, zva {:?}",
        features.icache_line_size,
        features.dcache_line_size,
        cpu::zero_fill_length()
    );

    let system = trap::init(config, collaborators)?;
    info_print!(
        "trap subsystem initialized (page size {}, guard zone {} bytes)",
        config.page_size,
        config.guard_zone_size()
    );
    Ok(system)
}
