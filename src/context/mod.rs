// vm_traps/src/context/mod.rs

//! # Hardware Context Accessor
//!
//! A narrow accessor interface over the register state the OS hands to a
//! signal handler. The platform-specific `ucontext_t` layout lives entirely in
//! [`ucontext`]; everything above this module sees only [`HardwareContext`].
//!
//! Accessors operate purely on the passed-in context. They never allocate,
//! never lock and never look at the current thread.

mod ucontext;

pub use self::ucontext::SignalContext;
pub use crate::trap::RegisterSnapshot;

/// Register access on a snapshot of a thread's state.
pub trait HardwareContext {
    fn pc(&self) -> usize;

    /// Overwrites the program counter the thread resumes at. This is the only
    /// way the trap dispatcher redirects a faulting thread.
    fn set_pc(&mut self, pc: usize);

    fn sp(&self) -> usize;

    fn fp(&self) -> usize;

    /// The link register, where the architecture has one.
    fn lr(&self) -> Option<usize>;

    /// General purpose register `index`, if the context exposes it.
    fn gpr(&self, index: usize) -> Option<usize>;

    /// Number of general purpose registers [`gpr`](Self::gpr) can return.
    fn gpr_count(&self) -> usize;

    /// Copies the context into the portable snapshot form.
    fn snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot::capture(self)
    }
}

impl<C: HardwareContext + ?Sized> HardwareContext for &mut C {
    fn pc(&self) -> usize {
        (**self).pc()
    }

    fn set_pc(&mut self, pc: usize) {
        (**self).set_pc(pc)
    }

    fn sp(&self) -> usize {
        (**self).sp()
    }

    fn fp(&self) -> usize {
        (**self).fp()
    }

    fn lr(&self) -> Option<usize> {
        (**self).lr()
    }

    fn gpr(&self, index: usize) -> Option<usize> {
        (**self).gpr(index)
    }

    fn gpr_count(&self) -> usize {
        (**self).gpr_count()
    }
}
