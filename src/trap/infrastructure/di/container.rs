// vm_traps/src/trap/infrastructure/di/container.rs

//! # Trap System Dependency Injection Container
//!
//! Defines the `TrapSystem` struct, which holds the classifier, the managers
//! and the runtime collaborators, and applies classifications to the
//! interrupted thread.

use super::traits::{
    CodeRanges, ContinuationResolver, ErrorManager, FastAccessorTable, FatalErrorReporter, HandlerManager,
    SafeFetchTable, SafepointMemory, SignalController, ThreadLookup, TrapThread,
};
use crate::config::TrapConfig;
use crate::context::HardwareContext;
use crate::frame::{current_stack_pointer, StackBounds};
use crate::trap::api::TrapApiError;
use crate::trap::classifier::{Classifier, TrapInput};
use crate::trap::ds::{
    Classification, FatalTrap, RawTrap, RegisterSnapshot, Rule, Signal, SignalInfo, TrapDisposition, TrapEvent,
};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};

/// The runtime services the trap system consults.
#[derive(Clone)]
pub struct TrapCollaborators {
    pub code_ranges: Arc<dyn CodeRanges>,
    pub resolver: Arc<dyn ContinuationResolver>,
    pub safefetch: Arc<dyn SafeFetchTable>,
    pub fast_accessors: Arc<dyn FastAccessorTable>,
    pub safepoint: Arc<dyn SafepointMemory>,
    pub reporter: Arc<dyn FatalErrorReporter>,
    pub threads: Arc<dyn ThreadLookup>,
}

std::thread_local! {
    /// Stack pointer of the outermost signal handler invocation active on
    /// this thread, or 0.
    static HANDLER_SP: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as inside the signal handler for its lifetime.
///
/// A handler invocation is nested only if it runs below the recorded one on
/// the stack. A record at or below the current sp belongs to an invocation
/// that never returned, e.g. a chained handler that left with `siglongjmp`,
/// and is replaced.
pub(crate) struct SignalHandlerMark {
    nested: bool,
}

impl SignalHandlerMark {
    pub(crate) fn enter() -> Self {
        let sp = current_stack_pointer();
        let nested = HANDLER_SP.with(|outer| {
            let recorded = outer.get();
            if recorded != 0 && sp < recorded {
                return true;
            }
            outer.set(sp);
            false
        });
        Self { nested }
    }

    fn is_nested(&self) -> bool {
        self.nested
    }
}

impl Drop for SignalHandlerMark {
    fn drop(&mut self) {
        if !self.nested {
            HANDLER_SP.with(|outer| outer.set(0));
        }
    }
}

pub struct TrapSystem {
    classifier: Classifier,
    handler_manager: Arc<dyn HandlerManager>,
    error_manager: Arc<dyn ErrorManager>,
    signal_controller: Box<dyn SignalController>,
    threads: Arc<dyn ThreadLookup>,
    sequence: AtomicU64,
}

impl TrapSystem {
    /// Creates a new `TrapSystem` by injecting its dependencies.
    pub fn new(
        config: TrapConfig,
        collaborators: TrapCollaborators,
        handler_manager: Arc<dyn HandlerManager>,
        error_manager: Arc<dyn ErrorManager>,
        signal_controller: Box<dyn SignalController>,
    ) -> Self {
        let classifier = Classifier::new(
            config,
            collaborators.code_ranges,
            collaborators.resolver,
            collaborators.safefetch,
            collaborators.fast_accessors,
            collaborators.safepoint,
            Arc::clone(&handler_manager),
        );
        Self {
            classifier,
            handler_manager,
            error_manager,
            signal_controller,
            threads: collaborators.threads,
            sequence: AtomicU64::new(0),
        }
    }

    /// Installs the OS signal handlers.
    pub fn install(&self) -> Result<(), TrapApiError> {
        self.signal_controller
            .install(&Signal::HANDLED, self.handler_manager.as_ref())
    }

    pub fn config(&self) -> &TrapConfig {
        self.classifier.config()
    }

    /// Classifies a trap without applying the result.
    pub fn classify(
        &self,
        info: SignalInfo,
        raw: RawTrap,
        context: &dyn HardwareContext,
        thread: Option<&dyn TrapThread>,
    ) -> Classification {
        self.classifier
            .classify(&TrapInput::new(info, raw, context, thread))
    }

    /// Handles one signal: classifies it, logs it and applies the
    /// disposition to `context`. Returns whether the signal was handled.
    ///
    /// Escalation does not return unless `abort_if_unrecognized` is false, in
    /// which case the caller gets `false` and another chance.
    pub fn handle_signal<C: HardwareContext>(
        &self,
        info: SignalInfo,
        raw: RawTrap,
        mut context: Option<&mut C>,
        abort_if_unrecognized: bool,
    ) -> bool {
        let mark = SignalHandlerMark::enter();
        let thread = self.threads.current();

        let fallback = RegisterSnapshot::new();
        let (classification, pc) = {
            let view: &dyn HardwareContext = match context.as_deref() {
                Some(ctx) => ctx,
                None => &fallback,
            };
            let classification = if mark.is_nested() {
                Classification::new(Rule::NestedFault, TrapDisposition::Escalate)
            } else if context.is_some() {
                self.classify(info, raw, view, thread)
            } else {
                // Without registers only pc-independent rules can apply.
                let info = SignalInfo::new(info.signal, info.code, None);
                self.classify(info, raw, view, None)
            };
            (classification, view.pc())
        };

        self.error_manager.log_trap(TrapEvent {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            thread_id: thread.map(|t| t.id()),
            info,
            pc,
            rule: classification.rule,
            disposition: classification.disposition,
        });

        match (classification.disposition, context.as_deref_mut()) {
            (TrapDisposition::Ignore, _) => return true,
            (TrapDisposition::RedirectToStub(stub), Some(ctx)) => {
                // A reserved-stack retry resumes at the faulting pc itself.
                if classification.rule != Rule::ReservedStack {
                    if let Some(thread) = thread {
                        thread.set_saved_exception_pc(pc);
                    }
                }
                ctx.set_pc(stub);
                return true;
            }
            _ => {}
        }

        if !abort_if_unrecognized {
            return false;
        }

        self.signal_controller.unblock(info.signal);
        let registers = match context.as_deref() {
            Some(ctx) => ctx.snapshot(),
            None => fallback,
        };
        let trap = FatalTrap {
            thread_id: thread.map(|t| t.id()),
            info,
            pc,
            rule: classification.rule,
            registers,
            stack_bounds: thread
                .and_then(|t| t.stack_guard())
                .map(|g| StackBounds::new(g.layout().stack_base, g.layout().stack_size)),
        };
        self.error_manager.escalate(&trap, raw)
    }

    pub fn handler_manager(&self) -> Arc<dyn HandlerManager> {
        Arc::clone(&self.handler_manager)
    }

    pub fn error_manager(&self) -> Arc<dyn ErrorManager> {
        Arc::clone(&self.error_manager)
    }
}
