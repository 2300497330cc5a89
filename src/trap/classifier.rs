// vm_traps/src/trap/classifier.rs

//! # Trap Classifier
//!
//! Maps a signal, its fault information, the interrupted registers and the
//! faulting thread to a [`TrapDisposition`]. Classification is an ordered
//! list of rules; the first rule that returns a classification wins.
//!
//! Rules may mutate the faulting thread's guard zones and may block (the
//! serialization page rule), but never change the hardware context: applying
//! the disposition is the dispatcher's job.

use crate::config::{TrapConfig, INSTRUCTION_SIZE};
use crate::context::HardwareContext;
use crate::frame::{frame_from_context, Frame};
use crate::trap::ds::{
    Classification, ExecState, ImplicitException, RawTrap, Rule, Signal, SignalInfo, TrapDisposition,
};
use crate::trap::infrastructure::di::traits::{
    CodeRanges, ContinuationResolver, FastAccessorTable, HandlerManager, SafeFetchTable, SafepointMemory,
    TrapThread,
};
use alloc::sync::Arc;

/// Everything the rules look at.
pub struct TrapInput<'a> {
    pub info: SignalInfo,
    pub raw: RawTrap,
    pub context: &'a dyn HardwareContext,
    pub thread: Option<&'a dyn TrapThread>,
}

impl<'a> TrapInput<'a> {
    pub fn new(
        info: SignalInfo,
        raw: RawTrap,
        context: &'a dyn HardwareContext,
        thread: Option<&'a dyn TrapThread>,
    ) -> Self {
        Self {
            info,
            raw,
            context,
            thread,
        }
    }

    pub fn pc(&self) -> usize {
        self.context.pc()
    }

    fn signal(&self) -> Signal {
        self.info.signal
    }

    fn exec_state(&self) -> Option<ExecState> {
        self.thread.map(|t| t.exec_state())
    }

    /// The thread and fault address, when both are known. Rules that need
    /// them do not match without them.
    fn thread_and_address(&self) -> Option<(&'a dyn TrapThread, usize)> {
        Some((self.thread?, self.info.fault_address?))
    }
}

type RuleFn = fn(&Classifier, &TrapInput<'_>) -> Option<Classification>;

/// The collaborators the rules consult.
pub struct Classifier {
    config: TrapConfig,
    code_ranges: Arc<dyn CodeRanges>,
    resolver: Arc<dyn ContinuationResolver>,
    safefetch: Arc<dyn SafeFetchTable>,
    fast_accessors: Arc<dyn FastAccessorTable>,
    safepoint: Arc<dyn SafepointMemory>,
    handlers: Arc<dyn HandlerManager>,
}

impl Classifier {
    /// The rules in the order they are tried.
    const RULES: [(&'static str, RuleFn); 9] = [
        ("broken-pipe", Classifier::broken_pipe),
        ("safefetch", Classifier::safefetch),
        ("stack-guard", Classifier::stack_guard),
        ("managed-code", Classifier::managed_code),
        ("runtime-unsafe-access", Classifier::runtime_unsafe_access),
        ("fast-accessor-slowcase", Classifier::fast_accessor_slowcase),
        ("serialize-page", Classifier::serialize_page),
        ("chained", Classifier::chained),
        ("unrecognized", Classifier::unrecognized),
    ];

    pub fn new(
        config: TrapConfig,
        code_ranges: Arc<dyn CodeRanges>,
        resolver: Arc<dyn ContinuationResolver>,
        safefetch: Arc<dyn SafeFetchTable>,
        fast_accessors: Arc<dyn FastAccessorTable>,
        safepoint: Arc<dyn SafepointMemory>,
        handlers: Arc<dyn HandlerManager>,
    ) -> Self {
        Self {
            config,
            code_ranges,
            resolver,
            safefetch,
            fast_accessors,
            safepoint,
            handlers,
        }
    }

    pub fn config(&self) -> &TrapConfig {
        &self.config
    }

    /// Names of the rules, in evaluation order.
    pub fn rule_order() -> [&'static str; 9] {
        Self::RULES.map(|(name, _)| name)
    }

    pub fn classify(&self, input: &TrapInput<'_>) -> Classification {
        let classification = Self::RULES
            .iter()
            .find_map(|(_, rule)| rule(self, input))
            .unwrap_or(Classification::new(Rule::Unrecognized, TrapDisposition::Escalate));

        if self.config.trace_traps {
            crate::info_print!(
                "trap: {} pc=0x{:x} [{}] -> {}",
                input.info,
                input.pc(),
                classification.rule,
                classification.disposition
            );
        }
        classification
    }

    /// Pipe and file-size signals have no managed meaning: chained handlers
    /// go first, otherwise they are ignored.
    fn broken_pipe(&self, input: &TrapInput<'_>) -> Option<Classification> {
        if !input.signal().is_broken_pipe_class() {
            return None;
        }
        if self.handlers.dispatch(&input.info, input.raw) {
            crate::debug_print!("{} handled by chained handler", input.signal());
        }
        Some(Classification::new(Rule::BrokenPipe, TrapDisposition::Ignore))
    }

    fn safefetch(&self, input: &TrapInput<'_>) -> Option<Classification> {
        let stub = self.safefetch.continuation(input.pc())?;
        Some(Classification::new(Rule::SafeFetch, TrapDisposition::RedirectToStub(stub)))
    }

    /// Stack overflow in all its variations.
    fn stack_guard(&self, input: &TrapInput<'_>) -> Option<Classification> {
        if input.signal() != Signal::Segv {
            return None;
        }
        let (thread, addr) = input.thread_and_address()?;
        let guard = thread.stack_guard()?;
        // Kernel guard pages sit above ours; lower the address past them.
        let addr = addr.saturating_sub(self.config.kernel_guard_pages * self.config.page_size);
        if !guard.on_stack(addr) {
            return None;
        }
        let pc = input.pc();

        if guard.in_yellow_reserved(addr) {
            if thread.exec_state() != ExecState::Managed {
                // Runtime or native code: return and let it finish with the
                // extra room.
                guard.disable_yellow();
                return Some(Classification::new(Rule::NativeStackOverflow, TrapDisposition::Ignore));
            }

            if guard.in_reservation(addr) && guard.is_reservation_enabled() {
                let activation = self
                    .frame_at_stack_banging_point(input.context)
                    .and_then(|fr| self.resolver.reserved_stack_activation(thread, &fr));
                if let Some(activation) = activation {
                    guard.disable_reservation();
                    guard.set_reservation_activation(activation.address());
                    crate::debug_print!(
                        "reserved stack activation at 0x{:x} for pc 0x{:x}",
                        activation.address(),
                        pc
                    );
                    // Retry the faulting instruction with the reserved zone open.
                    return Some(Classification::new(Rule::ReservedStack, TrapDisposition::RedirectToStub(pc)));
                }
            }

            // Guard pages are re-armed while unwinding.
            guard.disable_yellow();
            let stub = self
                .resolver
                .implicit_exception(thread, pc, ImplicitException::StackOverflow)?;
            return Some(Classification::new(Rule::StackOverflow, TrapDisposition::RedirectToStub(stub)));
        }

        if guard.in_red(addr) {
            guard.disable_red();
            crate::error_print!("An irrecoverable stack overflow has occurred.");
            // A likely cause, but hard to verify.
            crate::error_print!(
                "Please check if any of your loaded .so files has enabled executable stack (see man page execstack(8))"
            );
            return Some(Classification::new(Rule::StackRedZone, TrapDisposition::Escalate));
        }
        None
    }

    /// The managed frame that was executing the stack bang. Compiled code
    /// bangs before saving the link register, so sp and fp still belong to
    /// the caller and lr holds the return address.
    pub fn frame_at_stack_banging_point(&self, context: &dyn HardwareContext) -> Option<Frame> {
        let pc = context.pc();
        if self.code_ranges.in_interpreter(pc) {
            return Some(frame_from_context(Some(context)));
        }
        let method = self.code_ranges.compiled_method_at(pc)?;
        if method.frame_complete {
            return None;
        }
        let lr = context.lr()?;
        Some(Frame::new(context.sp(), context.fp(), lr.wrapping_sub(INSTRUCTION_SIZE)))
    }

    /// Faults in managed code that stand for managed-language semantics.
    fn managed_code(&self, input: &TrapInput<'_>) -> Option<Classification> {
        if input.exec_state() != Some(ExecState::Managed) {
            return None;
        }
        let (thread, addr) = input.thread_and_address()?;
        let pc = input.pc();
        let redirect = |rule, stub| Some(Classification::new(rule, TrapDisposition::RedirectToStub(stub)));

        match input.signal() {
            Signal::Ill | Signal::Trap if self.code_ranges.is_zombie_entry(pc) => {
                redirect(Rule::ZombieEntry, self.resolver.wrong_method_stub())
            }
            Signal::Segv if self.safepoint.is_poll_address(addr) => {
                redirect(Rule::SafepointPoll, self.resolver.poll_stub(pc)?)
            }
            Signal::Bus => {
                let method = self.code_ranges.compiled_method_at(pc)?;
                if !method.has_unsafe_access {
                    return None;
                }
                redirect(
                    Rule::UnsafeAccess,
                    self.resolver.unsafe_access(thread, pc + INSTRUCTION_SIZE),
                )
            }
            Signal::Fpe if input.info.is_divide_by_zero() => redirect(
                Rule::DivideByZero,
                self.resolver
                    .implicit_exception(thread, pc, ImplicitException::DivideByZero)?,
            ),
            Signal::Segv if !self.config.needs_explicit_null_check(addr) => redirect(
                Rule::ImplicitNull,
                self.resolver.implicit_exception(thread, pc, ImplicitException::Null)?,
            ),
            _ => None,
        }
    }

    fn runtime_unsafe_access(&self, input: &TrapInput<'_>) -> Option<Classification> {
        let (thread, _) = input.thread_and_address()?;
        if input.signal() != Signal::Bus || thread.exec_state() != ExecState::Runtime || !thread.doing_unsafe_access() {
            return None;
        }
        let stub = self.resolver.unsafe_access(thread, input.pc() + INSTRUCTION_SIZE);
        Some(Classification::new(Rule::RuntimeUnsafeAccess, TrapDisposition::RedirectToStub(stub)))
    }

    /// Fast field accessors can fault if the heap shrinks under them.
    fn fast_accessor_slowcase(&self, input: &TrapInput<'_>) -> Option<Classification> {
        input.thread_and_address()?;
        if !matches!(input.signal(), Signal::Segv | Signal::Bus) {
            return None;
        }
        let stub = self.fast_accessors.slowcase_entry(input.pc())?;
        Some(Classification::new(Rule::FastAccessorSlowCase, TrapDisposition::RedirectToStub(stub)))
    }

    /// The safepoint protocol briefly write-protects the serialization page;
    /// wait for it to be writable and retry.
    fn serialize_page(&self, input: &TrapInput<'_>) -> Option<Classification> {
        let (_, addr) = input.thread_and_address()?;
        if input.signal() != Signal::Segv || !self.safepoint.is_serialize_page(addr) {
            return None;
        }
        self.safepoint.block_on_serialize_page_trap();
        Some(Classification::new(Rule::SerializePage, TrapDisposition::Ignore))
    }

    fn chained(&self, input: &TrapInput<'_>) -> Option<Classification> {
        self.handlers
            .dispatch(&input.info, input.raw)
            .then_some(Classification::new(Rule::Chained, TrapDisposition::Ignore))
    }

    fn unrecognized(&self, _input: &TrapInput<'_>) -> Option<Classification> {
        Some(Classification::new(Rule::Unrecognized, TrapDisposition::Escalate))
    }
}
