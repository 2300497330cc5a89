// vm_traps/src/trap/ds/handler.rs

//! # Dispositions and Chained Handlers
//!
//! The result types of classification, and the registry entries for
//! handlers that get a chance at signals the runtime does not recognise.

use super::error::TrapSeverity;
use super::types::{Signal, SignalInfo};
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// What the dispatcher tells the OS to do with a signal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrapDisposition {
    /// Return from the handler and re-execute, or simply continue.
    Ignore,
    /// Resume the thread at the given stub address.
    RedirectToStub(usize),
    /// Unrecoverable; hand off to the fatal error path.
    Escalate,
}

impl TrapDisposition {
    pub fn severity(self) -> TrapSeverity {
        match self {
            TrapDisposition::Ignore => TrapSeverity::RecoverableByRetry,
            TrapDisposition::RedirectToStub(_) => TrapSeverity::RecoverableByRedirect,
            TrapDisposition::Escalate => TrapSeverity::Fatal,
        }
    }

    pub fn is_redirect(self) -> bool {
        matches!(self, TrapDisposition::RedirectToStub(_))
    }

    pub fn stub(self) -> Option<usize> {
        match self {
            TrapDisposition::RedirectToStub(stub) => Some(stub),
            _ => None,
        }
    }
}

impl fmt::Display for TrapDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapDisposition::Ignore => f.write_str("ignore"),
            TrapDisposition::RedirectToStub(stub) => write!(f, "redirect to 0x{:x}", stub),
            TrapDisposition::Escalate => f.write_str("escalate"),
        }
    }
}

/// The classification rule that produced a disposition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rule {
    BrokenPipe,
    SafeFetch,
    StackRedZone,
    ReservedStack,
    StackOverflow,
    NativeStackOverflow,
    ZombieEntry,
    SafepointPoll,
    UnsafeAccess,
    DivideByZero,
    ImplicitNull,
    RuntimeUnsafeAccess,
    FastAccessorSlowCase,
    SerializePage,
    Chained,
    Unrecognized,
    NestedFault,
}

impl Rule {
    pub fn name(self) -> &'static str {
        match self {
            Rule::BrokenPipe => "broken-pipe",
            Rule::SafeFetch => "safefetch",
            Rule::StackRedZone => "stack-red-zone",
            Rule::ReservedStack => "reserved-stack",
            Rule::StackOverflow => "stack-overflow",
            Rule::NativeStackOverflow => "native-stack-overflow",
            Rule::ZombieEntry => "zombie-entry",
            Rule::SafepointPoll => "safepoint-poll",
            Rule::UnsafeAccess => "unsafe-access",
            Rule::DivideByZero => "divide-by-zero",
            Rule::ImplicitNull => "implicit-null",
            Rule::RuntimeUnsafeAccess => "runtime-unsafe-access",
            Rule::FastAccessorSlowCase => "fast-accessor-slowcase",
            Rule::SerializePage => "serialize-page",
            Rule::Chained => "chained",
            Rule::Unrecognized => "unrecognized",
            Rule::NestedFault => "nested-fault",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The outcome of classifying one trap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Classification {
    pub rule: Rule,
    pub disposition: TrapDisposition,
}

impl Classification {
    pub const fn new(rule: Rule, disposition: TrapDisposition) -> Self {
        Self { rule, disposition }
    }
}

/// The untouched arguments of the OS signal handler, for forwarding.
/// Pointers are null when the trap was not delivered by the OS.
#[derive(Debug, Copy, Clone)]
pub struct RawTrap {
    pub signo: i32,
    pub info: *mut libc::siginfo_t,
    pub context: *mut libc::c_void,
}

impl RawTrap {
    pub const fn new(signo: i32, info: *mut libc::siginfo_t, context: *mut libc::c_void) -> Self {
        Self { signo, info, context }
    }

    /// A trap with no siginfo and no context.
    pub const fn synthetic(signo: i32) -> Self {
        Self::new(signo, core::ptr::null_mut(), core::ptr::null_mut())
    }
}

/// A handler that gets a chance at signals no classification rule claimed.
///
/// Runs inside the signal handler: implementations must be async-signal-safe.
pub trait ChainedHandler: Send + Sync {
    /// Returns `true` if the signal was handled.
    fn try_handle(&self, info: &SignalInfo, raw: RawTrap) -> bool;
}

/// Identifies the module that registered a handler.
pub type RegistrarId = u64;

/// Owner id of handlers registered by the trap system itself.
pub const RUNTIME_REGISTRAR_ID: RegistrarId = 0;

/// Owner id of handlers registered by the embedding program.
pub const EMBEDDER_REGISTRAR_ID: RegistrarId = 1;

/// Hands out owner ids above the reserved ones.
pub fn generate_registrar_id() -> RegistrarId {
    static NEXT_ID: AtomicU64 = AtomicU64::new(2);
    NEXT_ID.fetch_add(1, Ordering::SeqCst)
}

/// Who may unregister or re-own a handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtectionLevel {
    /// Only the runtime itself.
    Runtime,
    /// The runtime or the embedder.
    Embedder,
    /// The owning registrar, or the runtime.
    User,
}

/// A registered chained handler.
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn ChainedHandler>,
    /// Lower runs first.
    pub priority: u8,
    pub description: &'static str,
    /// Restricts the handler to one signal; `None` accepts all of them.
    pub signal: Option<Signal>,
    pub protection_level: ProtectionLevel,
    pub registrar_id: RegistrarId,
    pub handle: HandlerHandle,
}

impl HandlerEntry {
    pub fn accepts(&self, signal: Signal) -> bool {
        self.signal.map_or(true, |s| s == signal)
    }

    pub fn can_be_unregistered_by(&self, id: RegistrarId) -> bool {
        match self.protection_level {
            ProtectionLevel::Runtime => id == RUNTIME_REGISTRAR_ID,
            ProtectionLevel::Embedder => id == RUNTIME_REGISTRAR_ID || id == EMBEDDER_REGISTRAR_ID,
            ProtectionLevel::User => self.registrar_id == id || id == RUNTIME_REGISTRAR_ID,
        }
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("priority", &self.priority)
            .field("description", &self.description)
            .field("signal", &self.signal)
            .field("protection_level", &self.protection_level)
            .field("registrar_id", &self.registrar_id)
            .field("handle", &self.handle)
            .finish()
    }
}

/// An opaque reference to a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHandle {
    id: u64,
}

impl HandlerHandle {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}
