// vm_traps/src/guard.rs

//! # Stack Guard Zone Manager
//!
//! Each managed thread reserves three zones at the low end of its stack,
//! from the stack limit upwards:
//!
//! ```text
//!  stack_end                                                stack_base
//!  | red | yellow | reserved | ............ usable stack ........... |
//!        ^red_zone_base      ^reserved_zone_base
//!  |---- yellow-reserved ----|
//! ```
//!
//! Touching the red zone is fatal. Touching yellow or reserved starts
//! controlled stack-overflow handling; the reserved part alone is handed to
//! methods annotated as needing guaranteed stack.
//!
//! A [`StackGuardState`] is only ever mutated by the thread that owns the
//! stack. Other threads may read it for diagnostics; every field is an atomic
//! so such reads are merely possibly stale.

use crate::config::{GuardProtection, TrapConfig};
use crate::frame::StackBounds;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

/// Address arithmetic for the guard zones of one stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ZoneLayout {
    pub stack_base: usize,
    pub stack_size: usize,
    pub red_size: usize,
    pub yellow_size: usize,
    pub reserved_size: usize,
}

impl ZoneLayout {
    pub fn new(bounds: StackBounds, config: &TrapConfig) -> Self {
        Self {
            stack_base: bounds.base,
            stack_size: bounds.size,
            red_size: config.red_zone_size(),
            yellow_size: config.yellow_zone_size(),
            reserved_size: config.reserved_zone_size(),
        }
    }

    pub const fn stack_end(&self) -> usize {
        self.stack_base - self.stack_size
    }

    /// Top of the red zone.
    pub const fn red_zone_base(&self) -> usize {
        self.stack_end() + self.red_size
    }

    /// Top of the yellow zone, which is the bottom of the reserved zone.
    pub const fn yellow_zone_base(&self) -> usize {
        self.red_zone_base() + self.yellow_size
    }

    /// Top of the reserved zone and of all guard zones.
    pub const fn reserved_zone_base(&self) -> usize {
        self.yellow_zone_base() + self.reserved_size
    }

    pub const fn guard_zone_size(&self) -> usize {
        self.red_size + self.yellow_size + self.reserved_size
    }

    pub const fn on_stack(&self, addr: usize) -> bool {
        addr < self.stack_base && addr >= self.stack_end()
    }

    pub const fn in_red(&self, addr: usize) -> bool {
        addr < self.red_zone_base() && addr >= self.stack_end()
    }

    pub const fn in_yellow_reserved(&self, addr: usize) -> bool {
        addr < self.reserved_zone_base() && addr >= self.red_zone_base()
    }

    pub const fn in_reservation(&self, addr: usize) -> bool {
        addr < self.reserved_zone_base() && addr >= self.yellow_zone_base()
    }
}

/// How much of the yellow-reserved region is armed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum GuardState {
    /// Zones were never armed; the thread is not a managed thread yet.
    Unused = 0,
    /// Yellow armed, reservation consumed by an annotated method.
    ReservedDisabled = 1,
    /// Both yellow and reservation disabled by a stack overflow.
    YellowReservedDisabled = 2,
    Enabled = 3,
}

impl GuardState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => GuardState::ReservedDisabled,
            2 => GuardState::YellowReservedDisabled,
            3 => GuardState::Enabled,
            _ => GuardState::Unused,
        }
    }
}

/// A point-in-time copy of a [`StackGuardState`] for reporting.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GuardSnapshot {
    pub state: GuardState,
    pub red_enabled: bool,
    pub reservation_activation: Option<usize>,
    pub disable_count: usize,
}

/// Per-thread guard zone state.
#[derive(Debug)]
pub struct StackGuardState {
    layout: ZoneLayout,
    protection: GuardProtection,
    state: AtomicU8,
    red_enabled: AtomicBool,
    /// Zero when no reserved-stack activation is recorded.
    activation: AtomicUsize,
    disable_count: AtomicUsize,
}

impl StackGuardState {
    pub fn new(bounds: StackBounds, config: &TrapConfig) -> Self {
        Self::with_layout(ZoneLayout::new(bounds, config), config.guard_protection)
    }

    pub const fn with_layout(layout: ZoneLayout, protection: GuardProtection) -> Self {
        Self {
            layout,
            protection,
            state: AtomicU8::new(GuardState::Unused as u8),
            red_enabled: AtomicBool::new(false),
            activation: AtomicUsize::new(0),
            disable_count: AtomicUsize::new(0),
        }
    }

    pub fn layout(&self) -> &ZoneLayout {
        &self.layout
    }

    pub fn state(&self) -> GuardState {
        GuardState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: GuardState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Arms every zone. Called once the thread starts running managed code.
    pub fn arm(&self) -> bool {
        let layout = &self.layout;
        let ok = self.protect(layout.stack_end(), layout.guard_zone_size(), true);
        self.red_enabled.store(true, Ordering::Release);
        self.set_state(GuardState::Enabled);
        ok
    }

    pub fn in_red(&self, addr: usize) -> bool {
        self.layout.in_red(addr)
    }

    pub fn in_yellow_reserved(&self, addr: usize) -> bool {
        self.layout.in_yellow_reserved(addr)
    }

    pub fn in_reservation(&self, addr: usize) -> bool {
        self.layout.in_reservation(addr)
    }

    pub fn on_stack(&self, addr: usize) -> bool {
        self.layout.on_stack(addr)
    }

    pub fn is_reservation_enabled(&self) -> bool {
        self.state() == GuardState::Enabled
    }

    pub fn is_yellow_reserved_enabled(&self) -> bool {
        matches!(self.state(), GuardState::Enabled | GuardState::ReservedDisabled)
    }

    pub fn is_red_enabled(&self) -> bool {
        self.red_enabled.load(Ordering::Acquire)
    }

    /// Hands the reserved zone to an annotated method. Yellow stays armed.
    pub fn disable_reservation(&self) {
        let layout = &self.layout;
        self.protect(layout.yellow_zone_base(), layout.reserved_size, false);
        self.set_state(GuardState::ReservedDisabled);
        self.count_disable();
    }

    /// Re-arms the reserved zone after the annotated method returned.
    pub fn enable_reservation(&self) {
        let layout = &self.layout;
        self.protect(layout.yellow_zone_base(), layout.reserved_size, true);
        self.set_state(GuardState::Enabled);
    }

    /// Opens yellow and reserved so the overflow can be thrown.
    pub fn disable_yellow(&self) {
        let layout = &self.layout;
        self.protect(layout.red_zone_base(), layout.yellow_size + layout.reserved_size, false);
        self.set_state(GuardState::YellowReservedDisabled);
        self.count_disable();
    }

    pub fn disable_red(&self) {
        let layout = &self.layout;
        self.protect(layout.stack_end(), layout.red_size, false);
        self.red_enabled.store(false, Ordering::Release);
        self.count_disable();
    }

    /// Re-arms whatever an overflow episode disabled, once the stack has
    /// unwound to `current_sp`. Returns `false` if `current_sp` is still
    /// inside the guard zones.
    pub fn reguard(&self, current_sp: usize) -> bool {
        let state = self.state();
        if state != GuardState::YellowReservedDisabled && state != GuardState::ReservedDisabled {
            return true;
        }
        if current_sp <= self.layout.reserved_zone_base() {
            crate::warn_print!(
                "cannot reguard stack: sp 0x{:x} is inside the guard zones (top 0x{:x})",
                current_sp,
                self.layout.reserved_zone_base()
            );
            return false;
        }
        if state == GuardState::YellowReservedDisabled {
            let layout = &self.layout;
            self.protect(layout.red_zone_base(), layout.yellow_size + layout.reserved_size, true);
            self.set_state(GuardState::Enabled);
        } else {
            self.enable_reservation();
        }
        self.clear_reservation_activation();
        true
    }

    pub fn set_reservation_activation(&self, addr: usize) {
        self.activation.store(addr, Ordering::Release);
    }

    pub fn clear_reservation_activation(&self) {
        self.activation.store(0, Ordering::Release);
    }

    pub fn reservation_activation(&self) -> Option<usize> {
        match self.activation.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// Number of zone-disable mutations since the thread was created.
    pub fn disable_count(&self) -> usize {
        self.disable_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        GuardSnapshot {
            state: self.state(),
            red_enabled: self.is_red_enabled(),
            reservation_activation: self.reservation_activation(),
            disable_count: self.disable_count(),
        }
    }

    fn count_disable(&self) {
        self.disable_count.fetch_add(1, Ordering::Relaxed);
    }

    fn protect(&self, addr: usize, len: usize, guard: bool) -> bool {
        if self.protection == GuardProtection::Virtual || len == 0 {
            return true;
        }
        let prot = if guard {
            libc::PROT_NONE
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        // Safety: the range lies in this thread's own stack guard area,
        // which holds no Rust objects.
        let ret = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) };
        if ret != 0 {
            crate::warn_print!(
                "mprotect(0x{:x}, {}, {}) failed",
                addr,
                len,
                if guard { "none" } else { "rw" }
            );
        }
        ret == 0
    }
}
