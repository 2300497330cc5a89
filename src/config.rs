// vm_traps/src/config.rs

//! Global constants and the runtime trap configuration.

use crate::console::Level;

pub const K: usize = 1024;
pub const M: usize = K * K;

/// Size of a machine word in bytes.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Every AArch64 instruction, including calls, is one 32-bit word.
pub const INSTRUCTION_SIZE: usize = 4;

pub const DEFAULT_PAGE_SIZE: usize = 4 * K;

pub const STACK_RED_PAGES: usize = 1;
pub const STACK_YELLOW_PAGES: usize = 2;
pub const STACK_RESERVED_PAGES: usize = 1;

/// Word offset from fp of the interpreter's initial expression stack pointer.
pub const INTERPRETER_FRAME_INITIAL_SP_OFFSET: isize = -9;

/// Kinds of threads the runtime creates, for stack sizing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadType {
    Managed,
    Compiler,
    RuntimeInternal,
}

/// Minimum usable stack size needed to reach user code; guard zones are
/// added on top of this.
pub const fn min_stack_allowed(thread_type: ThreadType) -> usize {
    match thread_type {
        ThreadType::Managed | ThreadType::Compiler | ThreadType::RuntimeInternal => 72 * K,
    }
}

/// Default stack size for a new thread of the given type.
pub const fn default_stack_size(thread_type: ThreadType) -> usize {
    match thread_type {
        ThreadType::Compiler => 4 * M,
        ThreadType::Managed | ThreadType::RuntimeInternal => M,
    }
}

/// How guard-zone state changes are reflected in memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GuardProtection {
    /// Zone pages are protected and unprotected with `mprotect`.
    Mprotect,
    /// Only the zone state is tracked; page permissions are left alone.
    Virtual,
}

/// Runtime configuration for trap classification.
#[derive(Debug, Copy, Clone)]
pub struct TrapConfig {
    pub page_size: usize,
    pub red_pages: usize,
    pub yellow_pages: usize,
    pub reserved_pages: usize,
    /// Print a line for every trap that is classified.
    pub trace_traps: bool,
    /// Kernel-placed guard pages above the runtime's own guard zones. Fault
    /// addresses are lowered by this many pages before zone tests.
    pub kernel_guard_pages: usize,
    /// Base of the compressed-reference heap, if references are encoded
    /// relative to a non-null base.
    pub heap_base: Option<usize>,
    pub guard_protection: GuardProtection,
    pub log_level: Level,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            red_pages: STACK_RED_PAGES,
            yellow_pages: STACK_YELLOW_PAGES,
            reserved_pages: STACK_RESERVED_PAGES,
            trace_traps: false,
            kernel_guard_pages: 0,
            heap_base: None,
            guard_protection: GuardProtection::Mprotect,
            log_level: Level::from_build_env(),
        }
    }
}

impl TrapConfig {
    /// Builds a configuration from the defaults and the running system.
    pub fn detect() -> Self {
        Self {
            page_size: os_page_size(),
            kernel_guard_pages: kernel_stack_guard_pages(),
            ..Self::default()
        }
    }

    pub fn red_zone_size(&self) -> usize {
        self.red_pages * self.page_size
    }

    pub fn yellow_zone_size(&self) -> usize {
        self.yellow_pages * self.page_size
    }

    pub fn reserved_zone_size(&self) -> usize {
        self.reserved_pages * self.page_size
    }

    /// Total bytes of guard zones at the end of each managed thread stack.
    pub fn guard_zone_size(&self) -> usize {
        self.red_zone_size() + self.yellow_zone_size() + self.reserved_zone_size()
    }

    /// Whether a fault at `offset` must have been preceded by an explicit null
    /// check, i.e. whether it can *not* be an implicit null dereference.
    ///
    /// Dereferences of null plus a small field offset land in the first page.
    /// With a non-null heap base, the page right after the base plays the same
    /// role for compressed references.
    pub fn needs_explicit_null_check(&self, offset: usize) -> bool {
        let mut offset = offset;
        if let Some(base) = self.heap_base {
            if offset >= base {
                offset -= base;
            }
        }
        (offset as isize) < 0 || self.page_size <= offset
    }
}

/// The VM page size reported by the OS.
pub fn os_page_size() -> usize {
    // Safety: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

/// Number of guard pages the kernel places above a thread stack's usable
/// range. Only FreeBSD does this, and only while the stack gap is enabled.
#[cfg(target_os = "freebsd")]
pub fn kernel_stack_guard_pages() -> usize {
    const PROC_STACKGAP_STATUS: libc::c_int = 18;
    const PROC_STACKGAP_DISABLE: libc::c_int = 0x0002;

    let mut status: libc::c_int = 0;
    // Safety: status is a valid out-pointer for this procctl command.
    let ret = unsafe {
        libc::procctl(
            libc::P_PID,
            libc::getpid() as libc::id_t,
            PROC_STACKGAP_STATUS,
            (&mut status as *mut libc::c_int).cast(),
        )
    };
    if ret != -1 && status & PROC_STACKGAP_DISABLE != 0 {
        return 0;
    }

    let mut guard_pages: libc::c_int = 0;
    let mut size = core::mem::size_of::<libc::c_int>();
    // Safety: name is NUL-terminated and the out-buffer matches `size`.
    let ret = unsafe {
        libc::sysctlbyname(
            b"security.bsd.stack_guard_page\0".as_ptr().cast(),
            (&mut guard_pages as *mut libc::c_int).cast(),
            &mut size,
            core::ptr::null(),
            0,
        )
    };
    if ret == 0 && guard_pages > 0 {
        guard_pages as usize
    } else {
        0
    }
}

#[cfg(not(target_os = "freebsd"))]
pub fn kernel_stack_guard_pages() -> usize {
    0
}
