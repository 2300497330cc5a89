// vm_traps/src/frame.rs

//! # Frame Reconstructor
//!
//! Portable `(sp, fp, pc)` frames built from a hardware context or by walking
//! the native frame-pointer chain. A frame record is two words: the caller's
//! frame pointer followed by the return address.

use crate::config::WORD_SIZE;
use crate::context::HardwareContext;
use core::fmt;

/// A reconstructed stack frame. Frames order by stack pointer, so on a
/// downward-growing stack a caller compares greater than its callees.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame {
    pub sp: usize,
    pub fp: usize,
    pub pc: usize,
}

impl Frame {
    pub const fn new(sp: usize, fp: usize, pc: usize) -> Self {
        Self { sp, fp, pc }
    }

    /// The sentinel returned past the outermost native frame.
    pub const fn empty() -> Self {
        Self { sp: 0, fp: 0, pc: 0 }
    }

    pub const fn is_empty(&self) -> bool {
        self.sp == 0 && self.fp == 0 && self.pc == 0
    }

    /// The saved caller frame pointer.
    ///
    /// # Safety
    /// `fp` must point to a readable frame record.
    pub unsafe fn link(&self) -> usize {
        *(self.fp as *const usize)
    }

    /// The saved return address.
    ///
    /// # Safety
    /// `fp` must point to a readable frame record.
    pub unsafe fn sender_pc(&self) -> usize {
        *((self.fp + WORD_SIZE) as *const usize)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[sp=0x{:x} fp=0x{:x} pc=0x{:x}]", self.sp, self.fp, self.pc)
    }
}

/// Builds the frame the context was interrupted in. A missing context gives
/// the empty frame.
pub fn frame_from_context<C: HardwareContext + ?Sized>(context: Option<&C>) -> Frame {
    match context {
        Some(context) => Frame::new(context.sp(), context.fp(), context.pc()),
        None => Frame::empty(),
    }
}

/// The address range of a native thread stack. `base` is the highest address;
/// the stack grows down towards `base - size`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StackBounds {
    pub base: usize,
    pub size: usize,
}

impl StackBounds {
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn end(&self) -> usize {
        self.base - self.size
    }

    pub const fn contains(&self, addr: usize) -> bool {
        addr < self.base && addr >= self.end()
    }

    /// Bounds of the calling thread's stack, as reported by pthreads.
    pub fn current() -> Option<Self> {
        platform_stack_bounds()
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn platform_stack_bounds() -> Option<StackBounds> {
            // Safety: the attribute object is initialised by
            // pthread_getattr_np and destroyed before returning.
            unsafe {
                let mut attr: libc::pthread_attr_t = core::mem::zeroed();
                if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
                    return None;
                }
                let mut addr: *mut libc::c_void = core::ptr::null_mut();
                let mut size: libc::size_t = 0;
                let ret = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
                libc::pthread_attr_destroy(&mut attr);
                (ret == 0).then(|| StackBounds::new(addr as usize + size, size))
            }
        }
    } else if #[cfg(target_os = "freebsd")] {
        fn platform_stack_bounds() -> Option<StackBounds> {
            // Safety: the attribute object is initialised before use and
            // destroyed before returning.
            unsafe {
                let mut attr: libc::pthread_attr_t = core::mem::zeroed();
                if libc::pthread_attr_init(&mut attr) != 0 {
                    return None;
                }
                let mut addr: *mut libc::c_void = core::ptr::null_mut();
                let mut size: libc::size_t = 0;
                let ret = if libc::pthread_attr_get_np(libc::pthread_self(), &mut attr) == 0 {
                    libc::pthread_attr_getstack(&attr, &mut addr, &mut size)
                } else {
                    -1
                };
                libc::pthread_attr_destroy(&mut attr);
                (ret == 0).then(|| StackBounds::new(addr as usize + size, size))
            }
        }
    } else if #[cfg(target_os = "macos")] {
        fn platform_stack_bounds() -> Option<StackBounds> {
            // Safety: both queries only read the current thread's descriptor.
            unsafe {
                let this = libc::pthread_self();
                let base = libc::pthread_get_stackaddr_np(this) as usize;
                let size = libc::pthread_get_stacksize_np(this);
                (base != 0 && size != 0).then(|| StackBounds::new(base, size))
            }
        }
    } else if #[cfg(target_os = "openbsd")] {
        fn platform_stack_bounds() -> Option<StackBounds> {
            // Safety: ss is a valid out-pointer.
            unsafe {
                let mut ss: libc::stack_t = core::mem::zeroed();
                if libc::pthread_stackseg_np(libc::pthread_self(), &mut ss) != 0 {
                    return None;
                }
                Some(StackBounds::new(ss.ss_sp as usize, ss.ss_size))
            }
        }
    } else {
        fn platform_stack_bounds() -> Option<StackBounds> {
            None
        }
    }
}

const WORD_MASK: usize = WORD_SIZE - 1;

/// Whether `fr` is the outermost frame of the native chain, i.e. whether its
/// frame record is missing or cannot be trusted.
///
/// The record is only dereferenced once it is known to lie inside `bounds`.
pub fn is_first_c_frame(fr: &Frame, bounds: &StackBounds) -> bool {
    let fp = fr.fp;
    if fp == 0 || fp & WORD_MASK != 0 || fp < fr.sp {
        return true;
    }
    match fp.checked_add(2 * WORD_SIZE) {
        Some(record_end) if fp >= bounds.end() && record_end <= bounds.base => {}
        _ => return true,
    }
    // Safety: the two-word record at fp lies inside the thread stack.
    let (link, sender_pc) = unsafe { (fr.link(), fr.sender_pc()) };
    link == 0 || link & WORD_MASK != 0 || link <= fp || link >= bounds.base || sender_pc == 0
}

/// The caller of a native frame, one link up the frame-pointer chain.
///
/// # Safety
/// `fr.fp` must point to a readable frame record.
pub unsafe fn sender_for_c_frame(fr: &Frame) -> Frame {
    let link = fr.link();
    Frame::new(link, link, fr.sender_pc())
}

/// The caller of `fr`, or [`Frame::empty`] when `fr` is the outermost frame.
pub fn sender_frame(fr: &Frame, bounds: &StackBounds) -> Frame {
    if fr.is_empty() || is_first_c_frame(fr, bounds) {
        return Frame::empty();
    }
    // Safety: is_first_c_frame validated the record.
    unsafe { sender_for_c_frame(fr) }
}

/// The live stack pointer of the caller.
#[inline(always)]
pub fn current_stack_pointer() -> usize {
    let sp: usize;
    // Safety: reads a register only.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "aarch64")] {
                core::arch::asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
            } else if #[cfg(target_arch = "x86_64")] {
                core::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
            } else {
                compile_error!("current_stack_pointer is not implemented for this architecture");
            }
        }
    }
    sp
}

#[inline(always)]
fn current_frame_pointer() -> usize {
    let fp: usize;
    // Safety: reads a register only.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "aarch64")] {
                core::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
            } else if #[cfg(target_arch = "x86_64")] {
                core::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
            } else {
                compile_error!("current_frame is not implemented for this architecture");
            }
        }
    }
    fp
}

/// The frame of the function that called `current_frame`, or the empty frame
/// if the native chain cannot be followed.
///
/// Relies on frame pointers being kept, which `.cargo/config.toml` forces for
/// this crate.
#[inline(never)]
pub fn current_frame() -> Frame {
    let this = Frame::new(
        current_stack_pointer(),
        current_frame_pointer(),
        current_frame as usize,
    );
    match StackBounds::current() {
        Some(bounds) => sender_frame(&this, &bounds),
        None => Frame::empty(),
    }
}

/// Walks the native chain from `start`, calling `visit` for each frame until
/// the outermost one or `limit` frames. Returns the number visited.
pub fn walk_native_frames<F: FnMut(&Frame)>(
    start: Frame,
    bounds: &StackBounds,
    limit: usize,
    mut visit: F,
) -> usize {
    let mut fr = start;
    let mut count = 0;
    while !fr.is_empty() && count < limit {
        visit(&fr);
        count += 1;
        fr = sender_frame(&fr, bounds);
    }
    count
}
