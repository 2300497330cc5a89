// vm_traps/src/context/ucontext.rs

//! Register access on the `ucontext_t` delivered with a signal.
//!
//! Every per-OS register layout is confined to the `imp` module selected
//! below; the rest of the crate uses [`SignalContext`] through
//! [`HardwareContext`].

use super::HardwareContext;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
        mod imp {
            pub const GPR_COUNT: usize = 31;

            pub fn pc(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.pc as usize }
            pub fn set_pc(uc: &mut libc::ucontext_t, pc: usize) { uc.uc_mcontext.pc = pc as _; }
            pub fn sp(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.sp as usize }
            pub fn fp(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.regs[29] as usize }
            pub fn lr(uc: &libc::ucontext_t) -> Option<usize> { Some(uc.uc_mcontext.regs[30] as usize) }
            pub fn gpr(uc: &libc::ucontext_t, i: usize) -> Option<usize> {
                uc.uc_mcontext.regs.get(i).map(|r| *r as usize)
            }
        }
    } else if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        mod imp {
            /// Registers are numbered in the kernel's `gregs` order.
            pub const GPR_COUNT: usize = 23;

            pub fn pc(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.gregs[libc::REG_RIP as usize] as usize }
            pub fn set_pc(uc: &mut libc::ucontext_t, pc: usize) {
                uc.uc_mcontext.gregs[libc::REG_RIP as usize] = pc as _;
            }
            pub fn sp(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.gregs[libc::REG_RSP as usize] as usize }
            pub fn fp(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.gregs[libc::REG_RBP as usize] as usize }
            pub fn lr(_uc: &libc::ucontext_t) -> Option<usize> { None }
            pub fn gpr(uc: &libc::ucontext_t, i: usize) -> Option<usize> {
                uc.uc_mcontext.gregs.get(i).map(|r| *r as usize)
            }
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
        mod imp {
            // x0-x28 live in __x; x29 and x30 are __fp and __lr.
            pub const GPR_COUNT: usize = 31;

            fn ss(uc: &libc::ucontext_t) -> &libc::__darwin_arm_thread_state64 {
                // Safety: the kernel points uc_mcontext at the saved state
                // for the whole handler invocation.
                unsafe { &(*uc.uc_mcontext).__ss }
            }
            fn ss_mut(uc: &mut libc::ucontext_t) -> &mut libc::__darwin_arm_thread_state64 {
                // Safety: as above; the signal context is exclusively ours.
                unsafe { &mut (*uc.uc_mcontext).__ss }
            }

            pub fn pc(uc: &libc::ucontext_t) -> usize { ss(uc).__pc as usize }
            pub fn set_pc(uc: &mut libc::ucontext_t, pc: usize) { ss_mut(uc).__pc = pc as _; }
            pub fn sp(uc: &libc::ucontext_t) -> usize { ss(uc).__sp as usize }
            pub fn fp(uc: &libc::ucontext_t) -> usize { ss(uc).__fp as usize }
            pub fn lr(uc: &libc::ucontext_t) -> Option<usize> { Some(ss(uc).__lr as usize) }
            pub fn gpr(uc: &libc::ucontext_t, i: usize) -> Option<usize> {
                match i {
                    0..=28 => Some(ss(uc).__x[i] as usize),
                    29 => Some(fp(uc)),
                    30 => lr(uc),
                    _ => None,
                }
            }
        }
    } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
        mod imp {
            pub const GPR_COUNT: usize = 0;

            fn ss(uc: &libc::ucontext_t) -> &libc::__darwin_x86_thread_state64 {
                // Safety: the kernel points uc_mcontext at the saved state
                // for the whole handler invocation.
                unsafe { &(*uc.uc_mcontext).__ss }
            }

            pub fn pc(uc: &libc::ucontext_t) -> usize { ss(uc).__rip as usize }
            pub fn set_pc(uc: &mut libc::ucontext_t, pc: usize) {
                // Safety: as above; the signal context is exclusively ours.
                unsafe { (*uc.uc_mcontext).__ss.__rip = pc as _ };
            }
            pub fn sp(uc: &libc::ucontext_t) -> usize { ss(uc).__rsp as usize }
            pub fn fp(uc: &libc::ucontext_t) -> usize { ss(uc).__rbp as usize }
            pub fn lr(_uc: &libc::ucontext_t) -> Option<usize> { None }
            pub fn gpr(_uc: &libc::ucontext_t, _i: usize) -> Option<usize> { None }
        }
    } else if #[cfg(all(target_os = "freebsd", target_arch = "aarch64"))] {
        mod imp {
            pub const GPR_COUNT: usize = 31;

            pub fn pc(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.mc_gpregs.gp_elr as usize }
            pub fn set_pc(uc: &mut libc::ucontext_t, pc: usize) { uc.uc_mcontext.mc_gpregs.gp_elr = pc as _; }
            pub fn sp(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.mc_gpregs.gp_sp as usize }
            pub fn fp(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.mc_gpregs.gp_x[29] as usize }
            pub fn lr(uc: &libc::ucontext_t) -> Option<usize> { Some(uc.uc_mcontext.mc_gpregs.gp_lr as usize) }
            pub fn gpr(uc: &libc::ucontext_t, i: usize) -> Option<usize> {
                match i {
                    0..=29 => Some(uc.uc_mcontext.mc_gpregs.gp_x[i] as usize),
                    30 => lr(uc),
                    _ => None,
                }
            }
        }
    } else if #[cfg(all(target_os = "freebsd", target_arch = "x86_64"))] {
        mod imp {
            pub const GPR_COUNT: usize = 0;

            pub fn pc(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.mc_rip as usize }
            pub fn set_pc(uc: &mut libc::ucontext_t, pc: usize) { uc.uc_mcontext.mc_rip = pc as _; }
            pub fn sp(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.mc_rsp as usize }
            pub fn fp(uc: &libc::ucontext_t) -> usize { uc.uc_mcontext.mc_rbp as usize }
            pub fn lr(_uc: &libc::ucontext_t) -> Option<usize> { None }
            pub fn gpr(_uc: &libc::ucontext_t, _i: usize) -> Option<usize> { None }
        }
    } else if #[cfg(all(target_os = "openbsd", target_arch = "aarch64"))] {
        mod imp {
            // OpenBSD delivers a struct sigcontext as the ucontext.
            pub const GPR_COUNT: usize = 31;

            pub fn pc(uc: &libc::ucontext_t) -> usize { uc.sc_elr as usize }
            pub fn set_pc(uc: &mut libc::ucontext_t, pc: usize) { uc.sc_elr = pc as _; }
            pub fn sp(uc: &libc::ucontext_t) -> usize { uc.sc_sp as usize }
            pub fn fp(uc: &libc::ucontext_t) -> usize { uc.sc_x[29] as usize }
            pub fn lr(uc: &libc::ucontext_t) -> Option<usize> { Some(uc.sc_lr as usize) }
            pub fn gpr(uc: &libc::ucontext_t, i: usize) -> Option<usize> {
                match i {
                    0..=29 => Some(uc.sc_x[i] as usize),
                    30 => lr(uc),
                    _ => None,
                }
            }
        }
    } else {
        compile_error!("signal context access is not implemented for this target");
    }
}

/// The interrupted thread's registers, borrowed from the OS for the duration
/// of a signal handler invocation.
pub struct SignalContext<'a> {
    uc: &'a mut libc::ucontext_t,
}

impl<'a> SignalContext<'a> {
    pub fn new(uc: &'a mut libc::ucontext_t) -> Self {
        Self { uc }
    }

    /// Wraps the third argument of an `SA_SIGINFO` handler.
    ///
    /// # Safety
    /// `raw` must be null or point to a `ucontext_t` that stays valid and
    /// unaliased for `'a`.
    pub unsafe fn from_raw(raw: *mut libc::c_void) -> Option<Self> {
        raw.cast::<libc::ucontext_t>().as_mut().map(Self::new)
    }

    pub fn as_raw(&mut self) -> *mut libc::c_void {
        (self.uc as *mut libc::ucontext_t).cast()
    }
}

impl HardwareContext for SignalContext<'_> {
    fn pc(&self) -> usize {
        imp::pc(self.uc)
    }

    fn set_pc(&mut self, pc: usize) {
        imp::set_pc(self.uc, pc)
    }

    fn sp(&self) -> usize {
        imp::sp(self.uc)
    }

    fn fp(&self) -> usize {
        imp::fp(self.uc)
    }

    fn lr(&self) -> Option<usize> {
        imp::lr(self.uc)
    }

    fn gpr(&self, index: usize) -> Option<usize> {
        imp::gpr(self.uc, index)
    }

    fn gpr_count(&self) -> usize {
        imp::GPR_COUNT
    }
}
