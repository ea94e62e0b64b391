/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this file,
 * You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The machine context captured inside the signal handler, and the subset of
//! it a stack walk is seeded with.

use cfg_if::cfg_if;

/// Register state of the target thread at the moment it was interrupted.
///
/// This is a verbatim copy of the signal frame's machine context. On x86_64
/// the floating point / SIMD state lives outside of `mcontext_t`, so it is
/// copied next to it and `mcontext.fpregs` must not be dereferenced.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CapturedContext {
    pub mcontext: libc::mcontext_t,
    #[cfg(target_arch = "x86_64")]
    pub fpstate: libc::_libc_fpstate,
}

impl CapturedContext {
    /// Copies the machine context out of a signal frame.
    ///
    /// Uses only memory copies, so it is safe to call from a signal handler.
    ///
    /// # Safety
    ///
    /// `ucontext` must be the third argument of an `SA_SIGINFO` handler that
    /// is currently executing, and `dst` must be valid for writes.
    pub(crate) unsafe fn copy_from_ucontext(
        dst: *mut CapturedContext,
        ucontext: *const libc::ucontext_t,
    ) {
        std::ptr::copy_nonoverlapping(
            std::ptr::addr_of!((*ucontext).uc_mcontext),
            std::ptr::addr_of_mut!((*dst).mcontext),
            1,
        );

        #[cfg(target_arch = "x86_64")]
        {
            let fpregs = (*ucontext).uc_mcontext.fpregs;
            if fpregs.is_null() {
                std::ptr::write_bytes(std::ptr::addr_of_mut!((*dst).fpstate), 0, 1);
            } else {
                std::ptr::copy_nonoverlapping(fpregs, std::ptr::addr_of_mut!((*dst).fpstate), 1);
            }
            (*dst).mcontext.fpregs = std::ptr::null_mut();
        }
    }

    pub fn registers(&self) -> Registers {
        Registers::from_mcontext(&self.mcontext)
    }
}

impl std::fmt::Debug for CapturedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedContext")
            .field("registers", &self.registers())
            .finish_non_exhaustive()
    }
}

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        const GREG_COUNT: usize = 23;

        /// General purpose registers in `mcontext_t::gregs` order.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct Registers {
            pub gregs: [u64; GREG_COUNT],
        }

        impl Registers {
            pub fn from_mcontext(mcontext: &libc::mcontext_t) -> Self {
                let mut gregs = [0u64; GREG_COUNT];
                for (dst, src) in gregs.iter_mut().zip(mcontext.gregs.iter()) {
                    *dst = *src as u64;
                }
                Self { gregs }
            }

            pub fn pc(&self) -> u64 {
                self.gregs[libc::REG_RIP as usize]
            }

            pub fn sp(&self) -> u64 {
                self.gregs[libc::REG_RSP as usize]
            }

            pub fn fp(&self) -> u64 {
                self.gregs[libc::REG_RBP as usize]
            }

            pub fn unwind_regs(&self) -> framehop::UnwindRegsNative {
                framehop::UnwindRegsNative::new(self.pc(), self.sp(), self.fp())
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// `x0`..`x30`, followed by `sp` and `pc`.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct Registers {
            pub regs: [u64; 31],
            pub sp: u64,
            pub pc: u64,
        }

        impl Registers {
            pub fn from_mcontext(mcontext: &libc::mcontext_t) -> Self {
                Self {
                    regs: mcontext.regs,
                    sp: mcontext.sp,
                    pc: mcontext.pc,
                }
            }

            pub fn pc(&self) -> u64 {
                self.pc
            }

            pub fn sp(&self) -> u64 {
                self.sp
            }

            pub fn fp(&self) -> u64 {
                self.regs[29]
            }

            pub fn lr(&self) -> u64 {
                self.regs[30]
            }

            pub fn unwind_regs(&self) -> framehop::UnwindRegsNative {
                framehop::UnwindRegsNative::new(self.lr(), self.sp(), self.fp())
            }
        }
    } else {
        compile_error!("thread-unwinder only supports x86_64 and aarch64");
    }
}
