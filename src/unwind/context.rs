use std::ffi::c_void;

/// The registers a walk starts from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterContext {
    pub ip: usize,
    pub sp: usize,
    pub fp: usize,
    /// Link register. Zero on targets that push the return address.
    pub lr: usize,
}

impl RegisterContext {
    pub fn new(ip: usize, sp: usize, fp: usize) -> Self {
        Self { ip, sp, fp, lr: 0 }
    }

    pub fn with_lr(mut self, lr: usize) -> Self {
        self.lr = lr;
        self
    }

    /// Registers of the thread a signal interrupted.
    ///
    /// # Safety
    /// `ucontext` must be null or the third argument of an `SA_SIGINFO` handler.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub unsafe fn from_ucontext(ucontext: *const c_void) -> Option<Self> {
        const REG_RBP: usize = 10;
        const REG_RSP: usize = 15;
        const REG_RIP: usize = 16;

        // SAFETY: caller guarantees the pointer is a ucontext_t or null
        let uc = unsafe { (ucontext as *const libc::ucontext_t).as_ref()? };
        let gregs = &uc.uc_mcontext.gregs;
        Some(Self {
            ip: gregs[REG_RIP] as usize,
            sp: gregs[REG_RSP] as usize,
            fp: gregs[REG_RBP] as usize,
            lr: 0,
        })
    }

    /// Registers of the thread a signal interrupted.
    ///
    /// # Safety
    /// `ucontext` must be null or the third argument of an `SA_SIGINFO` handler.
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    pub unsafe fn from_ucontext(ucontext: *const c_void) -> Option<Self> {
        // SAFETY: caller guarantees the pointer is a ucontext_t or null
        let uc = unsafe { (ucontext as *const libc::ucontext_t).as_ref()? };
        let mcontext = &uc.uc_mcontext;
        Some(Self {
            ip: mcontext.pc as usize,
            sp: mcontext.sp as usize,
            fp: mcontext.regs[29] as usize,
            lr: mcontext.regs[30] as usize,
        })
    }

    /// # Safety
    /// Always safe on unsupported targets; it never dereferences.
    #[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
    pub unsafe fn from_ucontext(_ucontext: *const c_void) -> Option<Self> {
        None
    }

    /// Registers at the call site. Inlined so the frame pointer belongs to
    /// the caller.
    #[inline(always)]
    pub fn capture() -> Option<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            let (ip, sp, fp): (usize, usize, usize);
            // SAFETY: reads registers only
            unsafe {
                std::arch::asm!(
                    "lea {ip}, [rip]",
                    "mov {sp}, rsp",
                    "mov {fp}, rbp",
                    ip = out(reg) ip,
                    sp = out(reg) sp,
                    fp = out(reg) fp,
                    options(nomem, nostack, preserves_flags)
                );
            }
            Some(Self { ip, sp, fp, lr: 0 })
        }

        #[cfg(target_arch = "aarch64")]
        {
            let (ip, sp, fp, lr): (usize, usize, usize, usize);
            // SAFETY: reads registers only
            unsafe {
                std::arch::asm!(
                    "adr {ip}, .",
                    "mov {sp}, sp",
                    "mov {fp}, x29",
                    "mov {lr}, x30",
                    ip = out(reg) ip,
                    sp = out(reg) sp,
                    fp = out(reg) fp,
                    lr = out(reg) lr,
                    options(nomem, nostack, preserves_flags)
                );
            }
            Some(Self { ip, sp, fp, lr })
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            None
        }
    }
}
