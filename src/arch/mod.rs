//! Architecture abstraction. Only x86_64 is implemented; the modules
//! below are re-exported so the rest of the kernel can say
//! `crate::arch::interrupts` without naming the architecture.

#[cfg(target_arch = "x86_64")]
pub(crate) mod x86_64;
#[cfg(target_arch = "x86_64")]
pub(crate) use self::x86_64::*;
