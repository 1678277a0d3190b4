//! The SMP core of a microkernel carrying an OS/2-style personality on
//! x86_64: CPU bring-up from the firmware topology, per-CPU O(1)
//! scheduling with OS/2 priority classes, and the inter-processor
//! interrupt layer tying the CPUs together.
//!
//! The crate builds freestanding for the kernel itself and hosted for
//! the unit tests, where the hardware layer is stubbed out and the
//! scheduler runs against simulated CPUs.

#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]
#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[cfg(not(target_os = "none"))]
#[macro_use]
extern crate std;

pub mod config;
pub mod errno;
pub mod mm;
pub mod os2;
pub mod scheduler;
pub mod synch;
pub mod topology;

mod arch;
mod logging;

pub use crate::arch::kernel::interrupts::smp_call;
pub use crate::arch::kernel::{SmpError, get_processor_count, init_topology, topology};
#[cfg(target_os = "none")]
pub use crate::arch::kernel::{apic::ipi_tlb_flush, boot_processor_init, shutdown};
#[cfg(all(target_os = "none", feature = "smp"))]
pub use crate::arch::kernel::boot_application_processors;
