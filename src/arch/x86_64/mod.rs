pub(crate) mod kernel;

pub(crate) use self::kernel::core_local;
pub(crate) use self::kernel::interrupts;
#[cfg(target_os = "none")]
pub(crate) use self::kernel::switch;

use crate::topology::CpuId;

/// Sequential id of the executing CPU.
#[inline]
pub(crate) fn core_id() -> CpuId {
	core_local::core_id()
}

/// Sends a reschedule IPI to wake `cpu` out of its idle halt or to make
/// it act on a newly raised reschedule flag.
pub(crate) fn wakeup_core(cpu: CpuId) {
	#[cfg(all(target_os = "none", feature = "smp"))]
	kernel::apic::send_reschedule(cpu);
	#[cfg(not(all(target_os = "none", feature = "smp")))]
	let _ = cpu;
}

/// Parks the CPU until the next interrupt.
#[allow(dead_code)]
pub(crate) fn wait_for_interrupt() {
	#[cfg(target_os = "none")]
	interrupts::enable_and_wait();
	#[cfg(not(target_os = "none"))]
	core::hint::spin_loop();
}
