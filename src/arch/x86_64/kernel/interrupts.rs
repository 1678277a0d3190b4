//! Interrupt descriptor table, the inter-processor interrupt handlers,
//! and the cross-CPU function-call machinery.
//!
//! The IPI vectors are kernel ABI: the AP trampoline and every
//! redirection entry hard-code them, so they must never change once a
//! system has booted.

#![allow(dead_code)]

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::synch::{SpinLock, SpinLockIrqSave};
use crate::topology::CpuId;

/// Interrupt-enable helpers. On hosted targets (unit tests) they are
/// no-ops so the IRQ-save locks stay usable.
#[cfg(target_os = "none")]
mod flags {
	pub use x86_64::instructions::interrupts::{disable, enable, enable_and_hlt};
	use x86_64::instructions::interrupts::are_enabled;

	/// Disables interrupts and reports whether they were enabled before.
	#[inline]
	pub fn nested_disable() -> bool {
		let was_enabled = are_enabled();
		disable();
		was_enabled
	}

	/// Restores the interrupt-enable state captured by `nested_disable`.
	#[inline]
	pub fn nested_enable(was_enabled: bool) {
		if was_enabled {
			enable();
		}
	}
}

#[cfg(not(target_os = "none"))]
mod flags {
	#[inline]
	pub fn disable() {}

	#[inline]
	pub fn enable() {}

	#[inline]
	pub fn enable_and_hlt() {}

	#[inline]
	pub fn nested_disable() -> bool {
		false
	}

	#[inline]
	pub fn nested_enable(_was_enabled: bool) {}
}

#[allow(unused_imports)]
pub(crate) use self::flags::{disable, enable, nested_disable, nested_enable};

#[inline]
pub(crate) fn enable_and_wait() {
	flags::enable_and_hlt();
}

/// Per-CPU interrupt counters, indexed by vector.
#[repr(align(64))]
pub struct IrqStatistics {
	counters: [AtomicU64; 256],
}

impl IrqStatistics {
	pub const fn new() -> Self {
		const ZERO: AtomicU64 = AtomicU64::new(0);
		IrqStatistics {
			counters: [ZERO; 256],
		}
	}

	pub fn inc(&self, vector: u8) {
		self.counters[vector as usize].fetch_add(1, Ordering::Relaxed);
	}

	pub fn count(&self, vector: u8) -> u64 {
		self.counters[vector as usize].load(Ordering::Relaxed)
	}
}

/// Interface to the interrupt counters of every booted CPU.
pub(crate) static IRQ_COUNTERS: SpinLockIrqSave<BTreeMap<CpuId, &'static IrqStatistics>> =
	SpinLockIrqSave::new(BTreeMap::new());

static IRQ_NAMES: SpinLockIrqSave<BTreeMap<u8, &'static str>> =
	SpinLockIrqSave::new(BTreeMap::new());

pub fn add_irq_name(vector: u8, name: &'static str) {
	debug!("Register name \"{name}\" for interrupt {vector}");
	IRQ_NAMES.lock().insert(vector, name);
}

pub(crate) fn increment_irq_counter(vector: u8) {
	super::core_local::try_irq_statistics(|statistics| statistics.inc(vector));
}

pub fn print_statistics() {
	info!("Interrupt statistics:");
	let names = IRQ_NAMES.lock();
	for (cpu, statistics) in IRQ_COUNTERS.lock().iter() {
		for vector in 0..=255u8 {
			let count = statistics.count(vector);
			if count > 0 {
				let name = names.get(&vector).copied().unwrap_or("unnamed");
				info!("[{cpu}][{name}]: {count}");
			}
		}
	}
}

/// State of the one in-flight cross-CPU function call. The broadcast lock
/// serializes senders; the pending counter is decremented by each remote
/// handler.
static CROSS_CALL_LOCK: SpinLock<()> = SpinLock::new(());
static CROSS_CALL_FUNCTION: AtomicUsize = AtomicUsize::new(0);
static CROSS_CALL_ARGUMENT: AtomicUsize = AtomicUsize::new(0);
static CROSS_CALL_PENDING: AtomicU32 = AtomicU32::new(0);

/// Runs `func(arg)` on every online CPU, locally and via the cross-call
/// IPI on all others. With `wait`, spins until every CPU has executed it.
pub fn smp_call(func: fn(usize), arg: usize, wait: bool) {
	let _broadcast = CROSS_CALL_LOCK.lock();

	let others = super::get_processor_count().saturating_sub(1);
	CROSS_CALL_FUNCTION.store(func as usize, Ordering::Release);
	CROSS_CALL_ARGUMENT.store(arg, Ordering::Release);
	CROSS_CALL_PENDING.store(others, Ordering::Release);

	#[cfg(all(target_os = "none", feature = "smp"))]
	if others > 0 {
		super::apic::send_crosscall_to_others();
	}

	func(arg);

	if wait {
		while CROSS_CALL_PENDING.load(Ordering::Acquire) != 0 {
			super::processor::pause();
		}
	}
}

#[cfg(target_os = "none")]
mod idt {
	#![allow(static_mut_refs)]

	use x86_64::registers::control::Cr3;
	use x86_64::set_general_handler;
	use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

	use super::super::apic;
	use super::increment_irq_counter;
	use crate::scheduler;

	pub static mut IDT: InterruptDescriptorTable = InterruptDescriptorTable::new();

	pub fn load_idt() {
		unsafe {
			IDT.load_unsafe();
		}
	}

	/// Populates the IDT: exceptions die loudly, hardware interrupts are
	/// counted, and the fixed scheduler/IPI vectors get their handlers.
	pub fn install() {
		let idt = unsafe { &mut IDT };

		set_general_handler!(idt, fault, 0..32);
		set_general_handler!(idt, unhandled, 32..);

		idt[apic::TIMER_VECTOR].set_handler_fn(timer_interrupt_handler);
		idt[apic::ERROR_VECTOR].set_handler_fn(error_interrupt_handler);
		idt[apic::SPURIOUS_VECTOR].set_handler_fn(spurious_interrupt_handler);
		idt[apic::RESCHEDULE_VECTOR].set_handler_fn(reschedule_handler);
		idt[apic::CROSS_CALL_VECTOR].set_handler_fn(crosscall_handler);
		idt[apic::TLB_FLUSH_VECTOR].set_handler_fn(tlb_flush_handler);
		idt[apic::STOP_VECTOR].set_handler_fn(stop_handler);

		super::add_irq_name(apic::TIMER_VECTOR, "Timer");
		super::add_irq_name(apic::RESCHEDULE_VECTOR, "Reschedule");
		super::add_irq_name(apic::CROSS_CALL_VECTOR, "Cross call");
		super::add_irq_name(apic::TLB_FLUSH_VECTOR, "TLB flush");
		super::add_irq_name(apic::STOP_VECTOR, "Stop");
	}

	fn fault(stack_frame: InterruptStackFrame, index: u8, error_code: Option<u64>) {
		error!("CPU exception {index} (error code {error_code:?}): {stack_frame:#?}");
		panic!("unrecoverable CPU exception");
	}

	fn unhandled(_stack_frame: InterruptStackFrame, index: u8, _error_code: Option<u64>) {
		warn!("Received unhandled interrupt {index}");
		increment_irq_counter(index);
		apic::eoi();
	}

	extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
		increment_irq_counter(apic::TIMER_VECTOR);
		apic::eoi();
		scheduler::tick();
	}

	extern "x86-interrupt" fn reschedule_handler(_stack_frame: InterruptStackFrame) {
		increment_irq_counter(apic::RESCHEDULE_VECTOR);
		scheduler::note_reschedule_request();
		apic::eoi();
		// The switch itself happens once preemption is re-enabled on the
		// way out of the handler.
		scheduler::try_reschedule();
	}

	extern "x86-interrupt" fn crosscall_handler(_stack_frame: InterruptStackFrame) {
		use core::sync::atomic::Ordering;

		increment_irq_counter(apic::CROSS_CALL_VECTOR);

		let func = super::CROSS_CALL_FUNCTION.load(Ordering::Acquire);
		let arg = super::CROSS_CALL_ARGUMENT.load(Ordering::Acquire);
		let func: fn(usize) = unsafe { core::mem::transmute(func) };
		func(arg);
		super::CROSS_CALL_PENDING.fetch_sub(1, Ordering::AcqRel);

		apic::eoi();
	}

	extern "x86-interrupt" fn tlb_flush_handler(_stack_frame: InterruptStackFrame) {
		increment_irq_counter(apic::TLB_FLUSH_VECTOR);
		// Reloading CR3 drops every non-global translation.
		let (frame, flags) = Cr3::read();
		unsafe {
			Cr3::write(frame, flags);
		}
		apic::eoi();
	}

	extern "x86-interrupt" fn stop_handler(_stack_frame: InterruptStackFrame) {
		apic::eoi();
		super::disable();
		loop {
			super::super::processor::halt();
		}
	}

	extern "x86-interrupt" fn error_interrupt_handler(_stack_frame: InterruptStackFrame) {
		error!("APIC LVT error, ESR: {:#x}", apic::read_error_status());
		increment_irq_counter(apic::ERROR_VECTOR);
		apic::eoi();
	}

	extern "x86-interrupt" fn spurious_interrupt_handler(_stack_frame: InterruptStackFrame) {
		// A spurious interrupt is never acknowledged.
		warn!("Spurious APIC interrupt");
	}
}

#[cfg(target_os = "none")]
pub(crate) use self::idt::{install, load_idt};

#[cfg(test)]
mod tests {
	use core::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn irq_statistics_count_per_vector() {
		let statistics = IrqStatistics::new();
		statistics.inc(0xFD);
		statistics.inc(0xFD);
		statistics.inc(0xFA);
		assert_eq!(statistics.count(0xFD), 2);
		assert_eq!(statistics.count(0xFA), 1);
		assert_eq!(statistics.count(0x20), 0);
	}

	#[test]
	fn smp_call_executes_locally() {
		static CALLS: AtomicUsize = AtomicUsize::new(0);

		fn bump(arg: usize) {
			CALLS.fetch_add(arg, Ordering::SeqCst);
		}

		// Single (hosted) CPU: no remote side, the local invocation must
		// still happen and the wait must not hang.
		smp_call(bump, 3, true);
		assert_eq!(CALLS.load(Ordering::SeqCst), 3);
		assert_eq!(CROSS_CALL_PENDING.load(Ordering::SeqCst), 0);
	}
}
