//! Local and I/O APIC programming: interrupt delivery on one CPU, IRQ
//! routing between CPUs, the scheduler timer, and the inter-processor
//! interrupt transport.
//!
//! Register access runs in one of two modes, chosen once at boot: legacy
//! memory-mapped xAPIC, or MSR-based x2APIC whenever the CPU advertises
//! it. The register indices below follow the x2APIC MSR numbering; the
//! xAPIC MMIO offset of a register is the same index shifted left by
//! four.

#![allow(dead_code)]

use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

use thiserror::Error;

use super::core_local;
#[cfg(target_os = "none")]
use super::core_local::CoreLocal;
use super::{pit, processor};
use crate::config::TIMER_FREQUENCY_HZ;
use crate::mm;
use crate::synch::SpinLock;
use crate::topology::{
	ApicId, CpuId, IoApicDescriptor, Polarity, SystemTopology, TriggerMode,
};

/// Fixed interrupt vectors. These are kernel ABI: the AP trampoline and
/// the I/O APIC redirection entries hard-code them.
pub const SPURIOUS_VECTOR: u8 = 0xFF;
pub const ERROR_VECTOR: u8 = 0xFE;
pub const TIMER_VECTOR: u8 = 0xFD;
pub const RESCHEDULE_VECTOR: u8 = 0xFA;
pub const CROSS_CALL_VECTOR: u8 = 0xF9;
pub const TLB_FLUSH_VECTOR: u8 = 0xF8;
pub const STOP_VECTOR: u8 = 0xF7;

/// Placeholder vector written into masked redirection entries.
const UNROUTED_VECTOR: u8 = 0xEF;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_X2APIC_ENABLE: u64 = 1 << 10;
const APIC_BASE_GLOBAL_ENABLE: u64 = 1 << 11;
const APIC_BASE_ADDRESS_MASK: u64 = 0xF_FFFF_F000;

/// Register indices in x2APIC MSR numbering.
const APIC_ID: u32 = 0x802;
const APIC_VERSION: u32 = 0x803;
const APIC_TPR: u32 = 0x808;
const APIC_EOI: u32 = 0x80B;
const APIC_SIVR: u32 = 0x80F;
const APIC_ESR: u32 = 0x828;
const APIC_ICR: u32 = 0x830;
const APIC_LVT_TIMER: u32 = 0x832;
const APIC_LVT_THERMAL: u32 = 0x833;
const APIC_LVT_PMI: u32 = 0x834;
const APIC_LVT_LINT0: u32 = 0x835;
const APIC_LVT_LINT1: u32 = 0x836;
const APIC_LVT_ERROR: u32 = 0x837;
const APIC_INIT_COUNT: u32 = 0x838;
const APIC_CUR_COUNT: u32 = 0x839;
const APIC_DIV_CONF: u32 = 0x83E;

/// xAPIC has a separate high ICR word at this MMIO offset.
const XAPIC_ICR_HIGH_OFFSET: usize = 0x310;

const APIC_SIVR_ENABLED: u64 = 1 << 8;
const APIC_LVT_MASK: u64 = 1 << 16;
const APIC_LVT_TIMER_PERIODIC: u64 = 1 << 17;
const APIC_DIV_CONF_DIVIDE_BY_16: u64 = 0b0011;

const APIC_ICR_DELIVERY_MODE_FIXED: u64 = 0x000;
const APIC_ICR_DELIVERY_MODE_INIT: u64 = 0x500;
const APIC_ICR_DELIVERY_MODE_STARTUP: u64 = 0x600;
const APIC_ICR_DELIVERY_STATUS_PENDING: u32 = 1 << 12;
const APIC_ICR_LEVEL_ASSERT: u64 = 1 << 14;
const APIC_ICR_LEVEL_TRIGGERED: u64 = 1 << 15;

/// How many delivery-status polls to attempt before declaring the bus
/// wedged; each poll is followed by a pause.
const DELIVERY_STATUS_RETRIES: u32 = 1_000_000;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicError {
	#[error("IPI delivery status did not clear")]
	DeliveryTimeout,
}

/// Global access mode, shared by every CPU's handle; `eoi` needs it on
/// the interrupt path without reaching through per-CPU state.
const MODE_UNINITIALIZED: u8 = 0;
const MODE_XAPIC: u8 = 1;
const MODE_X2APIC: u8 = 2;

static APIC_MODE: AtomicU8 = AtomicU8::new(MODE_UNINITIALIZED);
static XAPIC_BASE: AtomicUsize = AtomicUsize::new(0);

/// Timer ticks per millisecond at divider 16, measured once on the
/// bootstrap processor and reused verbatim by every AP.
static TIMER_TICKS_PER_MS: AtomicU32 = AtomicU32::new(0);

/// MMIO offset of a register given in x2APIC MSR numbering.
#[inline]
const fn xapic_offset(register: u32) -> usize {
	((register & 0xFF) as usize) << 4
}

#[inline]
const fn icr_fixed(vector: u8) -> u64 {
	APIC_ICR_LEVEL_ASSERT | APIC_ICR_DELIVERY_MODE_FIXED | vector as u64
}

#[inline]
const fn icr_init_assert() -> u64 {
	APIC_ICR_LEVEL_TRIGGERED | APIC_ICR_LEVEL_ASSERT | APIC_ICR_DELIVERY_MODE_INIT
}

#[inline]
const fn icr_init_deassert() -> u64 {
	APIC_ICR_LEVEL_TRIGGERED | APIC_ICR_DELIVERY_MODE_INIT
}

/// STARTUP carries the trampoline page number in the vector field.
#[inline]
const fn icr_startup(start_page: u8) -> u64 {
	APIC_ICR_DELIVERY_MODE_STARTUP | start_page as u64
}

/// The local APIC of one CPU. Obtained once per CPU during bring-up and
/// kept in its per-CPU block; `&mut self` on every accessor serializes
/// programming of the single register file.
pub struct LocalApic {
	mode: u8,
	/// Virtual base of the register window (xAPIC only).
	mmio_base: *mut u8,
}

unsafe impl Send for LocalApic {}

impl LocalApic {
	/// Creates the handle for the executing CPU, preferring x2APIC and
	/// asserting the global-enable bit in the APIC base MSR.
	pub fn new() -> Self {
		use x86_64::registers::model_specific::Msr;

		let mut base_msr = Msr::new(IA32_APIC_BASE);
		let mut base = unsafe { base_msr.read() };
		base |= APIC_BASE_GLOBAL_ENABLE;

		if processor::supports_x2apic() {
			base |= APIC_BASE_X2APIC_ENABLE;
			unsafe {
				base_msr.write(base);
			}
			APIC_MODE.store(MODE_X2APIC, Ordering::Release);
			Self {
				mode: MODE_X2APIC,
				mmio_base: ptr::null_mut(),
			}
		} else {
			unsafe {
				base_msr.write(base);
			}
			let mmio_base = mm::map_io(base & APIC_BASE_ADDRESS_MASK, 0x1000);
			XAPIC_BASE.store(mmio_base as usize, Ordering::Release);
			APIC_MODE.store(MODE_XAPIC, Ordering::Release);
			Self {
				mode: MODE_XAPIC,
				mmio_base,
			}
		}
	}

	fn read(&mut self, register: u32) -> u32 {
		if self.mode == MODE_X2APIC {
			unsafe { x86_64::registers::model_specific::Msr::new(register).read() as u32 }
		} else {
			unsafe {
				ptr::read_volatile(self.mmio_base.add(xapic_offset(register)).cast::<u32>())
			}
		}
	}

	fn write(&mut self, register: u32, value: u64) {
		if self.mode == MODE_X2APIC {
			unsafe {
				x86_64::registers::model_specific::Msr::new(register).write(value);
			}
		} else {
			unsafe {
				ptr::write_volatile(
					self.mmio_base.add(xapic_offset(register)).cast::<u32>(),
					value as u32,
				);
			}
		}
	}

	/// The APIC id this CPU answers to.
	pub fn id(&mut self) -> ApicId {
		let raw = self.read(APIC_ID);
		if self.mode == MODE_X2APIC {
			raw
		} else {
			raw >> 24
		}
	}

	/// Register-level enable sequence, run on every CPU: spurious vector
	/// armed, unused local sources masked, error reporting wired up, and
	/// the task priority opened for everything.
	pub fn init(&mut self) {
		self.write(APIC_LVT_TIMER, APIC_LVT_MASK);
		self.write(APIC_LVT_THERMAL, APIC_LVT_MASK);
		self.write(APIC_LVT_PMI, APIC_LVT_MASK);
		self.write(APIC_LVT_LINT0, APIC_LVT_MASK);
		self.write(APIC_LVT_LINT1, APIC_LVT_MASK);

		self.write(APIC_LVT_ERROR, u64::from(ERROR_VECTOR));
		// The error-status register demands a write before every read,
		// and two writes to clear it after reset.
		self.write(APIC_ESR, 0);
		self.write(APIC_ESR, 0);

		self.write(APIC_TPR, 0);
		self.write(
			APIC_SIVR,
			APIC_SIVR_ENABLED | u64::from(SPURIOUS_VECTOR),
		);
	}

	pub fn error_status(&mut self) -> u32 {
		self.write(APIC_ESR, 0);
		self.read(APIC_ESR)
	}

	/// Measures the timer frequency against the PIT: free-run from the
	/// maximum count at divider 16 for a 10 ms reference window.
	pub fn calibrate_timer(&mut self) {
		self.write(APIC_DIV_CONF, APIC_DIV_CONF_DIVIDE_BY_16);
		self.write(APIC_INIT_COUNT, u64::from(u32::MAX));

		pit::wait_ms(10);

		let elapsed = u32::MAX - self.read(APIC_CUR_COUNT);
		let ticks_per_ms = elapsed / 10;
		self.write(APIC_LVT_TIMER, APIC_LVT_MASK);

		TIMER_TICKS_PER_MS.store(ticks_per_ms, Ordering::Release);
		info!("Calibrated APIC timer: {ticks_per_ms} ticks/ms at divider 16");
	}

	/// Arms the periodic scheduler tick using the calibration value of
	/// the bootstrap processor.
	pub fn start_periodic_timer(&mut self) {
		let ticks_per_ms = TIMER_TICKS_PER_MS.load(Ordering::Acquire);
		assert_ne!(ticks_per_ms, 0, "APIC timer not calibrated");

		let initial = u64::from(ticks_per_ms) * 1000 / u64::from(TIMER_FREQUENCY_HZ);
		self.write(APIC_DIV_CONF, APIC_DIV_CONF_DIVIDE_BY_16);
		self.write(
			APIC_LVT_TIMER,
			APIC_LVT_TIMER_PERIODIC | u64::from(TIMER_VECTOR),
		);
		self.write(APIC_INIT_COUNT, initial);
	}

	/// Writes the interrupt command register. In xAPIC mode the two
	/// 32-bit halves are written high-first and the delivery-status bit
	/// is polled until the bus accepted the message; x2APIC takes the
	/// whole command in one MSR write and reports no status.
	fn write_icr(&mut self, destination: ApicId, command: u64) -> Result<(), ApicError> {
		if self.mode == MODE_X2APIC {
			let value = (u64::from(destination) << 32) | command;
			unsafe {
				x86_64::registers::model_specific::Msr::new(APIC_ICR).write(value);
			}
			return Ok(());
		}

		unsafe {
			let high = self.mmio_base.add(XAPIC_ICR_HIGH_OFFSET).cast::<u32>();
			ptr::write_volatile(high, destination << 24);

			let low = self.mmio_base.add(xapic_offset(APIC_ICR)).cast::<u32>();
			ptr::write_volatile(low, command as u32);

			for _ in 0..DELIVERY_STATUS_RETRIES {
				if ptr::read_volatile(low) & APIC_ICR_DELIVERY_STATUS_PENDING == 0 {
					return Ok(());
				}
				processor::pause();
			}
		}
		Err(ApicError::DeliveryTimeout)
	}

	/// Sends a fixed-vector IPI to `destination` (physical mode).
	pub fn send_ipi(&mut self, destination: ApicId, vector: u8) -> Result<(), ApicError> {
		self.write_icr(destination, icr_fixed(vector))
	}

	/// INIT sequence for waking an application processor: assert,
	/// then de-assert.
	pub fn send_init(&mut self, destination: ApicId) -> Result<(), ApicError> {
		self.write_icr(destination, icr_init_assert())?;
		processor::udelay(200);
		self.write_icr(destination, icr_init_deassert())
	}

	/// STARTUP IPI pointing the target at the trampoline page.
	pub fn send_startup(
		&mut self,
		destination: ApicId,
		start_page: u8,
	) -> Result<(), ApicError> {
		self.write_icr(destination, icr_startup(start_page))
	}
}

/// Signals end-of-interrupt for the current interrupt of this CPU. Called
/// from every interrupt handler; fast path, no per-CPU indirection.
pub fn eoi() {
	match APIC_MODE.load(Ordering::Acquire) {
		MODE_X2APIC => unsafe {
			x86_64::registers::model_specific::Msr::new(APIC_EOI).write(0);
		},
		MODE_XAPIC => unsafe {
			let base = XAPIC_BASE.load(Ordering::Acquire) as *mut u8;
			ptr::write_volatile(base.add(xapic_offset(APIC_EOI)).cast::<u32>(), 0);
		},
		_ => {}
	}
}

/// Reads and rearms the error-status register of this CPU's local APIC.
#[cfg(target_os = "none")]
pub fn read_error_status() -> u32 {
	CoreLocal::get().with_lapic(|lapic| lapic.error_status())
}

/// Sends the reschedule IPI to `cpu`.
#[cfg(all(target_os = "none", feature = "smp"))]
pub fn send_reschedule(cpu: CpuId) {
	if let Some(info) = core_local::cpu_info(cpu) {
		let result = CoreLocal::get()
			.with_lapic(|lapic| lapic.send_ipi(info.apic_id(), RESCHEDULE_VECTOR));
		if let Err(error) = result {
			warn!("Reschedule IPI to CPU {cpu} failed: {error}");
		}
	}
}

#[cfg(target_os = "none")]
fn send_to_other_cpus(vector: u8) {
	let own = core_local::core_id();
	let online = crate::scheduler::scheduler().online_set();

	CoreLocal::get().with_lapic(|lapic| {
		for cpu in 0..64u32 {
			if cpu == own || !online.contains(cpu) {
				continue;
			}
			if let Some(info) = core_local::cpu_info(cpu)
				&& let Err(error) = lapic.send_ipi(info.apic_id(), vector)
			{
				warn!("IPI {vector:#x} to CPU {cpu} failed: {error}");
			}
		}
	});
}

/// Broadcasts the cross-call vector to every other online CPU.
#[cfg(all(target_os = "none", feature = "smp"))]
pub fn send_crosscall_to_others() {
	send_to_other_cpus(CROSS_CALL_VECTOR);
}

/// Flushes the TLB of every other online CPU.
#[cfg(target_os = "none")]
pub fn ipi_tlb_flush() {
	// All page-table stores must be visible before the flush arrives.
	processor::mb();
	send_to_other_cpus(TLB_FLUSH_VECTOR);
}

/// Sends every other online CPU into a final halt.
#[cfg(target_os = "none")]
pub fn send_stop_to_others() {
	send_to_other_cpus(STOP_VECTOR);
}

/// One I/O APIC: an owned handle over its MMIO window.
pub struct IoApic {
	id: u8,
	base: *mut u8,
	gsi_base: u32,
	redirections: u32,
}

unsafe impl Send for IoApic {}

const IOAPIC_REG_ID: u32 = 0x00;
const IOAPIC_REG_VERSION: u32 = 0x01;
const IOAPIC_REG_TABLE: u32 = 0x10;

const IOAPIC_ENTRY_MASKED: u64 = 1 << 16;
const IOAPIC_ENTRY_LEVEL_TRIGGERED: u64 = 1 << 15;
const IOAPIC_ENTRY_ACTIVE_LOW: u64 = 1 << 13;

/// Composes a 64-bit redirection entry: vector, physical destination,
/// wiring, and the mask bit.
const fn redirection_entry(
	vector: u8,
	destination: ApicId,
	polarity: Polarity,
	trigger: TriggerMode,
	masked: bool,
) -> u64 {
	let mut entry = vector as u64 | ((destination as u64) << 56);
	if matches!(polarity, Polarity::ActiveLow) {
		entry |= IOAPIC_ENTRY_ACTIVE_LOW;
	}
	if matches!(trigger, TriggerMode::Level) {
		entry |= IOAPIC_ENTRY_LEVEL_TRIGGERED;
	}
	if masked {
		entry |= IOAPIC_ENTRY_MASKED;
	}
	entry
}

impl IoApic {
	fn new(descriptor: &IoApicDescriptor) -> Self {
		Self {
			id: descriptor.id,
			base: mm::map_io(descriptor.mmio_base, 0x1000),
			gsi_base: descriptor.gsi_base,
			redirections: descriptor.redirections,
		}
	}

	fn read(&mut self, register: u32) -> u32 {
		unsafe {
			ptr::write_volatile(self.base.cast::<u32>(), register);
			ptr::read_volatile(self.base.add(0x10).cast::<u32>())
		}
	}

	fn write(&mut self, register: u32, value: u32) {
		unsafe {
			ptr::write_volatile(self.base.cast::<u32>(), register);
			ptr::write_volatile(self.base.add(0x10).cast::<u32>(), value);
		}
	}

	pub fn version(&mut self) -> u32 {
		self.read(IOAPIC_REG_VERSION) & 0xFF
	}

	pub fn max_redirection_entry(&mut self) -> u32 {
		(self.read(IOAPIC_REG_VERSION) >> 16) & 0xFF
	}

	/// A redirection entry is two 32-bit registers; the high half first
	/// so the entry only becomes live with the low-half store.
	fn write_entry(&mut self, index: u32, entry: u64) {
		let register = IOAPIC_REG_TABLE + index * 2;
		self.write(register + 1, (entry >> 32) as u32);
		self.write(register, entry as u32);
	}

	/// Masks every redirection entry with a placeholder vector.
	fn init_masked(&mut self) {
		let entries = self.max_redirection_entry() + 1;
		let id = self.id;
		let version = self.version();
		info!("I/O APIC {id} v{version} with {entries} redirection entries");
		for index in 0..entries {
			self.write_entry(
				index,
				redirection_entry(
					UNROUTED_VECTOR,
					0,
					Polarity::ActiveHigh,
					TriggerMode::Edge,
					true,
				),
			);
		}
	}

	fn serves(&self, gsi: u32) -> bool {
		gsi >= self.gsi_base && gsi < self.gsi_base + self.redirections
	}
}

static IOAPICS: SpinLock<Vec<IoApic>> = SpinLock::new(Vec::new());

/// Brings up every I/O APIC with all sources masked.
pub fn init_ioapics(topology: &SystemTopology) {
	let mut ioapics = IOAPICS.lock();
	for descriptor in topology.ioapics() {
		let mut ioapic = IoApic::new(descriptor);
		ioapic.init_masked();
		ioapics.push(ioapic);
	}
}

/// Routes a legacy IRQ to `vector` on `cpu`: resolves the firmware
/// override, picks the I/O APIC owning the global interrupt, and writes
/// an unmasked redirection entry.
pub fn route_irq(
	topology: &SystemTopology,
	irq: u8,
	cpu: CpuId,
	vector: u8,
) -> Result<(), ()> {
	let source = topology.resolve_irq(irq);
	let destination = core_local::cpu_info(cpu).ok_or(())?.apic_id();

	let mut ioapics = IOAPICS.lock();
	let ioapic = ioapics
		.iter_mut()
		.find(|ioapic| ioapic.serves(source.gsi))
		.ok_or(())?;

	debug!(
		"Routing IRQ {irq} (GSI {}) to vector {vector:#x} on CPU {cpu}",
		source.gsi
	);
	ioapic.write_entry(
		source.gsi - ioapic.gsi_base,
		redirection_entry(vector, destination, source.polarity, source.trigger, false),
	);
	Ok(())
}

pub fn print_information() {
	info!("=== MULTIPROCESSOR INFORMATION ===");
	info!(
		"APIC in use:        {}",
		match APIC_MODE.load(Ordering::Relaxed) {
			MODE_X2APIC => "x2APIC",
			MODE_XAPIC => "xAPIC",
			_ => "uninitialized",
		}
	);
	info!("Initialized CPUs:   {}", super::get_processor_count());
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn xapic_offsets_follow_msr_numbering() {
		assert_eq!(xapic_offset(APIC_EOI), 0xB0);
		assert_eq!(xapic_offset(APIC_SIVR), 0xF0);
		assert_eq!(xapic_offset(APIC_ICR), 0x300);
		assert_eq!(xapic_offset(APIC_DIV_CONF), 0x3E0);
	}

	#[test]
	fn icr_command_composition() {
		assert_eq!(icr_fixed(RESCHEDULE_VECTOR), 0x40FA);
		// INIT assert: level-triggered, asserted, delivery mode 0b101.
		assert_eq!(icr_init_assert(), 0xC500);
		assert_eq!(icr_init_deassert(), 0x8500);
		// STARTUP for a trampoline at 0x8000: page number 8 in the
		// vector field.
		assert_eq!(icr_startup((0x8000u64 >> 12) as u8), 0x608);
	}

	#[test]
	fn redirection_entries_encode_wiring() {
		let entry = redirection_entry(0x30, 2, Polarity::ActiveHigh, TriggerMode::Edge, false);
		assert_eq!(entry, 0x0200_0000_0000_0030);

		let masked = redirection_entry(
			UNROUTED_VECTOR,
			0,
			Polarity::ActiveLow,
			TriggerMode::Level,
			true,
		);
		assert_eq!(masked & 0xFF, u64::from(UNROUTED_VECTOR));
		assert_ne!(masked & IOAPIC_ENTRY_MASKED, 0);
		assert_ne!(masked & IOAPIC_ENTRY_LEVEL_TRIGGERED, 0);
		assert_ne!(masked & IOAPIC_ENTRY_ACTIVE_LOW, 0);
	}
}
