//! Per-CPU state and the `cpu_id` fast path.
//!
//! Every CPU owns one cache-line-aligned [`CoreLocal`] block, allocated on
//! its own NUMA node and published through the `cpu_by_id` table before
//! the CPU is released. GS base points at the block, with the CPU id at
//! offset zero, so reading the own id is one gs-relative load.

#![allow(dead_code)]

use alloc::boxed::Box;
use core::cell::{Cell, RefCell};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, Ordering};

use num_enum::TryFromPrimitive;

use super::apic::LocalApic;
use super::interrupts::{IRQ_COUNTERS, IrqStatistics};
use super::processor::{CpuFeatures, FrequencyInfo};
use crate::mm;
use crate::synch::{OnceCell, SeqLock};
use crate::topology::{ApicId, CpuId, NodeId};

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum CpuState {
	Offline = 0,
	Starting = 1,
	Online = 2,
	Halted = 3,
}

/// The per-CPU info block.
///
/// `repr(C)` keeps `core_id` at offset zero (the `cpu_id` fast path and
/// the personality's sysinfo query depend on that) and `this` at a fixed
/// offset for [`CoreLocal::get`].
#[repr(C, align(128))]
pub(crate) struct CoreLocal {
	/// Sequential id of this CPU. Must stay the first field.
	core_id: CpuId,
	this: *const Self,
	apic_id: ApicId,
	firmware_id: u32,
	node: NodeId,
	package_id: u32,
	core_index: u32,
	smt_index: u32,
	state: AtomicU8,
	features: AtomicU32,
	frequency: SeqLock<FrequencyInfo>,
	/// Interface to the interrupt counters
	irq_statistics: &'static IrqStatistics,
	/// Top of the kernel stack of the thread occupying this CPU.
	pub kernel_stack: Cell<*mut u8>,
	/// This CPU's local APIC handle; populated during APIC init.
	lapic: RefCell<Option<LocalApic>>,
}

// The Cell/RefCell fields are only ever touched by the owning CPU; the
// cross-CPU surface is the atomics and the immutable identification.
unsafe impl Send for CoreLocal {}
unsafe impl Sync for CoreLocal {}

/// Cross-CPU lookup table, fully sized before any AP is released.
static CPU_BY_ID: OnceCell<Box<[AtomicPtr<CoreLocal>]>> = OnceCell::new();

impl CoreLocal {
	fn new(
		core_id: CpuId,
		apic_id: ApicId,
		firmware_id: u32,
		node: NodeId,
		irq_statistics: &'static IrqStatistics,
	) -> Self {
		Self {
			core_id,
			this: ptr::null(),
			apic_id,
			firmware_id,
			node,
			package_id: 0,
			core_index: 0,
			smt_index: 0,
			state: AtomicU8::new(CpuState::Starting as u8),
			features: AtomicU32::new(0),
			frequency: SeqLock::new(FrequencyInfo::default()),
			irq_statistics,
			kernel_stack: Cell::new(ptr::null_mut()),
			lapic: RefCell::new(None),
		}
	}

	/// Allocates the block for `core_id`: the bootstrap processor gets
	/// the statically reserved one, every other CPU a block from its own
	/// NUMA node.
	pub fn allocate(
		core_id: CpuId,
		apic_id: ApicId,
		firmware_id: u32,
		node: NodeId,
	) -> Result<&'static CoreLocal, ()> {
		let irq_statistics = if core_id == 0 {
			static FIRST_IRQ_STATISTICS: IrqStatistics = IrqStatistics::new();
			&FIRST_IRQ_STATISTICS
		} else {
			&*Box::leak(Box::new(IrqStatistics::new()))
		};

		let this = Self::new(core_id, apic_id, firmware_id, node, irq_statistics);
		let this: &'static mut CoreLocal = if core_id == 0 {
			take_static::take_static! {
				static FIRST_CORE_LOCAL: Option<CoreLocal> = None;
			}
			FIRST_CORE_LOCAL.take().unwrap().insert(this)
		} else {
			let order = mm::order_for(size_of::<CoreLocal>());
			let block = mm::alloc_pages_node(order, node).ok_or(())?;
			let raw = block.as_ptr().cast::<CoreLocal>();
			unsafe {
				raw.write(this);
				&mut *raw
			}
		};
		this.this = ptr::from_ref(this);
		let this: &'static CoreLocal = this;

		IRQ_COUNTERS.lock().insert(core_id, this.irq_statistics);
		CPU_BY_ID.get().unwrap()[core_id as usize]
			.store(ptr::from_ref(this).cast_mut(), Ordering::Release);
		Ok(this)
	}

	/// Points GS at this block. Runs on the owning CPU itself, early in
	/// its initialization.
	#[cfg(target_os = "none")]
	pub fn install(&'static self) {
		use x86_64::VirtAddr;
		use x86_64::registers::model_specific::GsBase;

		GsBase::write(VirtAddr::from_ptr(self));
	}

	#[cfg(target_os = "none")]
	#[inline]
	pub fn get() -> &'static Self {
		use core::arch::asm;
		use core::mem;

		unsafe {
			let raw: *const Self;
			asm!(
				"mov {}, gs:{}",
				out(reg) raw,
				const mem::offset_of!(Self, this),
				options(readonly, nostack, preserves_flags),
			);
			&*raw
		}
	}

	pub fn core_id(&self) -> CpuId {
		self.core_id
	}

	pub fn apic_id(&self) -> ApicId {
		self.apic_id
	}

	pub fn firmware_id(&self) -> u32 {
		self.firmware_id
	}

	pub fn node(&self) -> NodeId {
		self.node
	}

	pub fn state(&self) -> CpuState {
		CpuState::try_from(self.state.load(Ordering::Acquire)).unwrap()
	}

	pub fn set_state(&self, state: CpuState) {
		self.state.store(state as u8, Ordering::Release);
	}

	pub fn features(&self) -> CpuFeatures {
		CpuFeatures::from_bits_retain(self.features.load(Ordering::Relaxed))
	}

	pub fn set_features(&self, features: CpuFeatures) {
		self.features.store(features.bits(), Ordering::Relaxed);
	}

	pub fn frequency(&self) -> FrequencyInfo {
		self.frequency.read()
	}

	pub fn set_frequency(&self, frequency: FrequencyInfo) {
		self.frequency.write(frequency);
	}

	pub fn irq_statistics(&self) -> &'static IrqStatistics {
		self.irq_statistics
	}

	pub fn with_lapic<R>(&self, f: impl FnOnce(&mut LocalApic) -> R) -> R {
		let mut lapic = self.lapic.borrow_mut();
		f(lapic.as_mut().expect("local APIC not initialized"))
	}

	pub fn set_lapic(&self, lapic: LocalApic) {
		*self.lapic.borrow_mut() = Some(lapic);
	}
}

/// Sizes the `cpu_by_id` table; called once on the bootstrap processor
/// before any other block is allocated.
pub(crate) fn init_cpu_table(possible_cpus: u32) {
	let table = (0..possible_cpus)
		.map(|_| AtomicPtr::new(ptr::null_mut()))
		.collect();
	if CPU_BY_ID.set(table).is_err() {
		panic!("CPU table initialized twice");
	}
}

/// The info block of `cpu`, if that CPU ever started allocation.
pub(crate) fn cpu_info(cpu: CpuId) -> Option<&'static CoreLocal> {
	let table = CPU_BY_ID.get()?;
	let raw = table.get(cpu as usize)?.load(Ordering::Acquire);
	unsafe { raw.as_ref() }
}

/// Sequential id of the executing CPU: a single gs-relative load.
#[cfg(target_os = "none")]
#[inline]
pub(crate) fn core_id() -> CpuId {
	use core::arch::asm;

	unsafe {
		let id: u32;
		asm!(
			"mov {:e}, gs:[0]",
			out(reg) id,
			options(readonly, nostack, preserves_flags),
		);
		id
	}
}

#[cfg(not(target_os = "none"))]
pub(crate) fn core_id() -> CpuId {
	0
}

/// Runs `f` on the executing CPU's interrupt counters, if its per-CPU
/// block is already installed.
pub(crate) fn try_irq_statistics(f: impl FnOnce(&IrqStatistics)) {
	#[cfg(target_os = "none")]
	{
		use x86_64::VirtAddr;
		use x86_64::registers::model_specific::GsBase;

		if GsBase::read() != VirtAddr::zero() {
			f(CoreLocal::get().irq_statistics());
		}
	}
	#[cfg(not(target_os = "none"))]
	let _ = f;
}
