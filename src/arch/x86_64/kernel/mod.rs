//! x86_64 kernel layer: boot sequencing for the bootstrap processor,
//! bring-up of the application processors, and the modules they share.

pub mod apic;
pub mod core_local;
pub mod gdt;
pub mod interrupts;
pub mod pit;
pub mod processor;
pub mod scheduler;
pub mod serial;
#[cfg(all(target_os = "none", feature = "smp"))]
mod smp_boot;
#[cfg(target_os = "none")]
pub mod switch;

#[cfg(all(target_os = "none", feature = "smp"))]
use core::sync::atomic::AtomicBool;
use core::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::synch::OnceCell;
#[cfg(all(target_os = "none", feature = "smp"))]
use crate::synch::SpinLock;
use crate::topology::{SystemTopology, TopologyError, TopologySnapshot};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpError {
	#[error("out of memory for per-CPU state")]
	OutOfMemory,
	#[error("application processor did not signal readiness in time")]
	ApTimeout,
	#[error(transparent)]
	Topology(#[from] TopologyError),
}

/// The validated firmware topology; immutable after boot.
static TOPOLOGY: OnceCell<SystemTopology> = OnceCell::new();

pub fn topology() -> &'static SystemTopology {
	TOPOLOGY.get().unwrap()
}

/// Imports and validates the firmware topology. Separated from the boot
/// sequence so hosted tests can exercise it too.
pub fn init_topology(
	snapshot: TopologySnapshot,
	running_apic_id: u32,
) -> Result<&'static SystemTopology, SmpError> {
	let topology = SystemTopology::import(snapshot, running_apic_id)?;
	if TOPOLOGY.set(topology).is_err() {
		panic!("topology imported twice");
	}
	Ok(self::topology())
}

/// `CPU_ONLINE` is the count of CPUs that finished initialization.
pub static CPU_ONLINE: AtomicU32 = AtomicU32::new(0);

pub fn get_processor_count() -> u32 {
	CPU_ONLINE.load(Ordering::Acquire)
}

/// Rendezvous between the bootstrap processor and the one application
/// processor currently being booted. The BSP publishes the target's id
/// under the lock and spins on the done flag; the AP raises the flag
/// exactly once, at the end of its own initialization.
#[cfg(all(target_os = "none", feature = "smp"))]
static AP_BOOT_LOCK: SpinLock<()> = SpinLock::new(());
#[cfg(all(target_os = "none", feature = "smp"))]
static AP_BOOT_CPU_ID: AtomicU32 = AtomicU32::new(u32::MAX);
#[cfg(all(target_os = "none", feature = "smp"))]
static AP_BOOT_DONE: AtomicBool = AtomicBool::new(false);

/// Full initialization of the bootstrap processor, up to the point where
/// its scheduler ticks and the application processors may be started.
#[cfg(target_os = "none")]
pub fn boot_processor_init(
	snapshot: TopologySnapshot,
	physical_memory_offset: u64,
) -> Result<(), SmpError> {
	use self::core_local::{CoreLocal, CpuState};

	crate::mm::init(physical_memory_offset);
	serial::init();
	crate::logging::init();
	info!("Booting on the bootstrap processor");

	let (features, frequency) = processor::detect_features();
	processor::set_boot_features(features, frequency);
	processor::configure();

	let running_apic_id = processor::local_apic_id();
	let topology = init_topology(snapshot, running_apic_id)?;
	let possible_cpus = topology.possible_cpus();

	core_local::init_cpu_table(possible_cpus);
	let bsp = topology
		.cpus()
		.iter()
		.find(|cpu| cpu.apic_id == running_apic_id)
		.copied()
		.unwrap_or(crate::topology::CpuDescriptor {
			logical_id: 0,
			apic_id: running_apic_id,
			firmware_id: 0,
			enabled: true,
			node: 0,
		});
	let info = CoreLocal::allocate(0, bsp.apic_id, bsp.firmware_id, bsp.node)
		.map_err(|()| SmpError::OutOfMemory)?;
	info.set_features(features);
	info.set_frequency(frequency);
	info.install();

	gdt::add_current_core();
	interrupts::install();
	interrupts::load_idt();

	let mut lapic = apic::LocalApic::new();
	lapic.init();
	lapic.calibrate_timer();

	apic::init_ioapics(topology);

	crate::scheduler::init(possible_cpus);
	crate::scheduler::scheduler().set_topology(topology);
	crate::scheduler::scheduler().add_core(0);

	lapic.start_periodic_timer();
	info.set_lapic(lapic);
	info.set_state(CpuState::Online);
	CPU_ONLINE.store(1, Ordering::Release);

	interrupts::enable();
	Ok(())
}

/// Boots all application processors the firmware reported as enabled.
/// A processor that fails to come up is left Offline; the system
/// continues on the CPUs that made it.
#[cfg(all(target_os = "none", feature = "smp"))]
pub fn boot_application_processors() {
	use x86_64::registers::control::Cr3;

	let topology = topology();
	let (page_table, _) = Cr3::read();
	smp_boot::install(
		page_table.start_address().as_u64() as u32,
		application_processor_entry,
	);

	for descriptor in topology.secondary_cpus() {
		if let Err(error) = boot_cpu(descriptor) {
			warn!(
				"CPU {} (APIC id {}) failed to boot: {error}",
				descriptor.logical_id, descriptor.apic_id
			);
		}
	}

	apic::print_information();
}

/// Wakes one application processor and waits for its rendezvous signal.
#[cfg(all(target_os = "none", feature = "smp"))]
fn boot_cpu(descriptor: &crate::topology::CpuDescriptor) -> Result<(), SmpError> {
	use self::core_local::{CoreLocal, CpuState};
	use self::scheduler::TaskStacks;
	use crate::config::AP_STARTUP_TIMEOUT_US;

	let cpu = descriptor.logical_id;
	info!("Booting CPU {cpu} with APIC id {}", descriptor.apic_id);

	let info = CoreLocal::allocate(
		cpu,
		descriptor.apic_id,
		descriptor.firmware_id,
		descriptor.node,
	)
	.map_err(|()| SmpError::OutOfMemory)?;
	info.set_state(CpuState::Starting);

	// The AP runs on this stack from the trampoline until its idle loop.
	let stack = TaskStacks::new(crate::config::KERNEL_STACK_SIZE)
		.ok_or(SmpError::OutOfMemory)?;
	smp_boot::set_cpu_entry(descriptor.apic_id, cpu, stack.stack_top());

	let _rendezvous = AP_BOOT_LOCK.lock();
	AP_BOOT_CPU_ID.store(cpu, Ordering::Release);
	AP_BOOT_DONE.store(false, Ordering::Release);

	let startup_result = CoreLocal::get().with_lapic(|lapic| {
		lapic.send_init(descriptor.apic_id)?;
		processor::udelay(10_000);

		// The protocol wants two STARTUP IPIs, 200 microseconds apart.
		lapic.send_startup(descriptor.apic_id, smp_boot::startup_page())?;
		processor::udelay(200);
		lapic.send_startup(descriptor.apic_id, smp_boot::startup_page())
	});
	if let Err(error) = startup_result {
		warn!("STARTUP sequence for CPU {cpu} failed: {error}");
	}

	let mut waited_us = 0;
	while !AP_BOOT_DONE.load(Ordering::Acquire) {
		if waited_us >= AP_STARTUP_TIMEOUT_US {
			info.set_state(CpuState::Offline);
			crate::scheduler::scheduler().mark_core_offline(cpu);
			drop(stack);
			return Err(SmpError::ApTimeout);
		}
		processor::udelay(1000);
		waited_us += 1000;
	}

	// The AP owns its boot stack from here on.
	core::mem::forget(stack);
	Ok(())
}

/// First Rust code an application processor executes, called by the
/// trampoline with its logical id and boot stack installed.
#[cfg(all(target_os = "none", feature = "smp"))]
extern "C" fn application_processor_entry(logical_id: u32) -> ! {
	use self::core_local::CpuState;

	let info = core_local::cpu_info(logical_id).unwrap();
	info.install();
	processor::configure();
	gdt::add_current_core();
	interrupts::load_idt();

	let (features, frequency) = processor::detect_features();
	info.set_features(features);
	info.set_frequency(frequency);

	let mut lapic = apic::LocalApic::new();
	lapic.init();
	// Timer calibration is inherited from the bootstrap processor.
	lapic.start_periodic_timer();
	info.set_lapic(lapic);

	crate::scheduler::scheduler().add_core(logical_id);
	info.set_state(CpuState::Online);
	CPU_ONLINE.fetch_add(1, Ordering::Release);

	debug_assert_eq!(AP_BOOT_CPU_ID.load(Ordering::Acquire), logical_id);
	AP_BOOT_DONE.store(true, Ordering::Release);

	info!("CPU {logical_id} is online");
	interrupts::enable();
	crate::scheduler::idle_loop()
}

/// Stops every other CPU and halts this one.
#[cfg(target_os = "none")]
pub fn shutdown() -> ! {
	crate::scheduler::scheduler().print_status();
	interrupts::print_statistics();
	apic::send_stop_to_others();
	interrupts::disable();
	loop {
		processor::halt();
	}
}
