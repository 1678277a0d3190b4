//! Installation and patching of the application-processor trampoline.
//!
//! Application processors boot in 16-bit real mode and need a CS:IP
//! target below 1 MiB, so the stub from `smp_boot.s` is copied to a
//! fixed low page. The STARTUP vector encodes that page's number; it is
//! kernel ABI together with the interrupt vectors.

use core::arch::global_asm;
use core::ptr;

use crate::mm;
use crate::topology::{ApicId, CpuId};

global_asm!(include_str!("smp_boot.s"), options(att_syntax));

/// Physical address the trampoline is copied to.
pub const TRAMPOLINE_ADDRESS: u64 = 0x8000;

unsafe extern "C" {
	static ap_trampoline_start: u8;
	static ap_trampoline_end: u8;
	static ap_page_table: u8;
	static ap_entry_function: u8;
	static ap_stack_table: u8;
}

/// The page number the STARTUP IPI carries in its vector field.
pub fn startup_page() -> u8 {
	(TRAMPOLINE_ADDRESS >> 12) as u8
}

fn trampoline_len() -> usize {
	unsafe { ptr::from_ref(&ap_trampoline_end) as usize - ptr::from_ref(&ap_trampoline_start) as usize }
}

fn slot_offset(symbol: &'static u8) -> usize {
	unsafe { ptr::from_ref(symbol) as usize - ptr::from_ref(&ap_trampoline_start) as usize }
}

fn installed_slot(symbol: &'static u8) -> *mut u8 {
	unsafe { mm::phys_to_virt(TRAMPOLINE_ADDRESS).add(slot_offset(symbol)) }
}

/// Copies the trampoline below 1 MiB and patches in the shared page-table
/// root and the 64-bit entry function.
pub fn install(page_table_root: u32, entry: extern "C" fn(u32) -> !) {
	let len = trampoline_len();
	assert!(len <= mm::BASE_PAGE_SIZE, "AP trampoline exceeds one page");
	debug!("AP trampoline is {len} bytes, installing at {TRAMPOLINE_ADDRESS:#x}");

	unsafe {
		ptr::copy_nonoverlapping(
			ptr::from_ref(&ap_trampoline_start),
			mm::phys_to_virt(TRAMPOLINE_ADDRESS),
			len,
		);
		installed_slot(&ap_page_table)
			.cast::<u32>()
			.write_volatile(page_table_root);
		installed_slot(&ap_entry_function)
			.cast::<u64>()
			.write_volatile(entry as usize as u64);
	}
}

/// Publishes the logical id and stack of one CPU in the APIC-id-indexed
/// lookup table of the installed trampoline.
pub fn set_cpu_entry(apic_id: ApicId, logical_id: CpuId, stack_top: *mut u8) {
	assert!(apic_id < 256, "trampoline table is indexed by 8-bit APIC id");

	unsafe {
		let entry = installed_slot(&ap_stack_table)
			.cast::<u64>()
			.add(apic_id as usize * 2);
		entry.write_volatile(u64::from(logical_id));
		entry.add(1).write_volatile(stack_top as u64);
	}
}
