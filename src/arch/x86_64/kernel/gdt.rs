//! Per-CPU global descriptor table and task-state segment.

#![allow(dead_code)]

#[cfg(target_os = "none")]
mod imp {
	use alloc::boxed::Box;

	use x86_64::VirtAddr;
	use x86_64::instructions::tables;
	use x86_64::registers::segmentation::{CS, DS, ES, SS, Segment};
	use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
	use x86_64::structures::tss::TaskStateSegment;

	use crate::config::KERNEL_STACK_SIZE;
	use crate::mm;

	/// Builds and loads this CPU's descriptor table. Each CPU gets its
	/// own TSS whose interrupt stack keeps fault handling off the thread
	/// stacks.
	pub fn add_current_core() {
		let tss = Box::leak(Box::new(TaskStateSegment::new()));

		let ist = mm::alloc_pages(mm::order_for(KERNEL_STACK_SIZE))
			.expect("no memory for the interrupt stack");
		tss.interrupt_stack_table[0] =
			VirtAddr::from_ptr(ist.as_ptr()) + KERNEL_STACK_SIZE as u64;

		let gdt = Box::leak(Box::new(GlobalDescriptorTable::new()));
		let kernel_code = gdt.append(Descriptor::kernel_code_segment());
		let kernel_data = gdt.append(Descriptor::kernel_data_segment());
		let tss_selector = gdt.append(Descriptor::tss_segment(tss));
		gdt.load();

		unsafe {
			CS::set_reg(kernel_code);
			DS::set_reg(kernel_data);
			ES::set_reg(kernel_data);
			SS::set_reg(kernel_data);
			tables::load_tss(tss_selector);
		}
	}
}

#[cfg(target_os = "none")]
pub use imp::add_current_core;

#[cfg(not(target_os = "none"))]
pub fn add_current_core() {}
