//! Architecture dependent interface to initialize a task

#![allow(dead_code)]

use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::config::{DEFAULT_STACK_SIZE, KERNEL_STACK_SIZE};
use crate::mm;
use crate::scheduler::Thread;

/// Debug marker kept at the very top of each stack; must never be
/// overwritten.
const STACK_MARKER: u64 = 0xDEAD_BEEF_DEAD_BEEF;
const MARKER_SIZE: usize = 0x10;

/// The kernel stack of one thread.
pub struct TaskStacks {
	block: NonNull<u8>,
	order: u32,
	size: usize,
}

unsafe impl Send for TaskStacks {}

impl TaskStacks {
	pub fn new(size: usize) -> Option<TaskStacks> {
		let size = size.max(KERNEL_STACK_SIZE);
		let order = mm::order_for(size);
		let block = mm::alloc_pages(order)?;

		debug!("Created stack at {block:p} with a size of {} KiB", size >> 10);
		unsafe {
			block
				.as_ptr()
				.add(size - MARKER_SIZE)
				.cast::<u64>()
				.write(STACK_MARKER);
		}

		Some(TaskStacks {
			block,
			order,
			size,
		})
	}

	pub fn default_size() -> usize {
		DEFAULT_STACK_SIZE
	}

	pub fn stack_top(&self) -> *mut u8 {
		unsafe { self.block.as_ptr().add(self.size) }
	}

	pub fn size(&self) -> usize {
		self.size
	}
}

impl Drop for TaskStacks {
	fn drop(&mut self) {
		debug!("Dropping stack at {:p}", self.block);
		mm::free_pages(self.block, self.order);
	}
}

/// Saved register frame, in the exact layout the context switch pushes
/// and pops it.
#[repr(C, packed)]
struct State {
	r15: u64,
	r14: u64,
	r13: u64,
	r12: u64,
	r11: u64,
	r10: u64,
	r9: u64,
	r8: u64,
	rdi: u64,
	rsi: u64,
	rbp: u64,
	rbx: u64,
	rdx: u64,
	rcx: u64,
	rax: u64,
	/// status flags
	rflags: u64,
	/// instruction pointer
	rip: u64,
}

/// Interrupts enabled, reserved bit set.
const INITIAL_RFLAGS: u64 = 0x202;

/// First code a newly created thread runs: complete the switch that
/// activated it, run its body, and terminate cleanly if the body
/// returns.
extern "C" fn task_entry(func: unsafe extern "C" fn(usize), arg: usize) -> ! {
	crate::scheduler::after_switch();
	unsafe {
		func(arg);
	}
	crate::scheduler::exit_current()
}

/// Builds the initial switch frame for `thread` so that the first switch
/// to it "returns" into [`task_entry`] with `func` and `arg` in the
/// argument registers.
pub fn create_stack_frame(
	thread: &Thread,
	stacks: &TaskStacks,
	func: unsafe extern "C" fn(usize),
	arg: usize,
) {
	// Entry via `ret` must leave the stack pointer 8 bytes past a
	// 16-byte boundary, like a regular call would.
	let frame_top = unsafe { stacks.stack_top().sub(MARKER_SIZE + 8) };
	let state = unsafe { frame_top.sub(size_of::<State>()).cast::<State>() };

	unsafe {
		state.write(State {
			r15: 0,
			r14: 0,
			r13: 0,
			r12: 0,
			r11: 0,
			r10: 0,
			r9: 0,
			r8: 0,
			rdi: func as usize as u64,
			rsi: arg as u64,
			rbp: 0,
			rbx: 0,
			rdx: 0,
			rcx: 0,
			rax: 0,
			rflags: INITIAL_RFLAGS,
			rip: task_entry as usize as u64,
		});
	}

	thread
		.ctx
		.last_stack_pointer
		.store(state as usize, Ordering::Release);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stacks_are_at_least_minimum_sized() {
		let stacks = TaskStacks::new(1).unwrap();
		assert!(stacks.size() >= KERNEL_STACK_SIZE);
		let top = stacks.stack_top() as usize;
		assert_eq!(top % mm::BASE_PAGE_SIZE, 0);
	}

	#[test]
	fn initial_frame_lands_inside_the_stack() {
		use alloc::sync::Arc;

		use crate::scheduler::{CpuSet, Priority, SchedClass, Thread, ThreadId};

		unsafe extern "C" fn body(_arg: usize) {}

		let thread = Arc::new(Thread::new(
			ThreadId::from(99),
			1,
			SchedClass::Regular,
			Priority::from(16),
			CpuSet::ALL,
		));
		let stacks = TaskStacks::new(TaskStacks::default_size()).unwrap();
		create_stack_frame(&thread, &stacks, body, 7);

		let sp = thread.ctx.last_stack_pointer.load(Ordering::Acquire);
		let base = stacks.stack_top() as usize - stacks.size();
		assert!(sp > base && sp < stacks.stack_top() as usize);
		// The switch frame ends 8 bytes past a 16-byte boundary.
		assert_eq!((sp + size_of::<State>()) % 16, 8);
	}
}
