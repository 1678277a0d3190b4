//! The context switch.

use core::arch::naked_asm;

/// Saves the full register state of the calling thread on its own stack,
/// stores the resulting stack pointer through `_old_stack`, adopts
/// `_new_stack`, and restores the state found there. Returns when the
/// old thread is switched back in.
///
/// The frame layout must stay in sync with `State` in
/// `kernel::scheduler`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_old_stack: *mut usize, _new_stack: usize) {
	// rdi = old_stack => the address to store the old rsp
	// rsi = new_stack => stack pointer of the new task
	naked_asm!(
		"pushfq",
		"push rax",
		"push rcx",
		"push rdx",
		"push rbx",
		"push rbp",
		"push rsi",
		"push rdi",
		"push r8",
		"push r9",
		"push r10",
		"push r11",
		"push r12",
		"push r13",
		"push r14",
		"push r15",
		"mov [rdi], rsp",
		"mov rsp, rsi",
		"pop r15",
		"pop r14",
		"pop r13",
		"pop r12",
		"pop r11",
		"pop r10",
		"pop r9",
		"pop r8",
		"pop rdi",
		"pop rsi",
		"pop rbp",
		"pop rbx",
		"pop rdx",
		"pop rcx",
		"pop rax",
		"popfq",
		"ret",
	)
}
