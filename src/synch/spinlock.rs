#![allow(dead_code)]

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU16, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::arch::interrupts;

/// Ticket state of a lock. `head` is the ticket currently being served,
/// `tail` the next ticket to issue; the lock is free iff `head == tail`.
/// The two halves share a single naturally-aligned 32-bit word so the
/// whole state moves in one cache-line transfer.
#[repr(C, align(4))]
struct TicketState {
	head: AtomicU16,
	tail: AtomicU16,
}

impl TicketState {
	const fn new() -> Self {
		Self {
			head: AtomicU16::new(0),
			tail: AtomicU16::new(0),
		}
	}

	#[inline]
	fn take_ticket(&self) -> u16 {
		self.tail.fetch_add(1, Ordering::Relaxed)
	}

	#[inline]
	fn wait_for(&self, ticket: u16) {
		let backoff = Backoff::new();
		while self.head.load(Ordering::Acquire) != ticket {
			backoff.spin();
		}
	}

	/// Issue a ticket only if the lock is currently free. Incrementing
	/// `tail` with a compare-exchange against the observed `head` fails
	/// whenever another waiter already holds or has queued for the lock.
	#[inline]
	fn try_take_ticket(&self) -> Result<u16, ()> {
		let head = self.head.load(Ordering::Relaxed);
		self.tail
			.compare_exchange(
				head,
				head.wrapping_add(1),
				Ordering::Acquire,
				Ordering::Relaxed,
			)
			.map_err(|_| ())
	}

	#[inline]
	fn serve_next(&self) {
		self.head.fetch_add(1, Ordering::Release);
	}
}

/// This type provides a lock based on busy waiting to realize mutual
/// exclusion.
///
/// # Description
///
/// This structure behaves a lot like a normal Mutex. There are some
/// differences:
///
/// - By using busy waiting, it can be used outside the runtime.
/// - It is a so called ticket lock (<https://en.wikipedia.org/wiki/Ticket_lock>)
///   and completely fair: waiters acquire in the order their tickets were
///   issued, so no waiter starves.
///
/// # Simple examples
///
/// ```
/// use warpk::synch::SpinLock;
///
/// let spinlock = SpinLock::new(0);
///
/// // Modify the data
/// {
///     let mut data = spinlock.lock();
///     *data = 2;
/// }
///
/// // Read the data
/// let answer = {
///     let data = spinlock.lock();
///     *data
/// };
///
/// assert_eq!(answer, 2);
/// ```
pub struct SpinLock<T: ?Sized> {
	state: CachePadded<TicketState>,
	data: UnsafeCell<T>,
}

/// A guard to which the protected data can be accessed
///
/// When the guard falls out of scope it will release the lock.
pub struct SpinLockGuard<'a, T: ?Sized> {
	state: &'a TicketState,
	ticket: u16,
	data: &'a mut T,
}

// Same unsafe impls as `std::sync::Mutex`
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
	pub const fn new(user_data: T) -> SpinLock<T> {
		SpinLock {
			state: CachePadded::new(TicketState::new()),
			data: UnsafeCell::new(user_data),
		}
	}

	/// Consumes this mutex, returning the underlying data.
	pub fn into_inner(self) -> T {
		// We know statically that there are no outstanding references to
		// `self` so there's no need to lock.
		let SpinLock { data, .. } = self;
		data.into_inner()
	}
}

impl<T: ?Sized> SpinLock<T> {
	pub fn lock(&self) -> SpinLockGuard<'_, T> {
		let ticket = self.state.take_ticket();
		self.state.wait_for(ticket);

		SpinLockGuard {
			state: &self.state,
			ticket,
			data: unsafe { &mut *self.data.get() },
		}
	}

	pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, ()> {
		self.state.try_take_ticket().map(|ticket| SpinLockGuard {
			state: &self.state,
			ticket,
			data: unsafe { &mut *self.data.get() },
		})
	}
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"head: {} tail: {}",
			self.state.head.load(Ordering::Relaxed),
			self.state.tail.load(Ordering::Relaxed)
		)
	}
}

impl<T: ?Sized + Default> Default for SpinLock<T> {
	fn default() -> SpinLock<T> {
		SpinLock::new(Default::default())
	}
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
	/// The ticket this guard acquired the lock with.
	pub fn ticket(&self) -> u16 {
		self.ticket
	}
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&*self.data
	}
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut *self.data
	}
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
	/// The dropping of the SpinLockGuard will release the lock it was
	/// created from.
	fn drop(&mut self) {
		self.state.serve_next();
	}
}

/// An interrupt-save variant of [`SpinLock`].
///
/// # Description
///
/// Acquiring the lock captures the architectural interrupt-enable flag and
/// disables interrupts before queueing for a ticket; dropping the guard
/// restores the captured flag exactly after the lock is released. This
/// makes the lock usable for data shared with interrupt handlers: the
/// holder cannot be interrupted on its own CPU, and other CPUs queue
/// fairly behind it.
///
/// Every run queue of the scheduler is guarded by one of these.
pub struct SpinLockIrqSave<T: ?Sized> {
	state: CachePadded<TicketState>,
	data: UnsafeCell<T>,
}

/// A guard to which the protected data can be accessed
///
/// When the guard falls out of scope it will release the lock.
pub struct SpinLockIrqSaveGuard<'a, T: ?Sized> {
	state: &'a TicketState,
	ticket: u16,
	irq: bool,
	data: &'a mut T,
}

// Same unsafe impls as `SpinLock`
unsafe impl<T: ?Sized + Send> Sync for SpinLockIrqSave<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLockIrqSave<T> {}

impl<T> SpinLockIrqSave<T> {
	pub const fn new(user_data: T) -> SpinLockIrqSave<T> {
		SpinLockIrqSave {
			state: CachePadded::new(TicketState::new()),
			data: UnsafeCell::new(user_data),
		}
	}

	/// Consumes this mutex, returning the underlying data.
	pub fn into_inner(self) -> T {
		let SpinLockIrqSave { data, .. } = self;
		data.into_inner()
	}
}

impl<T: ?Sized> SpinLockIrqSave<T> {
	pub fn lock(&self) -> SpinLockIrqSaveGuard<'_, T> {
		let irq = interrupts::nested_disable();
		let ticket = self.state.take_ticket();
		self.state.wait_for(ticket);

		SpinLockIrqSaveGuard {
			state: &self.state,
			ticket,
			irq,
			data: unsafe { &mut *self.data.get() },
		}
	}

	pub fn try_lock(&self) -> Result<SpinLockIrqSaveGuard<'_, T>, ()> {
		let irq = interrupts::nested_disable();

		match self.state.try_take_ticket() {
			Ok(ticket) => Ok(SpinLockIrqSaveGuard {
				state: &self.state,
				ticket,
				irq,
				data: unsafe { &mut *self.data.get() },
			}),
			Err(()) => {
				interrupts::nested_enable(irq);
				Err(())
			}
		}
	}
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLockIrqSave<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"head: {} tail: {}",
			self.state.head.load(Ordering::Relaxed),
			self.state.tail.load(Ordering::Relaxed)
		)
	}
}

impl<T: ?Sized + Default> Default for SpinLockIrqSave<T> {
	fn default() -> SpinLockIrqSave<T> {
		SpinLockIrqSave::new(Default::default())
	}
}

impl<'a, T: ?Sized> Deref for SpinLockIrqSaveGuard<'a, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&*self.data
	}
}

impl<'a, T: ?Sized> DerefMut for SpinLockIrqSaveGuard<'a, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut *self.data
	}
}

impl<'a, T: ?Sized> Drop for SpinLockIrqSaveGuard<'a, T> {
	/// The dropping of the SpinLockIrqSaveGuard will release the lock it
	/// was created from and restore the captured interrupt state.
	fn drop(&mut self) {
		self.state.serve_next();
		interrupts::nested_enable(self.irq);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::thread;
	use std::vec::Vec;

	use super::*;

	#[test]
	fn exclusion() {
		let counter = Arc::new(SpinLock::new(0u64));
		let mut handles = Vec::new();

		for _ in 0..8 {
			let counter = counter.clone();
			handles.push(thread::spawn(move || {
				for _ in 0..1000 {
					*counter.lock() += 1;
				}
			}));
		}
		for handle in handles {
			handle.join().unwrap();
		}

		assert_eq!(*counter.lock(), 8000);
	}

	#[test]
	fn tickets_served_in_issue_order() {
		// Every successful acquisition appends its ticket while still
		// holding the lock, so the recorded sequence is the service order.
		let lock = Arc::new(SpinLock::new(Vec::new()));
		let mut handles = Vec::new();

		for _ in 0..8 {
			let lock = lock.clone();
			handles.push(thread::spawn(move || {
				let mut own = Vec::with_capacity(1000);
				for _ in 0..1000 {
					let mut served = lock.lock();
					let ticket = served.ticket();
					served.push(ticket);
					own.push(ticket);
				}
				own
			}));
		}

		for handle in handles {
			let own = handle.join().unwrap();
			// Each thread's tickets grow strictly (modulo 2^16).
			for pair in own.windows(2) {
				assert_ne!(pair[1].wrapping_sub(pair[0]), 0);
			}
		}

		let served = lock.lock();
		assert_eq!(served.len(), 8000);
		for (i, ticket) in served.iter().enumerate() {
			assert_eq!(*ticket, (i as u16).wrapping_add(served[0]));
		}
	}

	#[test]
	fn try_lock_fails_while_held() {
		let lock = SpinLock::new(());
		let guard = lock.lock();
		assert!(lock.try_lock().is_err());
		drop(guard);
		assert!(lock.try_lock().is_ok());
	}

	#[test]
	fn ticket_wraparound() {
		let lock = SpinLock::new(0u32);
		for _ in 0..0x1_0002u32 {
			*lock.lock() += 1;
		}
		assert_eq!(*lock.lock(), 0x1_0002);
		assert!(lock.try_lock().is_ok());
	}

	#[test]
	fn irqsave_roundtrip() {
		let lock = SpinLockIrqSave::new(5);
		{
			let mut guard = lock.lock();
			*guard += 1;
			assert!(lock.try_lock().is_err());
		}
		assert_eq!(*lock.lock(), 6);
	}
}
