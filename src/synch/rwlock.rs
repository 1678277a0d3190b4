#![allow(dead_code)]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::synch::spinlock::{SpinLock, SpinLockGuard};

/// A writer holds the counter at this value.
const WRITER: i32 = -1;

/// A busy-waiting reader/writer lock.
///
/// # Description
///
/// The state is a signed counter: `0` means free, a positive value counts
/// the active readers, and [`WRITER`] marks an exclusive holder. Writers
/// first serialize on an internal ticket lock (so competing writers queue
/// fairly among themselves), raise a writer-pending flag, and then wait
/// for the counter to drain to zero. New readers back off while the flag
/// is raised, which keeps a stream of readers from starving the writer.
pub struct RwSpinLock<T: ?Sized> {
	/// Serializes writers; held for the whole write critical section.
	writer_queue: SpinLock<()>,
	counter: CachePadded<AtomicI32>,
	writer_pending: AtomicBool,
	data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwSpinLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwSpinLock<T> {}

pub struct RwSpinLockReadGuard<'a, T: ?Sized> {
	counter: &'a AtomicI32,
	data: &'a T,
}

pub struct RwSpinLockWriteGuard<'a, T: ?Sized> {
	counter: &'a AtomicI32,
	data: &'a mut T,
	_queue: SpinLockGuard<'a, ()>,
}

impl<T> RwSpinLock<T> {
	pub const fn new(user_data: T) -> Self {
		Self {
			writer_queue: SpinLock::new(()),
			counter: CachePadded::new(AtomicI32::new(0)),
			writer_pending: AtomicBool::new(false),
			data: UnsafeCell::new(user_data),
		}
	}

	pub fn into_inner(self) -> T {
		let RwSpinLock { data, .. } = self;
		data.into_inner()
	}
}

impl<T: ?Sized> RwSpinLock<T> {
	pub fn read(&self) -> RwSpinLockReadGuard<'_, T> {
		let backoff = Backoff::new();
		loop {
			if let Some(guard) = self.try_read() {
				return guard;
			}
			backoff.spin();
		}
	}

	pub fn try_read(&self) -> Option<RwSpinLockReadGuard<'_, T>> {
		if self.writer_pending.load(Ordering::Relaxed) {
			return None;
		}

		let n = self.counter.load(Ordering::Relaxed);
		if n < 0 {
			return None;
		}

		self.counter
			.compare_exchange_weak(n, n + 1, Ordering::Acquire, Ordering::Relaxed)
			.ok()
			.map(|_| RwSpinLockReadGuard {
				counter: &self.counter,
				data: unsafe { &*self.data.get() },
			})
	}

	pub fn write(&self) -> RwSpinLockWriteGuard<'_, T> {
		let queue = self.writer_queue.lock();
		self.writer_pending.store(true, Ordering::Relaxed);

		let backoff = Backoff::new();
		while self
			.counter
			.compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			backoff.spin();
		}
		self.writer_pending.store(false, Ordering::Relaxed);

		RwSpinLockWriteGuard {
			counter: &self.counter,
			data: unsafe { &mut *self.data.get() },
			_queue: queue,
		}
	}

	pub fn try_write(&self) -> Option<RwSpinLockWriteGuard<'_, T>> {
		let queue = self.writer_queue.try_lock().ok()?;
		self.counter
			.compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
			.ok()
			.map(|_| RwSpinLockWriteGuard {
				counter: &self.counter,
				data: unsafe { &mut *self.data.get() },
				_queue: queue,
			})
	}
}

impl<T: ?Sized + Default> Default for RwSpinLock<T> {
	fn default() -> Self {
		RwSpinLock::new(Default::default())
	}
}

impl<'a, T: ?Sized> Deref for RwSpinLockReadGuard<'a, T> {
	type Target = T;
	fn deref(&self) -> &T {
		self.data
	}
}

impl<'a, T: ?Sized> Drop for RwSpinLockReadGuard<'a, T> {
	fn drop(&mut self) {
		self.counter.fetch_sub(1, Ordering::Release);
	}
}

impl<'a, T: ?Sized> Deref for RwSpinLockWriteGuard<'a, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&*self.data
	}
}

impl<'a, T: ?Sized> DerefMut for RwSpinLockWriteGuard<'a, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut *self.data
	}
}

impl<'a, T: ?Sized> Drop for RwSpinLockWriteGuard<'a, T> {
	fn drop(&mut self) {
		self.counter.store(0, Ordering::Release);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::thread;
	use std::vec::Vec;

	use super::*;

	#[test]
	fn readers_share() {
		let lock = RwSpinLock::new(7);
		let r1 = lock.read();
		let r2 = lock.read();
		assert_eq!(*r1 + *r2, 14);
		assert!(lock.try_write().is_none());
		drop(r1);
		assert!(lock.try_write().is_none());
		drop(r2);
		assert!(lock.try_write().is_some());
	}

	#[test]
	fn writer_excludes_readers() {
		let lock = RwSpinLock::new(0);
		let w = lock.write();
		assert!(lock.try_read().is_none());
		drop(w);
		assert!(lock.try_read().is_some());
	}

	#[test]
	fn contended_counts_add_up() {
		let lock = Arc::new(RwSpinLock::new(0u64));
		let mut handles = Vec::new();

		for worker in 0..8 {
			let lock = lock.clone();
			handles.push(thread::spawn(move || {
				for _ in 0..500 {
					if worker % 2 == 0 {
						*lock.write() += 1;
					} else {
						// Readers must never observe a torn value.
						let snapshot = *lock.read();
						assert!(snapshot <= 2000);
					}
				}
			}));
		}
		for handle in handles {
			handle.join().unwrap();
		}

		assert_eq!(*lock.read(), 2000);
	}
}
