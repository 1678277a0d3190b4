#![allow(dead_code)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering, fence};

use crossbeam_utils::Backoff;

use crate::synch::spinlock::SpinLock;

/// A sequence lock for small, copyable records that are read often and
/// written rarely (per-CPU frequency data, clock parameters).
///
/// Writers serialize on an internal spinlock and bump the sequence counter
/// to an odd value for the duration of the write. Readers snapshot the
/// counter, copy the data, and retry whenever the counter changed or was
/// odd, so they never block a writer and never return a torn value.
pub struct SeqLock<T> {
	sequence: AtomicU32,
	writer: SpinLock<()>,
	data: UnsafeCell<T>,
}

unsafe impl<T: Copy + Send> Send for SeqLock<T> {}
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
	pub const fn new(user_data: T) -> Self {
		Self {
			sequence: AtomicU32::new(0),
			writer: SpinLock::new(()),
			data: UnsafeCell::new(user_data),
		}
	}

	pub fn read(&self) -> T {
		let backoff = Backoff::new();
		loop {
			let start = self.sequence.load(Ordering::Acquire);
			if start & 1 != 0 {
				// A write is in flight.
				backoff.spin();
				continue;
			}

			let value = unsafe { core::ptr::read_volatile(self.data.get()) };

			fence(Ordering::Acquire);
			if self.sequence.load(Ordering::Relaxed) == start {
				return value;
			}
			backoff.spin();
		}
	}

	pub fn write(&self, value: T) {
		self.update(|slot| *slot = value);
	}

	pub fn update(&self, f: impl FnOnce(&mut T)) {
		let _guard = self.writer.lock();

		self.sequence.fetch_add(1, Ordering::Relaxed);
		fence(Ordering::Release);
		f(unsafe { &mut *self.data.get() });
		fence(Ordering::Release);
		self.sequence.fetch_add(1, Ordering::Release);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::thread;

	use super::*;

	#[test]
	fn read_returns_latest_write() {
		let lock = SeqLock::new((1u64, 2u64));
		assert_eq!(lock.read(), (1, 2));
		lock.write((3, 4));
		assert_eq!(lock.read(), (3, 4));
	}

	#[test]
	fn readers_never_see_torn_pairs() {
		// Both halves of the pair are always written together; a torn read
		// would surface as mismatched halves.
		let lock = Arc::new(SeqLock::new((0u64, 0u64)));
		let stop = Arc::new(AtomicBool::new(false));

		let writer = {
			let lock = lock.clone();
			let stop = stop.clone();
			thread::spawn(move || {
				let mut i = 0u64;
				while !stop.load(Ordering::Relaxed) {
					i += 1;
					lock.write((i, !i));
				}
			})
		};

		let mut readers = std::vec::Vec::new();
		for _ in 0..4 {
			let lock = lock.clone();
			let stop = stop.clone();
			readers.push(thread::spawn(move || {
				while !stop.load(Ordering::Relaxed) {
					let (a, b) = lock.read();
					assert_eq!(b, !a);
				}
			}));
		}

		thread::sleep(std::time::Duration::from_millis(50));
		stop.store(true, Ordering::Relaxed);
		writer.join().unwrap();
		for reader in readers {
			reader.join().unwrap();
		}
	}
}
