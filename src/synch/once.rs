#![allow(dead_code)]

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

use crossbeam_utils::Backoff;

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;

/// A cell that is written exactly once, early during boot, and read
/// lock-free afterwards. Concurrent readers during the (single-threaded)
/// initialization window spin until the value is published.
pub struct OnceCell<T> {
	state: AtomicU8,
	data: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send + Sync> Sync for OnceCell<T> {}
unsafe impl<T: Send> Send for OnceCell<T> {}

impl<T> OnceCell<T> {
	pub const fn new() -> Self {
		Self {
			state: AtomicU8::new(UNINITIALIZED),
			data: UnsafeCell::new(MaybeUninit::uninit()),
		}
	}

	/// Publishes `value`. Fails if the cell was already set.
	pub fn set(&self, value: T) -> Result<(), T> {
		match self.state.compare_exchange(
			UNINITIALIZED,
			INITIALIZING,
			Ordering::Acquire,
			Ordering::Relaxed,
		) {
			Ok(_) => {
				unsafe {
					(*self.data.get()).write(value);
				}
				self.state.store(INITIALIZED, Ordering::Release);
				Ok(())
			}
			Err(_) => Err(value),
		}
	}

	pub fn get(&self) -> Option<&T> {
		let backoff = Backoff::new();
		loop {
			match self.state.load(Ordering::Acquire) {
				INITIALIZED => return Some(unsafe { (*self.data.get()).assume_init_ref() }),
				UNINITIALIZED => return None,
				_ => backoff.spin(),
			}
		}
	}
}

impl<T> Drop for OnceCell<T> {
	fn drop(&mut self) {
		if *self.state.get_mut() == INITIALIZED {
			unsafe {
				self.data.get_mut().assume_init_drop();
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_once() {
		let cell = OnceCell::new();
		assert!(cell.get().is_none());
		assert!(cell.set(3).is_ok());
		assert_eq!(cell.set(4), Err(4));
		assert_eq!(cell.get(), Some(&3));
	}
}
