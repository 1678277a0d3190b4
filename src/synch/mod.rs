//! Synchronization primitives built on the cache-coherent atomics of the
//! target architecture. All locks here busy-wait and are therefore usable
//! from any context, including interrupt handlers (use the IRQ-save
//! variants there).

pub mod once;
pub mod rwlock;
pub mod seqlock;
pub mod spinlock;

pub use self::once::OnceCell;
pub use self::rwlock::RwSpinLock;
pub use self::seqlock::SeqLock;
pub use self::spinlock::{SpinLock, SpinLockIrqSave};
