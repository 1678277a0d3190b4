//! Thread control blocks and the per-queue priority buckets.
//!
//! Scheduling state lives in atomics so any CPU may *read* a thread's
//! situation without a lock; every *write* happens under the lock of the
//! run queue the thread currently belongs to (or, before first enqueue,
//! under the thread-table lock). Buckets store reference-counted control
//! blocks; the global table addresses them by their stable id.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::num::NonZeroU32;
use core::sync::atomic::{
	AtomicBool, AtomicI8, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering,
};

use num_enum::TryFromPrimitive;

use crate::arch::kernel::scheduler::TaskStacks;
use crate::config::{DEFAULT_TIMESLICE_TICKS, PRIORITY_LEVELS, SCHED_CLASSES};
use crate::synch::SpinLock;
use crate::topology::CpuId;

/// Returns the most significant bit.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(msb(0), None);
/// assert_eq!(msb(1), Some(0));
/// assert_eq!(msb(u32::MAX), Some(31));
/// ```
#[inline]
pub(crate) fn msb(n: u32) -> Option<u32> {
	NonZeroU32::new(n).map(|n| u32::BITS - 1 - n.leading_zeros())
}

/// Unique identifier for a thread (the OS/2 `TID`).
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
pub struct ThreadId(u32);

impl ThreadId {
	pub const fn into(self) -> u32 {
		self.0
	}

	pub const fn from(x: u32) -> Self {
		ThreadId(x)
	}
}

impl fmt::Display for ThreadId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Identifier of the process owning a thread. The process table is not
/// this crate's concern; the id is kept as a weak back reference.
pub type ProcessId = u32;

/// The status of a thread - used for scheduling
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ThreadState {
	Ready = 0,
	Running = 1,
	Blocked = 2,
	Suspended = 3,
	Zombie = 4,
}

/// Scheduling classes, ordered by dispatch precedence: a ready thread of a
/// higher class always runs before any thread of a lower class.
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum SchedClass {
	Idle = 0,
	Regular = 1,
	Server = 2,
	TimeCritical = 3,
	Realtime = 4,
}

/// Priority level of a thread within its scheduling class.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct Priority(u8);

impl Priority {
	pub const fn into(self) -> u8 {
		self.0
	}

	pub const fn from(x: u8) -> Self {
		Priority(x & (PRIORITY_LEVELS as u8 - 1))
	}
}

impl fmt::Display for Priority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

pub const IDLE_PRIO: Priority = Priority::from(0);
pub const NORMAL_PRIO: Priority = Priority::from(16);

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ThreadFlags: u8 {
		/// The thread may never migrate off its CPU.
		const BOUND = 1 << 0;
		/// A migration between run queues is in flight; the thread is on
		/// no queue and must not be dequeued or re-enqueued by others.
		const MIGRATING = 1 << 1;
		/// The thread was killed and unwinds at its next preemption point.
		const TERMINATING = 1 << 2;
	}
}

/// Bitset over logical CPUs; bit `n` stands for CPU `n`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CpuSet(u64);

impl CpuSet {
	pub const EMPTY: CpuSet = CpuSet(0);
	pub const ALL: CpuSet = CpuSet(u64::MAX);

	pub const fn from_bits(bits: u64) -> Self {
		CpuSet(bits)
	}

	pub const fn single(cpu: CpuId) -> Self {
		CpuSet(1 << cpu)
	}

	pub const fn first_cpus(count: u32) -> Self {
		if count >= 64 {
			CpuSet::ALL
		} else {
			CpuSet((1 << count) - 1)
		}
	}

	pub const fn bits(self) -> u64 {
		self.0
	}

	pub const fn contains(self, cpu: CpuId) -> bool {
		self.0 & (1 << cpu) != 0
	}

	pub const fn intersection(self, other: CpuSet) -> CpuSet {
		CpuSet(self.0 & other.0)
	}

	pub const fn is_empty(self) -> bool {
		self.0 == 0
	}

	/// Lowest-numbered CPU in the set.
	pub fn first(self) -> Option<CpuId> {
		if self.0 == 0 {
			None
		} else {
			Some(self.0.trailing_zeros())
		}
	}

	pub fn insert(&mut self, cpu: CpuId) {
		self.0 |= 1 << cpu;
	}
}

impl fmt::Debug for CpuSet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "CpuSet({:#x})", self.0)
	}
}

/// Sentinel for "no CPU" in `preferred_cpu` and `queued_on`.
pub const NO_CPU: u32 = u32::MAX;

/// Architecture-specific execution context of a thread.
pub struct ThreadContext {
	/// Stack pointer saved by the last context switch away from this
	/// thread. The switch code writes it through a raw pointer.
	pub last_stack_pointer: AtomicUsize,
	pub stacks: SpinLock<Option<TaskStacks>>,
}

impl ThreadContext {
	const fn new() -> Self {
		Self {
			last_stack_pointer: AtomicUsize::new(0),
			stacks: SpinLock::new(None),
		}
	}
}

/// A thread control block.
///
/// Aligned to two cache lines so the hot atomics of different threads never
/// share a line.
#[repr(align(128))]
pub struct Thread {
	/// The ID of this thread
	id: ThreadId,
	/// Owning process
	process: ProcessId,
	/// Scheduling class (`SchedClass` as u8)
	sched_class: AtomicU8,
	/// Priority level assigned by the personality
	base_priority: AtomicU8,
	/// Base priority plus any transient boost, clamped to the level range
	dynamic_priority: AtomicU8,
	/// Status of the thread (`ThreadState` as u8)
	state: AtomicU8,
	/// Remaining time slice in ticks
	timeslice: AtomicU32,
	/// Time slice granted on every dispatch
	timeslice_max: u32,
	/// CPUs this thread may run on
	affinity: AtomicU64,
	/// CPU that ran the thread last, for cache-hot placement
	last_cpu: AtomicU32,
	/// Migration hint; `NO_CPU` when unset
	preferred_cpu: AtomicU32,
	/// Queue the thread is enqueued or sleeping on; `NO_CPU` otherwise
	queued_on: AtomicU32,
	/// Nesting depth of `DosSuspendThread`
	suspend_count: AtomicU32,
	/// Wait channel while blocked; zero when none
	wait_channel: AtomicU64,
	/// Magnitude of the current priority boost
	boost: AtomicI8,
	/// Ticks until the boost decays
	boost_ticks: AtomicU32,
	/// Nesting depth of `DosEnterCritSec`
	critsec_count: AtomicU32,
	flags: AtomicU8,
	/// True from dispatch until the context switch away from this thread
	/// has fully saved its state. Nobody may queue or dispatch the thread
	/// elsewhere while this is set.
	on_cpu: AtomicBool,
	/// Accumulated run time in nanoseconds of queue-clock time
	total_runtime: AtomicU64,
	/// Queue-clock timestamp of the last dispatch
	last_run: AtomicU64,
	voluntary_switches: AtomicU64,
	involuntary_switches: AtomicU64,
	pub(crate) ctx: ThreadContext,
}

impl Thread {
	pub(crate) fn new(
		id: ThreadId,
		process: ProcessId,
		class: SchedClass,
		priority: Priority,
		affinity: CpuSet,
	) -> Self {
		debug!("Creating thread {id} ({class:?}, level {priority})");

		Self {
			id,
			process,
			sched_class: AtomicU8::new(class as u8),
			base_priority: AtomicU8::new(priority.into()),
			dynamic_priority: AtomicU8::new(priority.into()),
			state: AtomicU8::new(ThreadState::Suspended as u8),
			timeslice: AtomicU32::new(DEFAULT_TIMESLICE_TICKS),
			timeslice_max: DEFAULT_TIMESLICE_TICKS,
			affinity: AtomicU64::new(affinity.bits()),
			last_cpu: AtomicU32::new(NO_CPU),
			preferred_cpu: AtomicU32::new(NO_CPU),
			queued_on: AtomicU32::new(NO_CPU),
			suspend_count: AtomicU32::new(0),
			wait_channel: AtomicU64::new(0),
			boost: AtomicI8::new(0),
			boost_ticks: AtomicU32::new(0),
			critsec_count: AtomicU32::new(0),
			flags: AtomicU8::new(ThreadFlags::empty().bits()),
			on_cpu: AtomicBool::new(false),
			total_runtime: AtomicU64::new(0),
			last_run: AtomicU64::new(0),
			voluntary_switches: AtomicU64::new(0),
			involuntary_switches: AtomicU64::new(0),
			ctx: ThreadContext::new(),
		}
	}

	/// The per-CPU idle thread: class Idle, level 0, bound to its CPU,
	/// and never placed on a bucket.
	pub(crate) fn new_idle(id: ThreadId, cpu: CpuId) -> Self {
		debug!("Creating idle thread {id} for CPU {cpu}");

		let idle = Self::new(id, 0, SchedClass::Idle, IDLE_PRIO, CpuSet::single(cpu));
		idle.state.store(ThreadState::Ready as u8, Ordering::Relaxed);
		idle.last_cpu.store(cpu, Ordering::Relaxed);
		idle.insert_flags(ThreadFlags::BOUND);
		idle
	}

	pub fn id(&self) -> ThreadId {
		self.id
	}

	pub fn process(&self) -> ProcessId {
		self.process
	}

	pub fn state(&self) -> ThreadState {
		ThreadState::try_from(self.state.load(Ordering::Acquire)).unwrap()
	}

	pub(crate) fn set_state(&self, state: ThreadState) {
		self.state.store(state as u8, Ordering::Release);
	}

	/// Claims a state transition. Two CPUs may race to make the same
	/// thread Ready (a timed wakeup against an explicit wake); only the
	/// winner of the compare-exchange may enqueue it.
	pub(crate) fn try_transition(&self, from: ThreadState, to: ThreadState) -> bool {
		self.state
			.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	pub fn sched_class(&self) -> SchedClass {
		SchedClass::try_from(self.sched_class.load(Ordering::Relaxed)).unwrap()
	}

	pub(crate) fn set_sched_class(&self, class: SchedClass) {
		self.sched_class.store(class as u8, Ordering::Relaxed);
	}

	pub fn base_priority(&self) -> Priority {
		Priority::from(self.base_priority.load(Ordering::Relaxed))
	}

	pub fn dynamic_priority(&self) -> Priority {
		Priority::from(self.dynamic_priority.load(Ordering::Relaxed))
	}

	/// Dispatch rank; higher runs first. Class outranks level.
	pub(crate) fn rank(&self) -> (u8, u8) {
		(
			self.sched_class.load(Ordering::Relaxed),
			self.dynamic_priority.load(Ordering::Relaxed),
		)
	}

	/// Sets the base level and recomputes the dynamic level from it and
	/// the active boost.
	pub(crate) fn set_base_priority(&self, priority: Priority) {
		self.base_priority.store(priority.into(), Ordering::Relaxed);
		self.recompute_dynamic_priority();
	}

	pub(crate) fn apply_boost(&self, delta: i8, ticks: u32) {
		self.boost.store(delta, Ordering::Relaxed);
		self.boost_ticks.store(ticks, Ordering::Relaxed);
		self.recompute_dynamic_priority();
	}

	/// One tick of boost decay; restores the base level once the countdown
	/// reaches zero. Returns `true` if the dynamic priority changed.
	pub(crate) fn decay_boost(&self) -> bool {
		if self.boost_ticks.load(Ordering::Relaxed) == 0 {
			return false;
		}
		if self.boost_ticks.fetch_sub(1, Ordering::Relaxed) == 1 {
			self.boost.store(0, Ordering::Relaxed);
			self.recompute_dynamic_priority();
			return true;
		}
		false
	}

	fn recompute_dynamic_priority(&self) {
		let base = i16::from(self.base_priority.load(Ordering::Relaxed));
		let boost = i16::from(self.boost.load(Ordering::Relaxed));
		let level = (base + boost).clamp(0, PRIORITY_LEVELS as i16 - 1) as u8;
		self.dynamic_priority.store(level, Ordering::Relaxed);
	}

	pub fn affinity(&self) -> CpuSet {
		CpuSet::from_bits(self.affinity.load(Ordering::Acquire))
	}

	pub(crate) fn set_affinity_mask(&self, mask: CpuSet) {
		self.affinity.store(mask.bits(), Ordering::Release);
	}

	pub fn last_cpu(&self) -> CpuId {
		self.last_cpu.load(Ordering::Relaxed)
	}

	pub(crate) fn set_last_cpu(&self, cpu: CpuId) {
		self.last_cpu.store(cpu, Ordering::Relaxed);
	}

	pub(crate) fn preferred_cpu(&self) -> Option<CpuId> {
		match self.preferred_cpu.load(Ordering::Relaxed) {
			NO_CPU => None,
			cpu => Some(cpu),
		}
	}

	pub(crate) fn set_preferred_cpu(&self, cpu: Option<CpuId>) {
		self.preferred_cpu
			.store(cpu.unwrap_or(NO_CPU), Ordering::Relaxed);
	}

	pub(crate) fn queued_on(&self) -> Option<CpuId> {
		match self.queued_on.load(Ordering::Acquire) {
			NO_CPU => None,
			cpu => Some(cpu),
		}
	}

	pub(crate) fn set_queued_on(&self, cpu: Option<CpuId>) {
		self.queued_on.store(cpu.unwrap_or(NO_CPU), Ordering::Release);
	}

	pub fn suspend_count(&self) -> u32 {
		self.suspend_count.load(Ordering::Relaxed)
	}

	pub(crate) fn inc_suspend_count(&self) -> u32 {
		self.suspend_count.fetch_add(1, Ordering::Relaxed) + 1
	}

	pub(crate) fn dec_suspend_count(&self) -> u32 {
		self.suspend_count.fetch_sub(1, Ordering::Relaxed) - 1
	}

	pub fn wait_channel(&self) -> u64 {
		self.wait_channel.load(Ordering::Relaxed)
	}

	pub(crate) fn set_wait_channel(&self, channel: u64) {
		self.wait_channel.store(channel, Ordering::Relaxed);
	}

	pub(crate) fn critsec_count(&self) -> u32 {
		self.critsec_count.load(Ordering::Relaxed)
	}

	pub(crate) fn inc_critsec_count(&self) -> u32 {
		self.critsec_count.fetch_add(1, Ordering::Relaxed) + 1
	}

	pub(crate) fn dec_critsec_count(&self) -> u32 {
		self.critsec_count.fetch_sub(1, Ordering::Relaxed) - 1
	}

	pub(crate) fn is_on_cpu(&self) -> bool {
		self.on_cpu.load(Ordering::Acquire)
	}

	pub(crate) fn set_on_cpu(&self, on_cpu: bool) {
		self.on_cpu.store(on_cpu, Ordering::Release);
	}

	pub fn flags(&self) -> ThreadFlags {
		ThreadFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
	}

	pub(crate) fn insert_flags(&self, flags: ThreadFlags) {
		self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
	}

	pub(crate) fn remove_flags(&self, flags: ThreadFlags) {
		self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
	}

	pub fn is_bound(&self) -> bool {
		self.flags().contains(ThreadFlags::BOUND)
	}

	pub fn is_idle(&self) -> bool {
		self.sched_class() == SchedClass::Idle
	}

	pub(crate) fn timeslice(&self) -> u32 {
		self.timeslice.load(Ordering::Relaxed)
	}

	pub(crate) fn reset_timeslice(&self) {
		self.timeslice.store(self.timeslice_max, Ordering::Relaxed);
	}

	pub(crate) fn exhaust_timeslice(&self) {
		self.timeslice.store(0, Ordering::Relaxed);
	}

	/// Burns one tick of the slice; returns `true` once it is used up.
	pub(crate) fn consume_timeslice_tick(&self) -> bool {
		let remaining = self.timeslice.load(Ordering::Relaxed);
		if remaining > 1 {
			self.timeslice.store(remaining - 1, Ordering::Relaxed);
			false
		} else {
			self.timeslice.store(0, Ordering::Relaxed);
			true
		}
	}

	pub fn total_runtime_ns(&self) -> u64 {
		self.total_runtime.load(Ordering::Relaxed)
	}

	pub(crate) fn account_runtime(&self, delta_ns: u64) {
		self.total_runtime.fetch_add(delta_ns, Ordering::Relaxed);
	}

	pub fn last_run_ns(&self) -> u64 {
		self.last_run.load(Ordering::Relaxed)
	}

	pub(crate) fn set_last_run_ns(&self, now: u64) {
		self.last_run.store(now, Ordering::Relaxed);
	}

	pub fn voluntary_switches(&self) -> u64 {
		self.voluntary_switches.load(Ordering::Relaxed)
	}

	pub(crate) fn count_voluntary_switch(&self) {
		self.voluntary_switches.fetch_add(1, Ordering::Relaxed);
	}

	pub fn involuntary_switches(&self) -> u64 {
		self.involuntary_switches.load(Ordering::Relaxed)
	}

	pub(crate) fn count_involuntary_switch(&self) {
		self.involuntary_switches.fetch_add(1, Ordering::Relaxed);
	}
}

impl fmt::Debug for Thread {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Thread")
			.field("id", &self.id)
			.field("class", &self.sched_class())
			.field("dynamic_priority", &self.dynamic_priority())
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

/// The ready buckets of one run queue: a `[class][level]` matrix of FIFO
/// queues with one 32-bit occupancy bitmap per class and a 5-bit class
/// bitmap above them, so the highest-ranked ready thread is found with two
/// bit scans.
pub(crate) struct ReadyQueues {
	buckets: [[VecDeque<Arc<Thread>>; PRIORITY_LEVELS]; SCHED_CLASSES],
	/// Bit `l` of `active[c]` is set iff `buckets[c][l]` is non-empty.
	active: [u32; SCHED_CLASSES],
	/// Bit `c` is set iff `active[c]` is non-zero.
	classes: u32,
	count: u32,
}

impl ReadyQueues {
	pub const fn new() -> Self {
		const EMPTY: VecDeque<Arc<Thread>> = VecDeque::new();
		const ROW: [VecDeque<Arc<Thread>>; PRIORITY_LEVELS] = [EMPTY; PRIORITY_LEVELS];
		Self {
			buckets: [ROW; SCHED_CLASSES],
			active: [0; SCHED_CLASSES],
			classes: 0,
			count: 0,
		}
	}

	#[inline]
	fn slot(thread: &Thread) -> (usize, usize) {
		(
			thread.sched_class() as usize,
			thread.dynamic_priority().into() as usize % PRIORITY_LEVELS,
		)
	}

	/// Appends `thread` to the tail of its `(class, level)` bucket.
	pub fn push(&mut self, thread: Arc<Thread>) {
		let (class, level) = Self::slot(&thread);
		self.buckets[class][level].push_back(thread);
		self.active[class] |= 1 << level;
		self.classes |= 1 << class;
		self.count += 1;
	}

	/// Removes and returns the head of the highest non-empty bucket.
	pub fn pop(&mut self) -> Option<Arc<Thread>> {
		let class = msb(self.classes)? as usize;
		let level = msb(self.active[class]).unwrap() as usize;

		let thread = self.buckets[class][level].pop_front();
		if self.buckets[class][level].is_empty() {
			self.active[class] &= !(1 << level);
			if self.active[class] == 0 {
				self.classes &= !(1 << class);
			}
		}
		self.count -= 1;
		thread
	}

	/// Removes a specific thread from its bucket. Returns `true` if the
	/// thread was queued.
	pub fn remove(&mut self, thread: &Thread) -> bool {
		let (class, level) = Self::slot(thread);
		let queue = &mut self.buckets[class][level];

		let Some(index) = queue.iter().position(|queued| queued.id() == thread.id()) else {
			return false;
		};
		queue.remove(index);

		if queue.is_empty() {
			self.active[class] &= !(1 << level);
			if self.active[class] == 0 {
				self.classes &= !(1 << class);
			}
		}
		self.count -= 1;
		true
	}

	/// Rank of the best ready thread, if any.
	pub fn highest_rank(&self) -> Option<(u8, u8)> {
		let class = msb(self.classes)?;
		let level = msb(self.active[class as usize]).unwrap();
		Some((class as u8, level as u8))
	}

	/// First thread satisfying `pred`, scanning the *lowest* class first
	/// and, within a class, the lowest level first, so the most critical
	/// work is considered for migration last.
	pub fn find_migratable(&self, pred: impl Fn(&Thread) -> bool) -> Option<Arc<Thread>> {
		for class in 0..SCHED_CLASSES {
			let mut active = self.active[class];
			while active != 0 {
				let level = active.trailing_zeros() as usize;
				active &= active - 1;
				for thread in &self.buckets[class][level] {
					if pred(thread) {
						return Some(thread.clone());
					}
				}
			}
		}
		None
	}

	pub fn is_empty(&self) -> bool {
		self.classes == 0
	}

	pub fn len(&self) -> u32 {
		self.count
	}

	/// Occupancy bitmap of one class.
	pub fn active_bitmap(&self, class: SchedClass) -> u32 {
		self.active[class as usize]
	}

	/// Bitmap of classes with at least one ready thread.
	pub fn class_bitmap(&self) -> u32 {
		self.classes
	}

	#[cfg(test)]
	pub fn bucket_len(&self, class: SchedClass, level: u8) -> usize {
		self.buckets[class as usize][level as usize].len()
	}

	#[cfg(test)]
	pub fn assert_bitmaps_consistent(&self) {
		let mut total = 0;
		for class in 0..SCHED_CLASSES {
			for level in 0..PRIORITY_LEVELS {
				let occupied = !self.buckets[class][level].is_empty();
				assert_eq!(
					self.active[class] & (1 << level) != 0,
					occupied,
					"bitmap for class {class} level {level} out of sync"
				);
				total += self.buckets[class][level].len() as u32;
			}
			assert_eq!(self.classes & (1 << class) != 0, self.active[class] != 0);
		}
		assert_eq!(self.count, total);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn thread(id: u32, class: SchedClass, level: u8) -> Arc<Thread> {
		let thread = Thread::new(
			ThreadId::from(id),
			1,
			class,
			Priority::from(level),
			CpuSet::ALL,
		);
		thread.set_state(ThreadState::Ready);
		Arc::new(thread)
	}

	#[test]
	fn msb_matches_docs() {
		assert_eq!(msb(0), None);
		assert_eq!(msb(1), Some(0));
		assert_eq!(msb(u32::MAX), Some(31));
	}

	#[test]
	fn pop_order_is_class_then_level_then_fifo() {
		let mut ready = ReadyQueues::new();
		ready.push(thread(1, SchedClass::Regular, 16));
		ready.push(thread(2, SchedClass::Regular, 16));
		ready.push(thread(3, SchedClass::Regular, 31));
		ready.push(thread(4, SchedClass::TimeCritical, 0));

		// Class beats level; level beats FIFO age; FIFO breaks ties.
		assert_eq!(ready.pop().unwrap().id(), ThreadId::from(4));
		assert_eq!(ready.pop().unwrap().id(), ThreadId::from(3));
		assert_eq!(ready.pop().unwrap().id(), ThreadId::from(1));
		assert_eq!(ready.pop().unwrap().id(), ThreadId::from(2));
		assert!(ready.pop().is_none());
		ready.assert_bitmaps_consistent();
	}

	#[test]
	fn bitmaps_track_buckets() {
		let mut ready = ReadyQueues::new();
		assert_eq!(ready.class_bitmap(), 0);

		let first = thread(1, SchedClass::Server, 5);
		let second = thread(2, SchedClass::Server, 5);
		ready.push(first.clone());
		ready.push(second);
		assert_eq!(ready.active_bitmap(SchedClass::Server), 1 << 5);
		assert_eq!(ready.class_bitmap(), 1 << SchedClass::Server as u32);

		// Removing one of two leaves the bit set.
		assert!(ready.remove(&first));
		assert_eq!(ready.active_bitmap(SchedClass::Server), 1 << 5);
		ready.pop().unwrap();
		assert_eq!(ready.active_bitmap(SchedClass::Server), 0);
		assert_eq!(ready.class_bitmap(), 0);
		ready.assert_bitmaps_consistent();
	}

	#[test]
	fn push_remove_leaves_queue_identical() {
		let mut ready = ReadyQueues::new();
		ready.push(thread(1, SchedClass::Regular, 10));
		ready.push(thread(2, SchedClass::Regular, 10));
		ready.push(thread(3, SchedClass::TimeCritical, 2));

		let visitor = thread(9, SchedClass::Regular, 10);
		ready.push(visitor.clone());
		assert!(ready.remove(&visitor));

		assert_eq!(ready.len(), 3);
		assert_eq!(ready.bucket_len(SchedClass::Regular, 10), 2);
		ready.assert_bitmaps_consistent();
		assert_eq!(ready.pop().unwrap().id(), ThreadId::from(3));
		assert_eq!(ready.pop().unwrap().id(), ThreadId::from(1));
		assert_eq!(ready.pop().unwrap().id(), ThreadId::from(2));
	}

	#[test]
	fn migratable_scan_prefers_lowest_class() {
		let mut ready = ReadyQueues::new();
		ready.push(thread(1, SchedClass::TimeCritical, 0));
		ready.push(thread(2, SchedClass::Regular, 31));
		ready.push(thread(3, SchedClass::Regular, 3));

		let victim = ready.find_migratable(|_| true).unwrap();
		assert_eq!(victim.id(), ThreadId::from(3));

		let none = ready.find_migratable(|t| t.id() == ThreadId::from(99));
		assert!(none.is_none());
	}

	#[test]
	fn boost_clamps_and_decays() {
		let t = thread(1, SchedClass::Regular, 30);
		t.apply_boost(5, 2);
		assert_eq!(t.dynamic_priority(), Priority::from(31));
		assert!(!t.decay_boost());
		assert!(t.decay_boost());
		assert_eq!(t.dynamic_priority(), Priority::from(30));
		assert!(!t.decay_boost());

		t.apply_boost(-100, 1);
		assert_eq!(t.dynamic_priority(), Priority::from(0));
		assert!(t.decay_boost());
		assert_eq!(t.dynamic_priority(), t.base_priority());
	}

	#[test]
	fn cpu_sets() {
		let mut set = CpuSet::first_cpus(4);
		assert!(set.contains(0) && set.contains(3) && !set.contains(4));
		assert_eq!(set.first(), Some(0));
		set.insert(7);
		assert_eq!(set.intersection(CpuSet::single(7)), CpuSet::single(7));
		assert!(CpuSet::EMPTY.is_empty());
		assert_eq!(CpuSet::first_cpus(64), CpuSet::ALL);
	}
}
