//! The per-CPU scheduler.
//!
//! Every CPU owns one run queue; most operations touch only the local
//! queue under its IRQ-safe ticket lock. Cross-CPU operations (wakeups,
//! affinity changes, migration) take the *target* queue's lock and signal
//! the owner with a reschedule IPI - never two queue locks at once. The
//! lock order is: scheduler global lock, then wait-channel map, then a
//! single run-queue lock, then the cross-call broadcast lock.

pub mod balance;
pub mod task;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;
use thiserror::Error;

use crate::arch;
use crate::config::{LOAD_BALANCE_INTERVAL_TICKS, PRIORITY_LEVELS, TICK_PERIOD_NS};
use crate::synch::{OnceCell, RwSpinLock, SpinLock, SpinLockIrqSave};
use crate::topology::{CpuId, SystemTopology};

pub use self::task::{
	CpuSet, Priority, ProcessId, SchedClass, Thread, ThreadFlags, ThreadId, ThreadState,
};
use self::task::ReadyQueues;

/// Wait channels with the top bit set are kernel-internal; the personality
/// never hands them out.
const KERNEL_CHANNEL_BASE: u64 = 1 << 63;

/// Channel a thread's reapers wait on until it exits.
pub(crate) fn exit_channel(id: ThreadId) -> u64 {
	KERNEL_CHANNEL_BASE | u64::from(id.into())
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
	#[error("invalid parameter")]
	InvalidParameter,
	#[error("no thread with the requested id")]
	InvalidThreadId,
	#[error("priority class out of range")]
	InvalidPriorityClass,
	#[error("priority delta out of range")]
	InvalidPriorityDelta,
	#[error("thread is not suspended")]
	NotFrozen,
	#[error("critical-section count already zero")]
	CritSecUnderflow,
	#[error("out of memory")]
	OutOfMemory,
}

/// A thread parked on the sleep list of a run queue.
struct Sleeper {
	wakeup_ns: u64,
	thread: Arc<Thread>,
}

struct RunQueueInner {
	ready: ReadyQueues,
	/// Thread occupying this CPU; the idle thread when there is nothing
	/// else to do.
	current: Option<Arc<Thread>>,
	idle: Option<Arc<Thread>>,
	/// Monotonic queue clock, advanced by the timer tick.
	clock_ns: u64,
	ticks: u64,
	switches: u64,
	/// Exponentially decayed run-queue length, scaled by 1024.
	load_estimate: u32,
	last_balance_ns: u64,
	/// Blocked threads with a wakeup deadline, ordered by deadline.
	sleepers: VecDeque<Sleeper>,
	/// Threads displaced by an affinity change, waiting for their old
	/// context to be switched away before they may be re-enqueued
	/// elsewhere.
	displaced: VecDeque<Arc<Thread>>,
	/// The thread last switched away from, so the incoming thread can
	/// mark its context as fully saved.
	departing: Option<Arc<Thread>>,
	idle_ns: u64,
	busy_ns: u64,
}

/// One per CPU, aligned so the queue lock and the hot counters of
/// different CPUs never share a cache line.
#[repr(align(128))]
pub(crate) struct RunQueue {
	cpu: CpuId,
	/// Ready threads plus the (non-idle) current one. Mirrored outside
	/// the lock so the balancer can size up queues without taking it.
	nr_running: AtomicU32,
	/// Set when the CPU should reschedule at the next opportunity.
	resched: AtomicBool,
	/// Preemption depth; while positive, `schedule` only switches away
	/// from threads that are leaving the Running state.
	preempt_depth: AtomicU32,
	inner: SpinLockIrqSave<RunQueueInner>,
}

impl RunQueue {
	fn new(cpu: CpuId) -> Self {
		Self {
			cpu,
			nr_running: AtomicU32::new(0),
			resched: AtomicBool::new(false),
			preempt_depth: AtomicU32::new(0),
			inner: SpinLockIrqSave::new(RunQueueInner {
				ready: ReadyQueues::new(),
				current: None,
				idle: None,
				clock_ns: 0,
				ticks: 0,
				switches: 0,
				load_estimate: 0,
				last_balance_ns: 0,
				sleepers: VecDeque::new(),
				displaced: VecDeque::new(),
				departing: None,
				idle_ns: 0,
				busy_ns: 0,
			}),
		}
	}

	pub(crate) fn nr_running(&self) -> u32 {
		self.nr_running.load(Ordering::Relaxed)
	}

	pub(crate) fn reschedule_pending(&self) -> bool {
		self.resched.load(Ordering::Acquire)
	}

	pub(crate) fn set_reschedule_pending(&self) {
		self.resched.store(true, Ordering::Release);
	}
}

/// The decision of one `schedule` pass, handed to the architectural
/// context switch.
pub(crate) struct Dispatch {
	pub prev: Arc<Thread>,
	pub next: Arc<Thread>,
}

pub(crate) struct Scheduler {
	/// Taken by whole-system operations (boot, shutdown); never held
	/// while a run-queue lock is held.
	#[allow(dead_code)]
	global_lock: SpinLock<()>,
	queues: Box<[RunQueue]>,
	threads: RwSpinLock<HashMap<ThreadId, Arc<Thread>, RandomState>>,
	/// Wait channel -> FIFO of blocked waiters. Entries are validated
	/// lazily against the thread's own wait-channel word, so a timed-out
	/// sleeper leaves only a stale id behind.
	wait_map: SpinLockIrqSave<BTreeMap<u64, VecDeque<ThreadId>>>,
	online: AtomicU64,
	next_id: AtomicU32,
	need_balance: AtomicBool,
	thread_count: AtomicU32,
	/// System topology for NUMA-aware migration decisions; unset on
	/// systems booted without one (and in the hosted tests).
	topology: OnceCell<&'static SystemTopology>,
}

static SCHEDULER: OnceCell<Scheduler> = OnceCell::new();

/// Initializes the scheduler for `possible_cpus` processors. Called once
/// on the bootstrap processor before any other CPU runs.
pub fn init(possible_cpus: u32) {
	if SCHEDULER.set(Scheduler::new(possible_cpus)).is_err() {
		panic!("scheduler initialized twice");
	}
}

pub(crate) fn scheduler() -> &'static Scheduler {
	SCHEDULER.get().unwrap()
}

impl Scheduler {
	pub(crate) fn new(possible_cpus: u32) -> Self {
		let queues = (0..possible_cpus).map(RunQueue::new).collect();
		Self {
			global_lock: SpinLock::new(()),
			queues,
			threads: RwSpinLock::new(HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0))),
			wait_map: SpinLockIrqSave::new(BTreeMap::new()),
			online: AtomicU64::new(0),
			next_id: AtomicU32::new(1),
			need_balance: AtomicBool::new(false),
			thread_count: AtomicU32::new(0),
			topology: OnceCell::new(),
		}
	}

	/// Attaches the validated system topology so migrations can prefer
	/// nearby NUMA nodes.
	pub(crate) fn set_topology(&self, topology: &'static SystemTopology) {
		self.topology.set(topology).ok();
	}

	/// NUMA distance between the nodes of two CPUs; zero without a
	/// topology.
	pub(crate) fn cpu_distance(&self, from: CpuId, to: CpuId) -> u8 {
		let Some(topology) = self.topology.get() else {
			return 0;
		};
		match (topology.cpu(from), topology.cpu(to)) {
			(Some(a), Some(b)) => topology.distance(a.node, b.node),
			_ => 0,
		}
	}

	pub(crate) fn queue(&self, cpu: CpuId) -> &RunQueue {
		&self.queues[cpu as usize]
	}

	pub(crate) fn possible_cpus(&self) -> u32 {
		self.queues.len() as u32
	}

	pub fn online_set(&self) -> CpuSet {
		CpuSet::from_bits(self.online.load(Ordering::Acquire))
	}

	pub fn online_count(&self) -> u32 {
		self.online.load(Ordering::Acquire).count_ones()
	}

	pub fn thread_count(&self) -> u32 {
		self.thread_count.load(Ordering::Relaxed)
	}

	fn alloc_id(&self) -> ThreadId {
		let guard = self.threads.read();
		loop {
			let id = ThreadId::from(self.next_id.fetch_add(1, Ordering::SeqCst));
			if !guard.contains_key(&id) {
				return id;
			}
		}
	}

	pub(crate) fn thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
		self.threads.read().get(&id).cloned()
	}

	pub(crate) fn current(&self, cpu: CpuId) -> Arc<Thread> {
		self.queue(cpu).inner.lock().current.clone().unwrap()
	}

	/// Queue-clock timestamp of `cpu`.
	pub(crate) fn now(&self, cpu: CpuId) -> u64 {
		self.queue(cpu).inner.lock().clock_ns
	}

	/// Registers this CPU with the scheduler: creates its idle thread,
	/// makes it current, and marks the CPU online.
	pub(crate) fn add_core(&self, cpu: CpuId) {
		let id = self.alloc_id();
		let idle = Arc::new(Thread::new_idle(id, cpu));
		idle.set_state(ThreadState::Running);
		self.threads.write().insert(id, idle.clone());

		debug!("Initializing scheduler for CPU {cpu} with idle thread {id}");
		idle.set_on_cpu(true);
		{
			let mut inner = self.queue(cpu).inner.lock();
			inner.idle = Some(idle.clone());
			inner.current = Some(idle);
		}
		self.online.fetch_or(1 << cpu, Ordering::AcqRel);
	}

	/// Removes a CPU that failed to come up from the online set.
	pub(crate) fn mark_core_offline(&self, cpu: CpuId) {
		self.online.fetch_and(!(1 << cpu), Ordering::AcqRel);
	}

	/// Creates a thread control block and registers it; the caller
	/// attaches stacks and decides when it becomes Ready.
	pub(crate) fn create_thread(
		&self,
		process: ProcessId,
		class: SchedClass,
		priority: Priority,
		affinity: CpuSet,
	) -> Result<Arc<Thread>, SchedError> {
		if affinity.intersection(self.online_set()).is_empty() {
			return Err(SchedError::InvalidParameter);
		}

		let id = self.alloc_id();
		let thread = Arc::new(Thread::new(id, process, class, priority, affinity));
		self.threads.write().insert(id, thread.clone());
		self.thread_count.fetch_add(1, Ordering::SeqCst);
		Ok(thread)
	}

	/// Drops a Zombie thread from the table, releasing its control block.
	pub(crate) fn reap(&self, id: ThreadId) -> Result<(), SchedError> {
		let thread = self.thread(id).ok_or(SchedError::InvalidThreadId)?;
		if thread.state() != ThreadState::Zombie {
			return Err(SchedError::InvalidParameter);
		}
		self.threads.write().remove(&id);
		Ok(())
	}

	/// Picks the CPU a Ready thread should be queued on: the preferred
	/// CPU when it is allowed and online, the lowest allowed online CPU
	/// otherwise.
	fn select_cpu(&self, thread: &Thread) -> Result<CpuId, SchedError> {
		let allowed = thread.affinity().intersection(self.online_set());
		if let Some(preferred) = thread.preferred_cpu()
			&& allowed.contains(preferred)
		{
			return Ok(preferred);
		}
		allowed.first().ok_or(SchedError::InvalidParameter)
	}

	/// Places a Ready thread on a run queue and pokes the owner if the
	/// newcomer outranks whatever is running there.
	pub(crate) fn enqueue(&self, thread: Arc<Thread>) -> Result<CpuId, SchedError> {
		debug_assert_eq!(thread.state(), ThreadState::Ready);

		// A freshly woken thread may still be mid-switch on its old CPU;
		// wait until its context is fully saved before it can be queued
		// (and possibly dispatched) anywhere else.
		while thread.is_on_cpu() {
			core::hint::spin_loop();
		}

		let cpu = self.select_cpu(&thread)?;
		let queue = self.queue(cpu);

		let preempts = {
			let mut inner = queue.inner.lock();
			thread.set_queued_on(Some(cpu));
			let rank = thread.rank();
			inner.ready.push(thread);
			queue.nr_running.fetch_add(1, Ordering::Relaxed);
			match &inner.current {
				Some(current) => rank > current.rank(),
				None => false,
			}
		};

		if preempts {
			self.request_reschedule(cpu);
		}
		Ok(cpu)
	}

	/// Removes a Ready thread from its bucket. Returns `false` when the
	/// thread was not queued.
	pub(crate) fn dequeue(&self, thread: &Thread) -> bool {
		let Some(cpu) = thread.queued_on() else {
			return false;
		};
		let queue = self.queue(cpu);
		let mut inner = queue.inner.lock();
		if inner.ready.remove(thread) {
			thread.set_queued_on(None);
			queue.nr_running.fetch_sub(1, Ordering::Relaxed);
			true
		} else {
			false
		}
	}

	/// Flags `cpu` for a reschedule and, if it is another processor,
	/// sends it a reschedule IPI.
	pub(crate) fn request_reschedule(&self, cpu: CpuId) {
		self.queue(cpu).set_reschedule_pending();
		if cpu != arch::core_id() {
			arch::wakeup_core(cpu);
		}
	}

	/// The dispatch pass. Under the local queue lock: accounts the
	/// outgoing thread, re-enqueues it if it is still Runnable, picks the
	/// highest-ranked ready thread (or idle), and installs it as current.
	///
	/// Returns the pair to context-switch, or `None` when the current
	/// thread stays put. `voluntary` suppresses the involuntary-switch
	/// count for yields.
	pub(crate) fn schedule_core(&self, cpu: CpuId, voluntary: bool) -> Option<Dispatch> {
		let queue = self.queue(cpu);
		let mut inner = queue.inner.lock();

		let prev = inner.current.clone().unwrap();
		let was_running = prev.state() == ThreadState::Running;

		// While preemption is disabled the current thread keeps the CPU,
		// unless it is leaving the Running state (blocking semantics).
		if queue.preempt_depth.load(Ordering::Relaxed) > 0 && was_running {
			return None;
		}
		queue.resched.store(false, Ordering::Release);

		let now = inner.clock_ns;
		prev.account_runtime(now.saturating_sub(prev.last_run_ns()));
		prev.set_last_run_ns(now);

		if was_running && !prev.is_idle() {
			if prev.affinity().contains(cpu) {
				prev.set_state(ThreadState::Ready);
				prev.set_queued_on(Some(cpu));
				inner.ready.push(prev.clone());
			} else {
				// An affinity change displaced the thread. It may only be
				// re-enqueued elsewhere once its context has been saved,
				// so it is parked here until `finish_migrations`.
				prev.set_state(ThreadState::Ready);
				prev.insert_flags(ThreadFlags::MIGRATING);
				prev.set_preferred_cpu(
					prev.affinity().intersection(self.online_set()).first(),
				);
				inner.displaced.push_back(prev.clone());
				queue.nr_running.fetch_sub(1, Ordering::Relaxed);
			}
		}

		let next = match inner.ready.pop() {
			Some(next) => {
				next.set_queued_on(None);
				next
			}
			None => inner.idle.clone().unwrap(),
		};

		next.set_state(ThreadState::Running);
		next.set_last_cpu(cpu);
		next.set_last_run_ns(now);
		next.reset_timeslice();
		next.set_on_cpu(true);
		inner.current = Some(next.clone());

		if prev.id() == next.id() {
			return None;
		}

		if prev.is_idle() {
			// The idle thread lives outside the buckets; park it as Ready
			// until the queue drains again.
			prev.set_state(ThreadState::Ready);
		}

		inner.switches += 1;
		inner.departing = Some(prev.clone());
		if was_running && !voluntary && !prev.is_idle() {
			prev.count_involuntary_switch();
		}

		debug!("Switching from thread {} to {} on CPU {cpu}", prev.id(), next.id());
		Some(Dispatch { prev, next })
	}

	/// Completes the last context switch on `cpu`: runs in the incoming
	/// thread's context once the outgoing thread's state is fully saved,
	/// and releases that thread for dispatch elsewhere.
	pub(crate) fn finish_switch(&self, cpu: CpuId) {
		let departing = self.queue(cpu).inner.lock().departing.take();
		if let Some(thread) = departing {
			thread.set_on_cpu(false);
		}
	}

	/// Re-enqueues threads displaced from this CPU by an affinity change.
	/// Runs in the context of the *new* current thread, after the old
	/// one's context has been fully saved.
	pub(crate) fn finish_migrations(&self, cpu: CpuId) {
		loop {
			let displaced = self.queue(cpu).inner.lock().displaced.pop_front();
			let Some(thread) = displaced else {
				return;
			};
			self.enqueue(thread.clone()).ok();
			thread.remove_flags(ThreadFlags::MIGRATING);
		}
	}

	/// The timer tick. Advances the queue clock, wakes expired sleepers,
	/// burns the current thread's time slice, and decays its boost.
	pub(crate) fn tick_core(&self, cpu: CpuId) {
		let queue = self.queue(cpu);
		let mut foreign: Vec<Arc<Thread>> = Vec::new();

		{
			let mut inner = queue.inner.lock();
			inner.clock_ns += TICK_PERIOD_NS;
			inner.ticks += 1;
			let now = inner.clock_ns;

			while let Some(sleeper) = inner.sleepers.front() {
				if sleeper.wakeup_ns > now {
					break;
				}
				let Sleeper { thread, .. } = inner.sleepers.pop_front().unwrap();
				thread.set_queued_on(None);
				// An explicit wake may have claimed the thread already.
				if !thread.try_transition(ThreadState::Blocked, ThreadState::Ready) {
					continue;
				}
				thread.set_wait_channel(0);
				if thread.affinity().contains(cpu) {
					thread.set_queued_on(Some(cpu));
					inner.ready.push(thread);
					queue.nr_running.fetch_add(1, Ordering::Relaxed);
				} else {
					// Affinity changed while asleep; route through the
					// regular placement outside this lock.
					foreign.push(thread);
				}
			}

			let current = inner.current.clone().unwrap();
			if current.is_idle() {
				inner.idle_ns += TICK_PERIOD_NS;
			} else {
				inner.busy_ns += TICK_PERIOD_NS;
				current.decay_boost();
				if current.consume_timeslice_tick() {
					queue.resched.store(true, Ordering::Release);
				}
			}

			inner.load_estimate =
				(inner.load_estimate * 3 + queue.nr_running.load(Ordering::Relaxed) * 1024) / 4;

			if inner.ticks.is_multiple_of(LOAD_BALANCE_INTERVAL_TICKS) {
				self.need_balance.store(true, Ordering::Release);
			}

			if !inner.ready.is_empty()
				&& inner.ready.highest_rank() > Some(current.rank())
			{
				queue.resched.store(true, Ordering::Release);
			}
		}

		for thread in foreign {
			self.enqueue(thread).ok();
		}
	}

	/// Consumes the balance request flag; `true` at most once per
	/// interval across all CPUs.
	pub(crate) fn take_balance_request(&self) -> bool {
		self.need_balance.swap(false, Ordering::AcqRel)
	}

	/// Gives up the CPU voluntarily: the remaining slice is forfeited and
	/// the thread goes to the tail of its bucket.
	pub(crate) fn yield_core(&self, cpu: CpuId) -> Option<Dispatch> {
		let current = self.current(cpu);
		if !current.is_idle() {
			current.exhaust_timeslice();
			current.count_voluntary_switch();
		}
		self.schedule_core(cpu, true)
	}

	/// Blocks the current thread of `cpu` on `channel` and/or until
	/// `wakeup_ns` on the queue clock.
	pub(crate) fn block_current_core(
		&self,
		cpu: CpuId,
		channel: Option<u64>,
		wakeup_ns: Option<u64>,
	) -> Option<Dispatch> {
		let queue = self.queue(cpu);
		queue.preempt_depth.fetch_add(1, Ordering::Relaxed);

		let current = self.current(cpu);
		debug_assert!(!current.is_idle(), "blocking the idle thread");

		if let Some(channel) = channel {
			current.set_wait_channel(channel);
			self.wait_map
				.lock()
				.entry(channel)
				.or_default()
				.push_back(current.id());
		}

		{
			let mut inner = queue.inner.lock();
			current.set_state(ThreadState::Blocked);
			current.count_voluntary_switch();
			queue.nr_running.fetch_sub(1, Ordering::Relaxed);

			if let Some(wakeup_ns) = wakeup_ns {
				current.set_queued_on(Some(cpu));
				let position = inner
					.sleepers
					.iter()
					.position(|sleeper| sleeper.wakeup_ns > wakeup_ns)
					.unwrap_or(inner.sleepers.len());
				inner.sleepers.insert(
					position,
					Sleeper {
						wakeup_ns,
						thread: current.clone(),
					},
				);
			}
		}

		let dispatch = self.schedule_core(cpu, true);
		queue.preempt_depth.fetch_sub(1, Ordering::Relaxed);
		dispatch
	}

	/// Makes a blocked thread Ready again and queues it.
	pub(crate) fn unblock(&self, thread: &Arc<Thread>) -> Result<CpuId, SchedError> {
		if !thread.try_transition(ThreadState::Blocked, ThreadState::Ready) {
			return Err(SchedError::InvalidParameter);
		}

		// Cancel a pending timed wakeup.
		if let Some(cpu) = thread.queued_on() {
			let mut inner = self.queue(cpu).inner.lock();
			if let Some(position) = inner
				.sleepers
				.iter()
				.position(|sleeper| sleeper.thread.id() == thread.id())
			{
				inner.sleepers.remove(position);
			}
			thread.set_queued_on(None);
		}

		thread.set_wait_channel(0);
		self.enqueue(thread.clone())
	}

	/// Wakes every thread blocked on `channel`. Returns how many threads
	/// became Ready.
	pub(crate) fn wake_channel(&self, channel: u64) -> usize {
		let waiters = self.wait_map.lock().remove(&channel);
		let Some(waiters) = waiters else {
			return 0;
		};

		let mut woken = 0;
		for id in waiters {
			let Some(thread) = self.thread(id) else {
				continue;
			};
			// Stale entries (timed out, killed, or re-blocked elsewhere)
			// are skipped.
			if thread.state() == ThreadState::Blocked
				&& thread.wait_channel() == channel
				&& thread.suspend_count() == 0
				&& self.unblock(&thread).is_ok()
			{
				woken += 1;
			}
		}
		woken
	}

	/// Freezes a thread. A Ready thread leaves its bucket; a Running one
	/// is chased off its CPU with an IPI; a Blocked one stays blocked and
	/// simply will not become Ready until resumed.
	pub(crate) fn suspend(&self, thread: &Arc<Thread>) -> Result<(), SchedError> {
		thread.inc_suspend_count();

		loop {
			match thread.state() {
				ThreadState::Ready => {
					if thread.flags().contains(ThreadFlags::MIGRATING) {
						// The migration path re-checks the suspend count
						// when it re-enqueues; nothing to undo here.
						thread.set_state(ThreadState::Suspended);
						return Ok(());
					}
					if self.dequeue(thread) {
						thread.set_state(ThreadState::Suspended);
						return Ok(());
					}
					// Raced with a dispatch or migration; look again.
				}
				ThreadState::Running => {
					let cpu = thread.last_cpu();
					let queue = self.queue(cpu);
					let frozen = {
						let inner = queue.inner.lock();
						// Only freeze it if it still occupies that CPU.
						match &inner.current {
							Some(current)
								if current.id() == thread.id()
									&& thread.state() == ThreadState::Running =>
							{
								thread.set_state(ThreadState::Suspended);
								true
							}
							_ => false,
						}
					};
					if frozen {
						queue.nr_running.fetch_sub(1, Ordering::Relaxed);
						self.request_reschedule(cpu);
						return Ok(());
					}
				}
				ThreadState::Blocked | ThreadState::Suspended | ThreadState::Zombie => {
					return Ok(());
				}
			}
			core::hint::spin_loop();
		}
	}

	/// Thaws a thread frozen by [`Scheduler::suspend`]. Only the
	/// transition of the suspend count to zero makes it Runnable again.
	pub(crate) fn resume(&self, thread: &Arc<Thread>) -> Result<(), SchedError> {
		if thread.suspend_count() == 0 {
			return Err(SchedError::NotFrozen);
		}
		if thread.dec_suspend_count() == 0 && thread.state() == ThreadState::Suspended {
			thread.set_state(ThreadState::Ready);
			self.enqueue(thread.clone())?;
		}
		Ok(())
	}

	/// Replaces a thread's affinity mask. A Ready thread parked on a CPU
	/// outside the new mask is moved immediately; a Running one is told
	/// to reschedule.
	pub(crate) fn set_affinity(
		&self,
		thread: &Arc<Thread>,
		mask: CpuSet,
	) -> Result<(), SchedError> {
		if mask.intersection(self.online_set()).is_empty() {
			return Err(SchedError::InvalidParameter);
		}
		if thread.is_bound() && mask != CpuSet::single(thread.last_cpu()) {
			return Err(SchedError::InvalidParameter);
		}

		thread.set_affinity_mask(mask);

		match thread.state() {
			ThreadState::Ready => {
				if let Some(cpu) = thread.queued_on()
					&& !mask.contains(cpu)
					&& self.dequeue(thread)
				{
					thread.set_preferred_cpu(mask.intersection(self.online_set()).first());
					self.enqueue(thread.clone())?;
				}
			}
			ThreadState::Running => {
				if !mask.contains(thread.last_cpu()) {
					self.request_reschedule(thread.last_cpu());
				}
			}
			_ => {}
		}
		Ok(())
	}

	/// Applies a transient priority boost: `dynamic = clamp(base + delta)`
	/// for `ticks` timer ticks.
	pub(crate) fn boost(
		&self,
		thread: &Arc<Thread>,
		delta: i8,
		ticks: u32,
	) -> Result<(), SchedError> {
		if delta.unsigned_abs() as usize >= PRIORITY_LEVELS {
			return Err(SchedError::InvalidPriorityDelta);
		}
		self.requeue_with(thread, || thread.apply_boost(delta, ticks))
	}

	/// Rewrites class and/or base level. `delta` shifts the base level,
	/// clamped into the level range.
	pub(crate) fn set_priority(
		&self,
		thread: &Arc<Thread>,
		class: Option<SchedClass>,
		delta: i8,
	) -> Result<(), SchedError> {
		if delta.unsigned_abs() as usize >= PRIORITY_LEVELS {
			return Err(SchedError::InvalidPriorityDelta);
		}
		self.requeue_with(thread, || {
			if let Some(class) = class {
				thread.set_sched_class(class);
			}
			let base = i16::from(thread.base_priority().into()) + i16::from(delta);
			let base = base.clamp(0, PRIORITY_LEVELS as i16 - 1) as u8;
			thread.set_base_priority(Priority::from(base));
		})
	}

	/// Runs `change` (which may move the thread between buckets) with the
	/// dequeue-before / requeue-after dance a Ready thread needs, and
	/// pokes the affected CPU when the change alters who should run.
	fn requeue_with(
		&self,
		thread: &Arc<Thread>,
		change: impl FnOnce(),
	) -> Result<(), SchedError> {
		match thread.state() {
			ThreadState::Ready => {
				if let Some(cpu) = thread.queued_on() {
					let queue = self.queue(cpu);
					let preempts = {
						let mut inner = queue.inner.lock();
						let requeue = inner.ready.remove(thread);
						change();
						if requeue {
							inner.ready.push(thread.clone());
						}
						match &inner.current {
							Some(current) => thread.rank() > current.rank(),
							None => false,
						}
					};
					if preempts {
						self.request_reschedule(cpu);
					}
				} else {
					change();
				}
			}
			ThreadState::Running => {
				let cpu = thread.last_cpu();
				let demoted = {
					let inner = self.queue(cpu).inner.lock();
					change();
					inner.ready.highest_rank() > Some(thread.rank())
				};
				if demoted {
					self.request_reschedule(cpu);
				}
			}
			_ => change(),
		}
		Ok(())
	}

	/// Marks a thread for termination and makes sure it reaches a
	/// preemption point soon. The unwinding itself happens in the
	/// thread's own context.
	pub(crate) fn kill(&self, thread: &Arc<Thread>) -> Result<(), SchedError> {
		thread.insert_flags(ThreadFlags::TERMINATING);

		match thread.state() {
			ThreadState::Blocked => {
				while thread.suspend_count() > 0 {
					thread.dec_suspend_count();
				}
				self.unblock(thread).map(|_| ())
			}
			ThreadState::Suspended => {
				while thread.suspend_count() > 0 {
					thread.dec_suspend_count();
				}
				thread.set_state(ThreadState::Ready);
				self.enqueue(thread.clone()).map(|_| ())
			}
			ThreadState::Running => {
				self.request_reschedule(thread.last_cpu());
				Ok(())
			}
			ThreadState::Ready | ThreadState::Zombie => Ok(()),
		}
	}

	/// Terminates the current thread of `cpu`: Zombie, wake the reapers,
	/// switch away. The returned dispatch never resumes `prev`.
	pub(crate) fn exit_current_core(&self, cpu: CpuId) -> Option<Dispatch> {
		let current = self.current(cpu);
		assert!(!current.is_idle(), "trying to terminate the idle thread");

		debug!("Finishing thread {}", current.id());
		{
			let _inner = self.queue(cpu).inner.lock();
			current.set_state(ThreadState::Zombie);
		}
		self.queue(cpu).nr_running.fetch_sub(1, Ordering::Relaxed);
		self.thread_count.fetch_sub(1, Ordering::SeqCst);

		self.wake_channel(exit_channel(current.id()));
		self.schedule_core(cpu, true)
	}

	pub(crate) fn preempt_disable_core(&self, cpu: CpuId) {
		self.queue(cpu).preempt_depth.fetch_add(1, Ordering::Relaxed);
	}

	/// Decrements the preemption depth; on the transition to zero with a
	/// pending reschedule request the caller must invoke `schedule`.
	/// Returns whether that is the case.
	pub(crate) fn preempt_enable_core(&self, cpu: CpuId) -> bool {
		let queue = self.queue(cpu);
		queue.preempt_depth.fetch_sub(1, Ordering::Relaxed) == 1 && queue.reschedule_pending()
	}

	/// Logs one line per online CPU with its queue counters.
	pub fn print_status(&self) {
		for cpu in 0..self.possible_cpus() {
			if !self.online_set().contains(cpu) {
				continue;
			}
			let queue = self.queue(cpu);
			let inner = queue.inner.lock();
			info!(
				"CPU {}: {} runnable, {} switches, load {}, idle {} ms, busy {} ms, last balanced at {} ms",
				queue.cpu,
				queue.nr_running.load(Ordering::Relaxed),
				inner.switches,
				inner.load_estimate / 1024,
				inner.idle_ns / 1_000_000,
				inner.busy_ns / 1_000_000,
				inner.last_balance_ns / 1_000_000,
			);
		}
	}

	#[cfg(test)]
	pub(crate) fn assert_queue_invariants(&self, cpu: CpuId) {
		let queue = self.queue(cpu);
		let inner = queue.inner.lock();
		inner.ready.assert_bitmaps_consistent();

		let current_running = match &inner.current {
			Some(current) if !current.is_idle() => {
				assert_eq!(current.state(), ThreadState::Running);
				1
			}
			_ => 0,
		};
		assert_eq!(
			queue.nr_running.load(Ordering::Relaxed),
			inner.ready.len() + current_running
		);
	}
}

/// Housekeeping a freshly activated thread runs before anything else: the
/// previous thread's context is saved now, so release it and re-place any
/// displaced threads. The architectural task-entry stub calls this before
/// jumping to the thread's body.
pub fn after_switch() {
	let cpu = arch::core_id();
	scheduler().finish_switch(cpu);
	scheduler().finish_migrations(cpu);
}

/// Yields execution to a higher- or equal-priority thread, if any.
pub fn yield_now() {
	let cpu = arch::core_id();
	if let Some(dispatch) = scheduler().yield_core(cpu) {
		switch_to(dispatch);
	}
	scheduler().finish_migrations(arch::core_id());
}

/// Reschedules the current CPU.
pub fn schedule() {
	let cpu = arch::core_id();
	if let Some(dispatch) = scheduler().schedule_core(cpu, false) {
		switch_to(dispatch);
	}
	scheduler().finish_migrations(arch::core_id());
}

/// Blocks the calling thread on `channel`, optionally with a wakeup
/// deadline on the queue clock.
pub fn block_current(channel: Option<u64>, wakeup_ns: Option<u64>) {
	let cpu = arch::core_id();
	if let Some(dispatch) = scheduler().block_current_core(cpu, channel, wakeup_ns) {
		switch_to(dispatch);
	}
	scheduler().finish_migrations(arch::core_id());
}

/// Wakes all threads blocked on `channel`.
pub fn wake(channel: u64) -> usize {
	scheduler().wake_channel(channel)
}

pub fn preempt_disable() {
	scheduler().preempt_disable_core(arch::core_id());
}

pub fn preempt_enable() {
	if scheduler().preempt_enable_core(arch::core_id()) {
		schedule();
	}
}

/// Handles the end of a timer tick on the current CPU: runs the balancer
/// when due and reschedules when requested.
pub fn tick() {
	let cpu = arch::core_id();
	let sched = scheduler();
	sched.tick_core(cpu);

	if sched.take_balance_request() {
		balance::pull_one(sched, cpu, false);
	}

	try_reschedule();
}

/// Flags the current CPU for a reschedule; used by the reschedule-IPI
/// handler.
pub fn note_reschedule_request() {
	scheduler().queue(arch::core_id()).set_reschedule_pending();
}

/// Reschedules if a request is pending and preemption is enabled.
pub fn try_reschedule() {
	let queue = scheduler().queue(arch::core_id());
	if queue.reschedule_pending() && queue.preempt_depth.load(Ordering::Relaxed) == 0 {
		schedule();
	}
}

/// Creates a kernel thread running `func(arg)` and makes it Ready (or
/// leaves it Suspended for a later `resume`).
///
/// # Safety
///
/// `func` runs on a fresh kernel stack; it must be sound to call with
/// `arg` in kernel context.
pub unsafe fn spawn(
	func: unsafe extern "C" fn(usize),
	arg: usize,
	process: ProcessId,
	class: SchedClass,
	priority: Priority,
	affinity: CpuSet,
	start_suspended: bool,
) -> Result<ThreadId, SchedError> {
	use crate::arch::kernel::scheduler::TaskStacks;

	let sched = scheduler();
	let thread = sched.create_thread(process, class, priority, affinity)?;

	let stacks = TaskStacks::new(TaskStacks::default_size()).ok_or(SchedError::OutOfMemory)?;
	crate::arch::kernel::scheduler::create_stack_frame(&thread, &stacks, func, arg);
	*thread.ctx.stacks.lock() = Some(stacks);

	debug!(
		"Creating thread {} ({class:?}, level {priority}) for process {process}",
		thread.id()
	);

	if start_suspended {
		thread.inc_suspend_count();
	} else {
		thread.set_state(ThreadState::Ready);
		sched.enqueue(thread.clone())?;
	}
	Ok(thread.id())
}

/// Temporarily boosts a thread's dynamic priority by `delta` levels for
/// `ticks` timer ticks (an I/O completion or focus boost).
pub fn boost(id: ThreadId, delta: i8, ticks: u32) -> Result<(), SchedError> {
	let thread = scheduler().thread(id).ok_or(SchedError::InvalidThreadId)?;
	scheduler().boost(&thread, delta, ticks)
}

/// Terminates the current thread.
pub fn exit_current() -> ! {
	let cpu = arch::core_id();
	if let Some(dispatch) = scheduler().exit_current_core(cpu) {
		switch_to(dispatch);
	}
	unreachable!("a terminated thread resumed");
}

/// The body of every idle thread: pull work when the system is
/// imbalanced, otherwise halt until the next interrupt.
pub fn idle_loop() -> ! {
	let sched = scheduler();
	loop {
		let cpu = arch::core_id();
		sched.finish_migrations(cpu);
		balance::pull_one(sched, cpu, true);

		if sched.queue(cpu).nr_running() > 0 || sched.queue(cpu).reschedule_pending() {
			schedule();
		} else {
			arch::wait_for_interrupt();
		}
	}
}

fn switch_to(dispatch: Dispatch) {
	let Dispatch { prev, next } = dispatch;

	#[cfg(target_os = "none")]
	unsafe {
		let prev_sp = prev.ctx.last_stack_pointer.as_ptr();
		let next_sp = next.ctx.last_stack_pointer.load(Ordering::Acquire);
		crate::arch::switch::switch(prev_sp, next_sp);
	}

	#[cfg(not(target_os = "none"))]
	{
		let _ = (prev, next);
	}

	// Control resumes here in the context of the thread switched *to*
	// (immediately for it, much later for the thread switched away). The
	// outgoing thread's context is saved by now; publish that.
	scheduler().finish_switch(arch::core_id());
}

#[cfg(test)]
mod tests;
