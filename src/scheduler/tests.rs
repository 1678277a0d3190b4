use alloc::sync::Arc;

use super::*;
use crate::config::{CACHE_HOT_NS, DEFAULT_TIMESLICE_TICKS, LOAD_BALANCE_INTERVAL_TICKS};

fn sched(cpus: u32) -> Scheduler {
	let sched = Scheduler::new(cpus);
	for cpu in 0..cpus {
		sched.add_core(cpu);
	}
	sched
}

fn spawn_ready(
	sched: &Scheduler,
	class: SchedClass,
	level: u8,
	affinity: CpuSet,
) -> Arc<Thread> {
	let thread = sched
		.create_thread(1, class, Priority::from(level), affinity)
		.unwrap();
	thread.set_state(ThreadState::Ready);
	sched.enqueue(thread.clone()).unwrap();
	thread
}

/// One dispatch pass plus the post-switch housekeeping the wrappers would
/// run on real hardware.
fn dispatch(sched: &Scheduler, cpu: u32) -> Option<Dispatch> {
	let dispatch = sched.schedule_core(cpu, false);
	sched.finish_switch(cpu);
	sched.finish_migrations(cpu);
	dispatch
}

fn block_current(sched: &Scheduler, cpu: u32, channel: u64) {
	let dispatch = sched.block_current_core(cpu, Some(channel), None);
	sched.finish_switch(cpu);
	sched.finish_migrations(cpu);
	assert!(dispatch.is_some());
}

#[test]
fn enqueue_dequeue_roundtrip_is_identity() {
	let sched = sched(1);
	let a = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	let b = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);

	let visitor = sched
		.create_thread(1, SchedClass::Regular, Priority::from(16), CpuSet::ALL)
		.unwrap();
	visitor.set_state(ThreadState::Ready);
	sched.enqueue(visitor.clone()).unwrap();
	assert!(sched.dequeue(&visitor));

	sched.assert_queue_invariants(0);
	assert_eq!(sched.queue(0).nr_running(), 2);
	// FIFO order of the untouched threads is preserved.
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), a.id());
	let _ = a;
	let _ = b;
}

#[test]
fn priority_preemption_within_one_tick() {
	let sched = sched(1);
	let busy = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), busy.id());
	assert_eq!(busy.state(), ThreadState::Running);

	let urgent = spawn_ready(&sched, SchedClass::TimeCritical, 0, CpuSet::ALL);
	// The newcomer outranks the running thread purely by class.
	assert!(urgent.rank() > busy.rank());
	assert!(sched.queue(0).reschedule_pending());

	let dispatch = dispatch(&sched, 0).unwrap();
	assert_eq!(dispatch.next.id(), urgent.id());
	assert_eq!(urgent.state(), ThreadState::Running);
	assert_eq!(busy.state(), ThreadState::Ready);
	assert_eq!(busy.involuntary_switches(), 1);
	sched.assert_queue_invariants(0);
}

#[test]
fn two_cpu_ping_pong() {
	let sched = sched(2);
	const CHANNEL_A: u64 = 0x1000;
	const CHANNEL_B: u64 = 0x2000;

	let a = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::single(0));
	let b = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::single(1));
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), a.id());
	assert_eq!(dispatch(&sched, 1).unwrap().next.id(), b.id());

	// B parks first; afterwards each side wakes the other and parks.
	block_current(&sched, 1, CHANNEL_B);

	for round in 1..=10u64 {
		// A's turn on CPU 0.
		assert_eq!(sched.wake_channel(CHANNEL_B), 1);
		block_current(&sched, 0, CHANNEL_A);
		assert_eq!(dispatch(&sched, 1).unwrap().next.id(), b.id());
		assert_eq!(b.last_cpu(), 1);

		// B's turn on CPU 1.
		assert_eq!(sched.wake_channel(CHANNEL_A), 1);
		block_current(&sched, 1, CHANNEL_B);
		assert_eq!(dispatch(&sched, 0).unwrap().next.id(), a.id());
		assert_eq!(a.last_cpu(), 0);

		assert_eq!(a.voluntary_switches(), round);
		assert_eq!(b.voluntary_switches(), round + 1);
	}

	sched.assert_queue_invariants(0);
	sched.assert_queue_invariants(1);
}

#[test]
fn imbalance_migrates_exactly_one_thread() {
	let sched = sched(2);
	for _ in 0..4 {
		spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	}
	assert_eq!(sched.queue(0).nr_running(), 4);
	assert_eq!(sched.queue(1).nr_running(), 0);
	assert!(dispatch(&sched, 0).is_some());

	// Run a full balance interval so the threads age past the cache-hot
	// guard and the balance request fires.
	for _ in 0..LOAD_BALANCE_INTERVAL_TICKS {
		sched.tick_core(0);
	}
	assert!(sched.take_balance_request());
	assert!(!sched.take_balance_request());

	let moved = balance::pull_one(&sched, 1, false);
	assert!(moved.is_some());
	assert_eq!(sched.queue(0).nr_running(), 3);
	assert_eq!(sched.queue(1).nr_running(), 1);

	let migrated = sched.thread(moved.unwrap()).unwrap();
	assert!(!migrated.flags().contains(ThreadFlags::MIGRATING));
	assert_eq!(migrated.queued_on(), Some(1));
	sched.assert_queue_invariants(0);
	sched.assert_queue_invariants(1);
}

#[test]
fn balancer_respects_threshold_and_pins() {
	let sched = sched(2);
	let pinned = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::single(0));
	let bound = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	bound.insert_flags(ThreadFlags::BOUND);

	// Two queued on CPU 0 versus an empty CPU 1 exceeds the threshold,
	// but neither candidate is migratable.
	for _ in 0..LOAD_BALANCE_INTERVAL_TICKS {
		sched.tick_core(0);
	}
	assert_eq!(balance::pull_one(&sched, 1, true), None);
	assert_eq!(sched.queue(0).nr_running(), 2);

	// A one-thread difference is not an imbalance.
	spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert!(sched.dequeue(&pinned));
	assert_eq!(sched.queue(0).nr_running(), 2);
	spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::single(1));
	assert_eq!(balance::pull_one(&sched, 1, true), None);
}

#[test]
fn equally_busy_queues_pull_from_the_nearer_node() {
	use alloc::boxed::Box;

	use crate::topology::{CpuDescriptor, SystemTopology, TopologySnapshot};

	let cpu_on_node = |logical_id, node| CpuDescriptor {
		logical_id,
		apic_id: logical_id,
		firmware_id: logical_id,
		enabled: true,
		node,
	};
	let topology = SystemTopology::import(
		TopologySnapshot {
			possible_cpus: 3,
			bsp_apic_id: 0,
			cpus: vec![cpu_on_node(0, 0), cpu_on_node(1, 1), cpu_on_node(2, 0)],
			ioapics: vec![],
			overrides: smallvec::SmallVec::new(),
			numa_nodes: 2,
			distances: vec![10, 20, 20, 10],
		},
		0,
	)
	.unwrap();

	let sched = sched(3);
	sched.set_topology(Box::leak(Box::new(topology)));

	// CPUs 1 and 2 are equally overloaded; CPU 2 shares CPU 0's node.
	for cpu in [1, 2] {
		for _ in 0..3 {
			let thread = sched
				.create_thread(1, SchedClass::Regular, Priority::from(16), CpuSet::single(cpu))
				.unwrap();
			thread.set_state(ThreadState::Ready);
			thread.set_affinity_mask(CpuSet::ALL);
			thread.set_preferred_cpu(Some(cpu));
			sched.enqueue(thread).unwrap();
		}
	}
	assert_eq!(sched.queue(1).nr_running(), 3);
	assert_eq!(sched.queue(2).nr_running(), 3);

	assert!(balance::pull_one(&sched, 0, true).is_some());
	assert_eq!(sched.queue(1).nr_running(), 3);
	assert_eq!(sched.queue(2).nr_running(), 2);
}

#[test]
fn idle_pull_ignores_cache_hotness() {
	let sched = sched(2);
	for _ in 0..3 {
		spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	}
	// No aging at all: the threads are as hot as they get.
	assert_eq!(balance::pull_one(&sched, 1, false), None);
	assert!(balance::pull_one(&sched, 1, true).is_some());
}

#[test]
fn hot_threads_stay_put_in_periodic_balance() {
	let sched = sched(2);
	for _ in 0..3 {
		spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	}
	// Age the queue clock less than the guard.
	let ticks_below_guard = CACHE_HOT_NS / crate::config::TICK_PERIOD_NS;
	for _ in 0..ticks_below_guard.saturating_sub(1) {
		sched.tick_core(0);
	}
	assert_eq!(balance::pull_one(&sched, 1, false), None);
}

#[test]
fn affinity_confines_thread_to_its_cpu() {
	let sched = sched(4);
	let thread = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::single(2));
	assert_eq!(thread.queued_on(), Some(2));
	assert_eq!(dispatch(&sched, 2).unwrap().next.id(), thread.id());

	for _ in 0..1000 {
		sched.tick_core(2);
		if sched.queue(2).reschedule_pending() {
			dispatch(&sched, 2);
		}
		assert_eq!(thread.last_cpu(), 2);
	}
	sched.assert_queue_invariants(2);
}

#[test]
fn set_affinity_moves_ready_thread() {
	let sched = sched(2);
	let thread = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert_eq!(thread.queued_on(), Some(0));

	sched.set_affinity(&thread, CpuSet::single(1)).unwrap();
	assert_eq!(thread.queued_on(), Some(1));
	assert_eq!(sched.queue(0).nr_running(), 0);
	assert_eq!(sched.queue(1).nr_running(), 1);
	assert_eq!(thread.affinity(), CpuSet::single(1));
	sched.assert_queue_invariants(0);
	sched.assert_queue_invariants(1);
}

#[test]
fn set_affinity_displaces_running_thread() {
	let sched = sched(2);
	let thread = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), thread.id());

	sched.set_affinity(&thread, CpuSet::single(1)).unwrap();
	assert!(sched.queue(0).reschedule_pending());

	// The owning CPU reschedules; the displaced thread lands on CPU 1
	// once the switch has completed.
	dispatch(&sched, 0);
	assert_eq!(thread.state(), ThreadState::Ready);
	assert_eq!(thread.queued_on(), Some(1));
	assert!(!thread.flags().contains(ThreadFlags::MIGRATING));
	assert_eq!(sched.queue(1).nr_running(), 1);
	sched.assert_queue_invariants(0);
	sched.assert_queue_invariants(1);
}

#[test]
fn offline_affinity_rejected() {
	let sched = sched(2);
	assert_eq!(
		sched
			.create_thread(1, SchedClass::Regular, Priority::from(16), CpuSet::single(5))
			.unwrap_err(),
		SchedError::InvalidParameter
	);

	let thread = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert_eq!(
		sched.set_affinity(&thread, CpuSet::from_bits(0b100)),
		Err(SchedError::InvalidParameter)
	);
	// The old mask is untouched.
	assert_eq!(thread.affinity(), CpuSet::ALL);
}

#[test]
fn boost_decays_back_to_base() {
	let sched = sched(1);
	let thread = spawn_ready(&sched, SchedClass::Regular, 10, CpuSet::ALL);
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), thread.id());

	sched.boost(&thread, 8, 3).unwrap();
	assert_eq!(thread.dynamic_priority(), Priority::from(18));

	for _ in 0..3 {
		sched.tick_core(0);
	}
	assert_eq!(thread.dynamic_priority(), thread.base_priority());
	assert_eq!(sched.boost(&thread, 32, 1), Err(SchedError::InvalidPriorityDelta));
}

#[test]
fn boost_requeues_ready_thread() {
	let sched = sched(1);
	let runner = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	let waiting = spawn_ready(&sched, SchedClass::Regular, 10, CpuSet::ALL);
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), runner.id());

	sched.boost(&waiting, 10, 5).unwrap();
	assert_eq!(waiting.dynamic_priority(), Priority::from(20));
	// The boosted thread now outranks the runner.
	assert!(sched.queue(0).reschedule_pending());
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), waiting.id());
	sched.assert_queue_invariants(0);
}

#[test]
fn suspend_resume_roundtrip() {
	let sched = sched(1);
	let thread = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);

	sched.suspend(&thread).unwrap();
	assert_eq!(thread.state(), ThreadState::Suspended);
	assert_eq!(sched.queue(0).nr_running(), 0);

	// Nested suspension: only the last resume thaws.
	sched.suspend(&thread).unwrap();
	sched.resume(&thread).unwrap();
	assert_eq!(thread.state(), ThreadState::Suspended);
	sched.resume(&thread).unwrap();
	assert_eq!(thread.state(), ThreadState::Ready);
	assert_eq!(thread.queued_on(), Some(0));

	assert_eq!(sched.resume(&thread), Err(SchedError::NotFrozen));
	sched.assert_queue_invariants(0);
}

#[test]
fn suspended_blocked_thread_stays_blocked() {
	let sched = sched(1);
	let thread = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert!(dispatch(&sched, 0).is_some());
	block_current(&sched, 0, 0x42);

	sched.suspend(&thread).unwrap();
	assert_eq!(thread.state(), ThreadState::Blocked);

	// A wake while frozen is ignored.
	assert_eq!(sched.wake_channel(0x42), 0);
	assert_eq!(thread.state(), ThreadState::Blocked);

	sched.resume(&thread).unwrap();
	assert_eq!(thread.state(), ThreadState::Blocked);
	// The wait-map entry was consumed by the ignored wake; a fresh wake
	// on the channel reaches nobody, so unblock directly.
	sched.unblock(&thread).unwrap();
	assert_eq!(thread.state(), ThreadState::Ready);
}

#[test]
fn timed_sleep_expires() {
	let sched = sched(1);
	let thread = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert!(dispatch(&sched, 0).is_some());

	let deadline = sched.now(0) + 3 * crate::config::TICK_PERIOD_NS;
	let dispatched = sched.block_current_core(0, Some(0x99), Some(deadline));
	sched.finish_switch(0);
	assert!(dispatched.is_some());
	assert_eq!(thread.state(), ThreadState::Blocked);

	sched.tick_core(0);
	sched.tick_core(0);
	assert_eq!(thread.state(), ThreadState::Blocked);
	sched.tick_core(0);
	assert_eq!(thread.state(), ThreadState::Ready);
	assert_eq!(thread.queued_on(), Some(0));

	// The stale wait-map entry does not resurrect the thread.
	assert!(dispatch(&sched, 0).is_some());
	assert_eq!(sched.wake_channel(0x99), 0);
	assert_eq!(thread.state(), ThreadState::Running);
	sched.assert_queue_invariants(0);
}

#[test]
fn wake_cancels_pending_timeout() {
	let sched = sched(1);
	let thread = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert!(dispatch(&sched, 0).is_some());

	let deadline = sched.now(0) + 10 * crate::config::TICK_PERIOD_NS;
	sched.block_current_core(0, Some(0x99), Some(deadline));
	sched.finish_switch(0);

	assert_eq!(sched.wake_channel(0x99), 1);
	assert_eq!(thread.state(), ThreadState::Ready);

	// No sleeper left behind: the expired deadline wakes nobody twice.
	assert!(dispatch(&sched, 0).is_some());
	for _ in 0..11 {
		sched.tick_core(0);
	}
	assert_eq!(thread.state(), ThreadState::Running);
}

#[test]
fn exit_wakes_reapers_and_reap_removes() {
	let sched = sched(1);
	let worker = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	let reaper = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);

	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), worker.id());
	assert_eq!(sched.thread_count(), 2);

	// The reaper runs next and parks on the worker's exit channel, which
	// puts the worker back on the CPU.
	dispatch(&sched, 0);
	assert_eq!(sched.current(0).id(), reaper.id());
	block_current(&sched, 0, exit_channel(worker.id()));
	assert_eq!(sched.current(0).id(), worker.id());

	let dispatched = sched.exit_current_core(0);
	sched.finish_switch(0);
	assert!(dispatched.is_some());

	assert_eq!(worker.state(), ThreadState::Zombie);
	// The woken reaper was dispatched right away.
	assert_eq!(reaper.state(), ThreadState::Running);
	assert_eq!(sched.thread_count(), 1);

	sched.reap(worker.id()).unwrap();
	assert!(sched.thread(worker.id()).is_none());
	assert_eq!(sched.reap(reaper.id()), Err(SchedError::InvalidParameter));
}

#[test]
fn yield_requeues_at_tail() {
	let sched = sched(1);
	let first = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	let second = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);

	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), first.id());
	let dispatched = sched.yield_core(0);
	sched.finish_switch(0);
	assert_eq!(dispatched.unwrap().next.id(), second.id());
	assert_eq!(first.voluntary_switches(), 1);
	assert_eq!(first.involuntary_switches(), 0);
	assert_eq!(first.state(), ThreadState::Ready);
}

#[test]
fn timeslice_exhaustion_rotates_bucket() {
	let sched = sched(1);
	let first = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	let second = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), first.id());

	for _ in 0..DEFAULT_TIMESLICE_TICKS - 1 {
		sched.tick_core(0);
		assert!(!sched.queue(0).reschedule_pending());
	}
	sched.tick_core(0);
	assert!(sched.queue(0).reschedule_pending());

	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), second.id());
	assert_eq!(first.involuntary_switches(), 1);
	assert_eq!(first.timeslice(), 0);

	// Fairness within the bucket: the expired thread went to the tail and
	// gets a fresh slice on its next dispatch.
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), first.id());
	assert_eq!(first.timeslice(), DEFAULT_TIMESLICE_TICKS);
}

#[test]
fn preempt_disable_defers_switch() {
	let sched = sched(1);
	let busy = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), busy.id());

	sched.preempt_disable_core(0);
	let urgent = spawn_ready(&sched, SchedClass::TimeCritical, 0, CpuSet::ALL);
	assert!(sched.queue(0).reschedule_pending());
	assert!(sched.schedule_core(0, false).is_none());
	assert_eq!(busy.state(), ThreadState::Running);

	assert!(sched.preempt_enable_core(0));
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), urgent.id());
}

#[test]
fn blocking_bypasses_preemption_gate() {
	let sched = sched(1);
	let thread = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert!(dispatch(&sched, 0).is_some());

	// `block_current_core` disables preemption itself; the switch still
	// happens because the thread leaves the Running state.
	block_current(&sched, 0, 0x7);
	assert_eq!(thread.state(), ThreadState::Blocked);
	assert!(sched.current(0).is_idle());
}

#[test]
fn kill_makes_blocked_thread_runnable() {
	let sched = sched(1);
	let thread = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::ALL);
	assert!(dispatch(&sched, 0).is_some());
	block_current(&sched, 0, 0x13);

	sched.kill(&thread).unwrap();
	assert!(thread.flags().contains(ThreadFlags::TERMINATING));
	assert_eq!(thread.state(), ThreadState::Ready);
	sched.assert_queue_invariants(0);
}

#[test]
fn wake_order_is_fifo() {
	let sched = sched(2);
	let a = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::single(0));
	let b = spawn_ready(&sched, SchedClass::Regular, 16, CpuSet::single(0));

	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), a.id());
	// Blocking A dispatches B; blocking B leaves the CPU idle.
	block_current(&sched, 0, 0x55);
	assert_eq!(sched.current(0).id(), b.id());
	block_current(&sched, 0, 0x55);
	assert!(sched.current(0).is_idle());

	assert_eq!(sched.wake_channel(0x55), 2);
	// Both woke onto CPU 0 in blocking order.
	assert_eq!(dispatch(&sched, 0).unwrap().next.id(), a.id());
	let _ = b;
}
