//! Pull-model load balancing between run queues.
//!
//! An underloaded CPU pulls at most one thread per pass from the busiest
//! eligible queue, which damps oscillation between queues of similar
//! length. The puller holds only the victim queue's lock while it picks;
//! the hand-off to its own queue goes through the regular enqueue path
//! with the thread marked as migrating in between.

use core::sync::atomic::Ordering;

use crate::config::{CACHE_HOT_NS, IMBALANCE_THRESHOLD};
use crate::topology::CpuId;

use super::{Scheduler, ThreadFlags, ThreadId};

/// Attempts to pull one thread onto `this_cpu`. `idle` relaxes the
/// cache-hotness guard: an idle puller gains from any migration.
///
/// Returns the migrated thread, if any.
pub(crate) fn pull_one(sched: &Scheduler, this_cpu: CpuId, idle: bool) -> Option<ThreadId> {
	let this_load = sched.queue(this_cpu).nr_running();
	let online = sched.online_set();

	// Busiest queue first; among equally long queues, prefer the one on
	// the nearest NUMA node so migrated work keeps its memory close.
	let mut busiest: Option<(CpuId, u32, u8)> = None;
	for cpu in 0..sched.possible_cpus() {
		if cpu == this_cpu || !online.contains(cpu) {
			continue;
		}
		let load = sched.queue(cpu).nr_running();
		if load <= this_load + IMBALANCE_THRESHOLD {
			continue;
		}
		let distance = sched.cpu_distance(this_cpu, cpu);
		if busiest.is_none_or(|(_, best_load, best_distance)| {
			load > best_load || (load == best_load && distance < best_distance)
		}) {
			busiest = Some((cpu, load, distance));
		}
	}
	let (victim_cpu, _, _) = busiest?;

	let victim = {
		let queue = sched.queue(victim_cpu);
		let mut inner = queue.inner.lock();
		let now = inner.clock_ns;

		let candidate = inner.ready.find_migratable(|thread| {
			thread.affinity().contains(this_cpu)
				&& !thread.is_bound()
				&& !thread.flags().contains(ThreadFlags::MIGRATING)
				&& (idle || now.saturating_sub(thread.last_run_ns()) >= CACHE_HOT_NS)
		})?;

		inner.ready.remove(&candidate);
		inner.last_balance_ns = now;
		queue.nr_running.fetch_sub(1, Ordering::Relaxed);
		candidate.set_queued_on(None);
		candidate.set_preferred_cpu(Some(this_cpu));
		candidate.insert_flags(ThreadFlags::MIGRATING);
		candidate
	};

	debug!(
		"Pulling thread {} from CPU {victim_cpu} to CPU {this_cpu}",
		victim.id()
	);

	// A concurrent suspend may have frozen the thread while it was in
	// flight; it then stays off every queue until resumed.
	let migrated = if victim.suspend_count() == 0 && victim.state() == super::ThreadState::Ready {
		sched.enqueue(victim.clone()).ok().map(|_| victim.id())
	} else {
		None
	};
	victim.remove_flags(ThreadFlags::MIGRATING);
	migrated
}
