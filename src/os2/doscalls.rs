//! DOSCALLS thread services.
//!
//! Every function returns an OS/2 `APIRET` and follows the classic
//! calling conventions as closely as Rust allows: thread id zero means
//! "the calling thread", and out parameters are mutable references. The
//! heavy lifting happens in the native scheduler; this layer validates,
//! translates priorities, and maps errors onto `APIRET` codes.

#![allow(dead_code)]

use num_enum::TryFromPrimitive;

use crate::arch;
use crate::errno::*;
use crate::scheduler::{
	self, CpuSet, Priority, SchedClass, SchedError, Thread, ThreadId, ThreadState,
};

pub type ApiRet = u32;

/// `DosWaitThread` with `DCWW_NOWAIT` reports a live thread with this.
pub const ERROR_THREAD_NOT_TERMINATED: u32 = 294;

/// Scopes of `DosSetPriority`. Only single-thread scope is served by the
/// scheduling core; process scopes belong to the process manager.
pub const PRTYS_PROCESS: u32 = 0;
pub const PRTYS_PROCESSTREE: u32 = 1;
pub const PRTYS_THREAD: u32 = 2;

/// Priority classes of the OS/2 API.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum PriorityClass {
	NoChange = 0,
	IdleTime = 1,
	Regular = 2,
	TimeCritical = 3,
	ForegroundServer = 4,
}

impl PriorityClass {
	/// The native class this OS/2 class dispatches as. Time-critical
	/// outranks the foreground server class, which outranks regular
	/// work.
	fn to_sched_class(self) -> Option<SchedClass> {
		match self {
			PriorityClass::NoChange => None,
			PriorityClass::IdleTime => Some(SchedClass::Idle),
			PriorityClass::Regular => Some(SchedClass::Regular),
			PriorityClass::TimeCritical => Some(SchedClass::TimeCritical),
			PriorityClass::ForegroundServer => Some(SchedClass::Server),
		}
	}
}

/// `DosCreateThread` flag: the thread starts frozen and needs a
/// `DosResumeThread`.
pub const CREATE_SUSPENDED: u32 = 1;

/// `DosWaitThread` options.
pub const DCWW_WAIT: u32 = 0;
pub const DCWW_NOWAIT: u32 = 1;

/// System-information indices served by `DosQuerySysInfo`.
pub const QSV_VERSION_MAJOR: u32 = 1;
pub const QSV_VERSION_MINOR: u32 = 2;
pub const QSV_MIN_SLICE: u32 = 6;
pub const QSV_MAX_SLICE: u32 = 7;
pub const QSV_NUMPROCESSORS: u32 = 26;
/// Extension: the id of the CPU executing the query.
pub const QSV_CURRENT_PROCESSOR: u32 = 27;

/// OS/2 Warp 4 identifies itself as version 20.40.
const VERSION_MAJOR: u32 = 20;
const VERSION_MINOR: u32 = 40;

const MAX_CRITSEC_NESTING: u32 = 0xFFFF;

fn apiret(error: SchedError) -> ApiRet {
	match error {
		SchedError::InvalidParameter => ERROR_INVALID_PARAMETER,
		SchedError::InvalidThreadId => ERROR_INVALID_THREADID,
		SchedError::InvalidPriorityClass | SchedError::InvalidPriorityDelta => {
			ERROR_INVALID_PRIORITY
		}
		SchedError::NotFrozen => ERROR_NOT_FROZEN,
		SchedError::CritSecUnderflow => ERROR_CRITSEC_UNDERFLOW,
		SchedError::OutOfMemory => ERROR_NOT_ENOUGH_MEMORY,
	}
}

fn current_thread() -> alloc::sync::Arc<Thread> {
	scheduler::scheduler().current(arch::core_id())
}

/// Resolves an OS/2 thread id; zero names the calling thread.
fn lookup(tid: u32) -> Result<alloc::sync::Arc<Thread>, ApiRet> {
	if tid == 0 {
		Ok(current_thread())
	} else {
		scheduler::scheduler()
			.thread(ThreadId::from(tid))
			.ok_or(ERROR_INVALID_THREADID)
	}
}

/// Creates a thread in the calling process. The new thread starts in the
/// Regular class at the default level, Ready unless `CREATE_SUSPENDED`
/// is given.
pub fn dos_create_thread(
	ptid: &mut u32,
	func: unsafe extern "C" fn(usize),
	arg: usize,
	flags: u32,
	_stack_size: usize,
) -> ApiRet {
	let start_suspended = flags & CREATE_SUSPENDED != 0;
	let process = current_thread().process();

	let result = unsafe {
		scheduler::spawn(
			func,
			arg,
			process,
			SchedClass::Regular,
			scheduler::task::NORMAL_PRIO,
			CpuSet::ALL,
			start_suspended,
		)
	};

	match result {
		Ok(tid) => {
			*ptid = tid.into();
			NO_ERROR
		}
		Err(error) => apiret(error),
	}
}

/// Terminates the calling thread (or, with `EXIT_PROCESS`, hands the
/// whole process to the process manager, which is outside this core).
pub fn dos_exit(_action: u32, _result: u32) -> ! {
	scheduler::exit_current()
}

/// Marks a thread for termination and chases it to a preemption point.
pub fn dos_kill_thread(tid: u32) -> ApiRet {
	let thread = match lookup(tid) {
		Ok(thread) => thread,
		Err(code) => return code,
	};
	match scheduler::scheduler().kill(&thread) {
		Ok(()) => NO_ERROR,
		Err(error) => apiret(error),
	}
}

pub fn dos_suspend_thread(tid: u32) -> ApiRet {
	let thread = match lookup(tid) {
		Ok(thread) => thread,
		Err(code) => return code,
	};
	let own = thread.id() == current_thread().id();

	match scheduler::scheduler().suspend(&thread) {
		Ok(()) => {
			if own {
				// Self-suspension takes effect immediately.
				scheduler::schedule();
			}
			NO_ERROR
		}
		Err(error) => apiret(error),
	}
}

pub fn dos_resume_thread(tid: u32) -> ApiRet {
	let thread = match lookup(tid) {
		Ok(thread) => thread,
		Err(code) => return code,
	};
	match scheduler::scheduler().resume(&thread) {
		Ok(()) => NO_ERROR,
		Err(error) => apiret(error),
	}
}

/// Waits for a thread to terminate and reaps it.
pub fn dos_wait_thread(ptid: &mut u32, option: u32) -> ApiRet {
	loop {
		let tid = ThreadId::from(*ptid);
		let Some(thread) = scheduler::scheduler().thread(tid) else {
			return ERROR_INVALID_THREADID;
		};

		if thread.state() == ThreadState::Zombie {
			return match scheduler::scheduler().reap(tid) {
				Ok(()) => NO_ERROR,
				Err(error) => apiret(error),
			};
		}

		if option == DCWW_NOWAIT {
			return ERROR_THREAD_NOT_TERMINATED;
		}
		scheduler::block_current(Some(scheduler::exit_channel(tid)), None);
	}
}

/// Sleeps for at least `ms` milliseconds. Zero is exactly a yield.
pub fn dos_sleep(ms: u64) -> ApiRet {
	if ms == 0 {
		scheduler::yield_now();
		return NO_ERROR;
	}

	let sched = scheduler::scheduler();
	let cpu = arch::core_id();
	let current = sched.current(cpu);
	let deadline = sched.now(cpu) + ms * 1_000_000;
	scheduler::block_current(Some(sleep_channel(current.id())), Some(deadline));
	NO_ERROR
}

/// Channel a sleeping thread can be woken on before its deadline.
fn sleep_channel(id: ThreadId) -> u64 {
	(1 << 62) | (1 << 63) | u64::from(id.into())
}

/// Changes the priority of a single thread. `class` zero keeps the
/// class; `delta` shifts the level, clamped into `0..=31`.
pub fn dos_set_priority(scope: u32, class: u32, delta: i32, tid: u32) -> ApiRet {
	if scope != PRTYS_THREAD {
		return ERROR_INVALID_SCOPE;
	}
	let Ok(class) = PriorityClass::try_from(class) else {
		return ERROR_INVALID_PRIORITY;
	};
	if !(-31..=31).contains(&delta) {
		return ERROR_INVALID_PRIORITY;
	}

	let thread = match lookup(tid) {
		Ok(thread) => thread,
		Err(code) => return code,
	};

	match scheduler::scheduler().set_priority(&thread, class.to_sched_class(), delta as i8) {
		Ok(()) => NO_ERROR,
		Err(error) => apiret(error),
	}
}

pub fn dos_get_thread_affinity(tid: u32, mask: &mut u64) -> ApiRet {
	match lookup(tid) {
		Ok(thread) => {
			*mask = thread.affinity().bits();
			NO_ERROR
		}
		Err(code) => code,
	}
}

pub fn dos_set_thread_affinity(tid: u32, mask: u64) -> ApiRet {
	let thread = match lookup(tid) {
		Ok(thread) => thread,
		Err(code) => return code,
	};
	match scheduler::scheduler().set_affinity(&thread, CpuSet::from_bits(mask)) {
		Ok(()) => NO_ERROR,
		Err(error) => apiret(error),
	}
}

/// Enters a critical section: the calling thread keeps its CPU until the
/// matching `DosExitCritSec`.
pub fn dos_enter_crit_sec() -> ApiRet {
	let current = current_thread();
	if current.critsec_count() >= MAX_CRITSEC_NESTING {
		return ERROR_CRITSEC_OVERFLOW;
	}
	if current.inc_critsec_count() == 1 {
		scheduler::preempt_disable();
	}
	NO_ERROR
}

pub fn dos_exit_crit_sec() -> ApiRet {
	let current = current_thread();
	if current.critsec_count() == 0 {
		return ERROR_CRITSEC_UNDERFLOW;
	}
	if current.dec_critsec_count() == 0 {
		scheduler::preempt_enable();
	}
	NO_ERROR
}

/// Fills `buffer` with the values of the system variables `first..=last`.
pub fn dos_query_sys_info(first: u32, last: u32, buffer: &mut [u32]) -> ApiRet {
	if first > last || buffer.len() < (last - first + 1) as usize {
		return ERROR_INVALID_PARAMETER;
	}

	for (slot, index) in buffer.iter_mut().zip(first..=last) {
		*slot = match index {
			QSV_VERSION_MAJOR => VERSION_MAJOR,
			QSV_VERSION_MINOR => VERSION_MINOR,
			QSV_MIN_SLICE => 1000 / crate::config::TIMER_FREQUENCY_HZ,
			QSV_MAX_SLICE => {
				crate::config::DEFAULT_TIMESLICE_TICKS * 1000 / crate::config::TIMER_FREQUENCY_HZ
			}
			QSV_NUMPROCESSORS => scheduler::scheduler().online_count(),
			QSV_CURRENT_PROCESSOR => arch::core_id(),
			_ => 0,
		};
	}
	NO_ERROR
}

#[cfg(test)]
mod tests {
	use std::sync::{Mutex, MutexGuard, Once};

	use super::*;

	/// The DOSCALLS layer works on the global scheduler, and the hosted
	/// harness maps every test thread to CPU 0; initialize once and run
	/// the tests one at a time.
	fn ensure_kernel() -> MutexGuard<'static, ()> {
		static INIT: Once = Once::new();
		static SERIAL: Mutex<()> = Mutex::new(());

		INIT.call_once(|| {
			scheduler::init(4);
			for cpu in 0..4 {
				scheduler::scheduler().add_core(cpu);
			}
		});
		SERIAL.lock().unwrap()
	}

	unsafe extern "C" fn thread_body(_arg: usize) {}

	fn create_thread(flags: u32) -> u32 {
		let mut tid = 0;
		assert_eq!(
			dos_create_thread(&mut tid, thread_body, 0, flags, 0x8000),
			NO_ERROR
		);
		assert_ne!(tid, 0);
		tid
	}

	#[test]
	fn create_ready_thread() {
		let _serial = ensure_kernel();
		let tid = create_thread(0);
		let thread = scheduler::scheduler().thread(ThreadId::from(tid)).unwrap();
		assert_eq!(thread.state(), ThreadState::Ready);
		assert_eq!(thread.sched_class(), SchedClass::Regular);
	}

	#[test]
	fn create_suspended_thread_needs_resume() {
		let _serial = ensure_kernel();
		let tid = create_thread(CREATE_SUSPENDED);
		let thread = scheduler::scheduler().thread(ThreadId::from(tid)).unwrap();
		assert_eq!(thread.state(), ThreadState::Suspended);

		assert_eq!(dos_resume_thread(tid), NO_ERROR);
		assert_eq!(thread.state(), ThreadState::Ready);
		assert_eq!(dos_resume_thread(tid), ERROR_NOT_FROZEN);
	}

	#[test]
	fn priority_boundaries() {
		let _serial = ensure_kernel();
		let tid = create_thread(0);

		// Delta limits: 31 accepted, 32 rejected.
		assert_eq!(dos_set_priority(PRTYS_THREAD, 0, 31, tid), NO_ERROR);
		assert_eq!(
			dos_set_priority(PRTYS_THREAD, 0, 32, tid),
			ERROR_INVALID_PRIORITY
		);
		assert_eq!(dos_set_priority(PRTYS_THREAD, 0, -31, tid), NO_ERROR);
		assert_eq!(
			dos_set_priority(PRTYS_THREAD, 0, -32, tid),
			ERROR_INVALID_PRIORITY
		);

		// Class limits: 0 means no change, 5 is out of range.
		assert_eq!(
			dos_set_priority(PRTYS_THREAD, 5, 0, tid),
			ERROR_INVALID_PRIORITY
		);
		assert_eq!(
			dos_set_priority(PRTYS_PROCESS, 0, 0, tid),
			ERROR_INVALID_SCOPE
		);
	}

	#[test]
	fn class_mapping_follows_os2_precedence() {
		let _serial = ensure_kernel();
		let tid = create_thread(0);
		let thread = scheduler::scheduler().thread(ThreadId::from(tid)).unwrap();

		assert_eq!(dos_set_priority(PRTYS_THREAD, 3, 0, tid), NO_ERROR);
		assert_eq!(thread.sched_class(), SchedClass::TimeCritical);
		assert_eq!(dos_set_priority(PRTYS_THREAD, 4, 0, tid), NO_ERROR);
		assert_eq!(thread.sched_class(), SchedClass::Server);
		// A time-critical thread outranks a server-class one.
		assert!(SchedClass::TimeCritical > SchedClass::Server);
	}

	#[test]
	fn priority_delta_shifts_and_clamps() {
		let _serial = ensure_kernel();
		let tid = create_thread(0);
		let thread = scheduler::scheduler().thread(ThreadId::from(tid)).unwrap();
		let base = thread.base_priority().into();

		assert_eq!(dos_set_priority(PRTYS_THREAD, 0, 31, tid), NO_ERROR);
		assert_eq!(thread.base_priority(), Priority::from(31));
		assert_eq!(dos_set_priority(PRTYS_THREAD, 0, -31, tid), NO_ERROR);
		assert_eq!(thread.base_priority(), Priority::from(0));
		let _ = base;
	}

	#[test]
	fn affinity_roundtrip_and_validation() {
		let _serial = ensure_kernel();
		let tid = create_thread(0);

		assert_eq!(dos_set_thread_affinity(tid, 0b0110), NO_ERROR);
		let mut mask = 0;
		assert_eq!(dos_get_thread_affinity(tid, &mut mask), NO_ERROR);
		assert_eq!(mask, 0b0110);

		// Only offline CPUs in the mask: rejected, mask unchanged.
		assert_eq!(
			dos_set_thread_affinity(tid, 1 << 40),
			ERROR_INVALID_PARAMETER
		);
		assert_eq!(dos_get_thread_affinity(tid, &mut mask), NO_ERROR);
		assert_eq!(mask, 0b0110);

		assert_eq!(
			dos_set_thread_affinity(9999, 1),
			ERROR_INVALID_THREADID
		);
	}

	#[test]
	fn critsec_underflow_detected() {
		let _serial = ensure_kernel();
		assert_eq!(dos_exit_crit_sec(), ERROR_CRITSEC_UNDERFLOW);
		assert_eq!(dos_enter_crit_sec(), NO_ERROR);
		assert_eq!(dos_exit_crit_sec(), NO_ERROR);
	}

	#[test]
	fn sleep_zero_is_a_yield() {
		let _serial = ensure_kernel();
		assert_eq!(dos_sleep(0), NO_ERROR);
	}

	#[test]
	fn wait_thread_nowait_reports_live_thread() {
		let _serial = ensure_kernel();
		let mut tid = create_thread(0);
		assert_eq!(
			dos_wait_thread(&mut tid, DCWW_NOWAIT),
			ERROR_THREAD_NOT_TERMINATED
		);

		let mut unknown = 9999;
		assert_eq!(
			dos_wait_thread(&mut unknown, DCWW_NOWAIT),
			ERROR_INVALID_THREADID
		);
	}

	#[test]
	fn sysinfo_reports_cpus_and_version() {
		let _serial = ensure_kernel();
		let mut values = [0u32; 2];
		assert_eq!(
			dos_query_sys_info(QSV_VERSION_MAJOR, QSV_VERSION_MINOR, &mut values),
			NO_ERROR
		);
		assert_eq!(values, [20, 40]);

		let mut count = [0u32; 1];
		assert_eq!(
			dos_query_sys_info(QSV_NUMPROCESSORS, QSV_NUMPROCESSORS, &mut count),
			NO_ERROR
		);
		assert_eq!(count[0], 4);

		let mut bogus = [0u32; 1];
		assert_eq!(
			dos_query_sys_info(2, 1, &mut bogus),
			ERROR_INVALID_PARAMETER
		);
	}

	#[test]
	fn kill_unknown_thread_rejected() {
		let _serial = ensure_kernel();
		assert_eq!(dos_kill_thread(4711), ERROR_INVALID_THREADID);
	}
}
