//! Processor identification, feature detection, and the small pile of
//! instruction wrappers (pause, fences, TSC) everything above builds on.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering, compiler_fence, fence};

use raw_cpuid::CpuId;

bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct CpuFeatures: u32 {
		const SSE = 1 << 0;
		const SSE2 = 1 << 1;
		const SSE3 = 1 << 2;
		const SSSE3 = 1 << 3;
		const SSE41 = 1 << 4;
		const SSE42 = 1 << 5;
		const AVX = 1 << 6;
		const AVX2 = 1 << 7;
		const X2APIC = 1 << 8;
		const PCID = 1 << 9;
		const INVPCID = 1 << 10;
		const INVARIANT_TSC = 1 << 11;
		const TSC_DEADLINE = 1 << 12;
		const FSGSBASE = 1 << 13;
	}
}

/// Nominal frequencies in MHz as reported by `cpuid` leaf 0x16; zero when
/// the leaf is not implemented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrequencyInfo {
	pub base_mhz: u16,
	pub max_mhz: u16,
	pub bus_mhz: u16,
}

/// Features of the bootstrap processor; application processors are
/// expected to be identical, and their own detection result is stored in
/// their per-CPU info for sanity checking.
static FEATURES: AtomicU32 = AtomicU32::new(0);

/// Detected core frequency in MHz; used to scale TSC-based delays.
static CPU_FREQUENCY_MHZ: AtomicU16 = AtomicU16::new(0);

/// Reads the feature words and the frequency leaf of this CPU.
pub fn detect_features() -> (CpuFeatures, FrequencyInfo) {
	let cpuid = CpuId::new();
	let mut features = CpuFeatures::empty();

	if let Some(info) = cpuid.get_feature_info() {
		features.set(CpuFeatures::SSE, info.has_sse());
		features.set(CpuFeatures::SSE2, info.has_sse2());
		features.set(CpuFeatures::SSE3, info.has_sse3());
		features.set(CpuFeatures::SSSE3, info.has_ssse3());
		features.set(CpuFeatures::SSE41, info.has_sse41());
		features.set(CpuFeatures::SSE42, info.has_sse42());
		features.set(CpuFeatures::AVX, info.has_avx());
		features.set(CpuFeatures::X2APIC, info.has_x2apic());
		features.set(CpuFeatures::PCID, info.has_pcid());
		features.set(CpuFeatures::TSC_DEADLINE, info.has_tsc_deadline());
	}
	if let Some(info) = cpuid.get_extended_feature_info() {
		features.set(CpuFeatures::AVX2, info.has_avx2());
		features.set(CpuFeatures::INVPCID, info.has_invpcid());
		features.set(CpuFeatures::FSGSBASE, info.has_fsgsbase());
	}
	if let Some(info) = cpuid.get_advanced_power_mgmt_info() {
		features.set(CpuFeatures::INVARIANT_TSC, info.has_invariant_tsc());
	}

	let frequency = cpuid
		.get_processor_frequency_info()
		.map(|info| FrequencyInfo {
			base_mhz: info.processor_base_frequency(),
			max_mhz: info.processor_max_frequency(),
			bus_mhz: info.bus_frequency(),
		})
		.unwrap_or_default();

	(features, frequency)
}

/// Records the bootstrap processor's detection result as the kernel-wide
/// baseline.
pub fn set_boot_features(features: CpuFeatures, frequency: FrequencyInfo) {
	FEATURES.store(features.bits(), Ordering::Relaxed);
	let mhz = if frequency.base_mhz != 0 {
		frequency.base_mhz
	} else {
		// No frequency leaf (common under virtualization); assume a
		// round 2 GHz, which only stretches udelay, never shortens it
		// below intent on faster parts.
		2000
	};
	CPU_FREQUENCY_MHZ.store(mhz, Ordering::Relaxed);
	info!("CPU features: {features:?}");
	info!("CPU frequency: {mhz} MHz");
}

pub fn features() -> CpuFeatures {
	CpuFeatures::from_bits_retain(FEATURES.load(Ordering::Relaxed))
}

pub fn supports_x2apic() -> bool {
	features().contains(CpuFeatures::X2APIC)
}

pub fn supports_invariant_tsc() -> bool {
	features().contains(CpuFeatures::INVARIANT_TSC)
}

pub fn get_frequency() -> u16 {
	CPU_FREQUENCY_MHZ.load(Ordering::Relaxed)
}

/// The APIC id this CPU reports, read from the identification leaves.
pub fn local_apic_id() -> u32 {
	let cpuid = CpuId::new();
	cpuid
		.get_feature_info()
		.map(|info| u32::from(info.initial_local_apic_id()))
		.unwrap_or(0)
}

/// Spin-loop hint; tells the CPU we are busy-waiting.
#[inline(always)]
pub fn pause() {
	core::hint::spin_loop();
}

/// Full memory fence.
#[inline(always)]
pub fn mb() {
	fence(Ordering::SeqCst);
}

/// Read fence.
#[inline(always)]
pub fn rmb() {
	fence(Ordering::Acquire);
}

/// Write fence.
#[inline(always)]
pub fn wmb() {
	fence(Ordering::Release);
}

/// Forbids the compiler to reorder memory accesses across this point;
/// emits no instruction.
#[inline(always)]
pub fn compiler_barrier() {
	compiler_fence(Ordering::SeqCst);
}

/// Current time-stamp counter value.
#[inline]
pub fn rdtsc() -> u64 {
	unsafe { core::arch::x86_64::_rdtsc() }
}

/// Busy-waits for at least `usecs` microseconds on the TSC.
pub fn udelay(usecs: u64) {
	let cycles = usecs * u64::from(get_frequency().max(1)) + rdtsc();
	while rdtsc() < cycles {
		pause();
	}
}

/// Halts this CPU with interrupts left as they are.
#[cfg(target_os = "none")]
pub fn halt() {
	x86_64::instructions::hlt();
}

/// Sets up the control registers of the executing CPU: caching, SSE, and
/// the optional fast per-CPU segment instructions.
#[cfg(target_os = "none")]
pub fn configure() {
	use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};

	unsafe {
		let mut cr0 = Cr0::read();
		cr0.remove(Cr0Flags::CACHE_DISABLE | Cr0Flags::NOT_WRITE_THROUGH);
		cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
		cr0.insert(Cr0Flags::MONITOR_COPROCESSOR | Cr0Flags::NUMERIC_ERROR);
		Cr0::write(cr0);

		let mut cr4 = Cr4::read();
		cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
		if features().contains(CpuFeatures::FSGSBASE) {
			cr4.insert(Cr4Flags::FSGSBASE);
		}
		if features().contains(CpuFeatures::PCID) {
			cr4.insert(Cr4Flags::PCID);
		}
		Cr4::write(cr4);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn detection_runs_on_the_host() {
		// The test machine is an x86_64; SSE2 is architectural there.
		let (features, _) = detect_features();
		assert!(features.contains(CpuFeatures::SSE2));
	}

	#[test]
	fn tsc_is_monotonic_enough() {
		let a = rdtsc();
		let b = rdtsc();
		assert!(b >= a);
	}
}
