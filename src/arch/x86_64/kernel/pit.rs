//! Programmable Interval Timer, used solely as the known-good reference
//! clock for calibrating the local APIC timer. Channel 2 is gated through
//! port 0x61, so it can count down without ever raising an interrupt.

#![allow(dead_code)]

const PIT_CLOCK_HZ: u64 = 1_193_182;

const PIT_CHANNEL2_DATA_PORT: u16 = 0x42;
const PIT_COMMAND_PORT: u16 = 0x43;
/// NMI status and control: bit 0 gates channel 2, bit 5 is its output.
const NMI_STATUS_PORT: u16 = 0x61;

const PIT_BINARY_OUTPUT: u8 = 0b0000_0000;
const PIT_COUNTDOWN_MODE: u8 = 0b0000_0000;
const PIT_LOBYTE_HIBYTE_ACCESS: u8 = 0b0011_0000;
const PIT_CHANNEL2: u8 = 0b1000_0000;

/// Busy-waits for `ms` milliseconds on PIT channel 2.
///
/// Interrupts stay untouched; the countdown is polled through the gate
/// status port. `ms` must keep the reload value within 16 bits, which
/// limits one wait to roughly 54 ms.
#[cfg(target_os = "none")]
pub fn wait_ms(ms: u64) {
	use x86_64::instructions::port::Port;

	let reload = (PIT_CLOCK_HZ * ms).div_ceil(1000);
	debug_assert!(reload <= u64::from(u16::MAX));

	unsafe {
		let mut gate = Port::<u8>::new(NMI_STATUS_PORT);
		let mut command = Port::<u8>::new(PIT_COMMAND_PORT);
		let mut data = Port::<u8>::new(PIT_CHANNEL2_DATA_PORT);

		// Open the channel-2 gate, speaker off.
		let status = gate.read();
		gate.write((status & !0b10) | 0b01);

		command.write(
			PIT_BINARY_OUTPUT | PIT_COUNTDOWN_MODE | PIT_LOBYTE_HIBYTE_ACCESS | PIT_CHANNEL2,
		);
		data.write(reload as u8);
		data.write((reload >> 8) as u8);

		// Re-arm the gate to start the countdown, then poll the output.
		let status = gate.read();
		gate.write(status & !0b01);
		gate.write(status | 0b01);

		while gate.read() & 0b10_0000 == 0 {
			core::hint::spin_loop();
		}

		// Leave the gate closed again.
		let status = gate.read();
		gate.write(status & !0b01);
	}
}

#[cfg(not(target_os = "none"))]
pub fn wait_ms(_ms: u64) {}
