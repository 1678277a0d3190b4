//! COM1 serial output for the kernel logger.

use uart_16550::SerialPort;

use crate::synch::SpinLockIrqSave;

const COM1_BASE: u16 = 0x3F8;

/// Serial port to print kernel messages
pub(crate) static COM1: SpinLockIrqSave<Option<SerialPort>> = SpinLockIrqSave::new(None);

/// Earliest output initialization; everything logged before this call is
/// lost.
pub fn init() {
	let mut serial_port = unsafe { SerialPort::new(COM1_BASE) };
	serial_port.init();
	*COM1.lock() = Some(serial_port);
}
