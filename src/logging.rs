//! Kernel backend for the [`log`] facade. Records are tagged with the
//! issuing CPU so interleaved bring-up output stays readable.

use log::{Level, LevelFilter, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let level = match record.level() {
			Level::Error => "ERROR",
			Level::Warn => "WARN",
			Level::Info => "INFO",
			Level::Debug => "DEBUG",
			Level::Trace => "TRACE",
		};

		#[cfg(target_os = "none")]
		{
			use core::fmt::Write;

			let cpu = crate::arch::core_local::core_id();
			let mut console = crate::arch::kernel::serial::COM1.lock();
			if let Some(serial) = console.as_mut() {
				writeln!(serial, "[{cpu}][{level}] {}", record.args()).ok();
			}
		}

		#[cfg(not(target_os = "none"))]
		std::eprintln!("[0][{level}] {}", record.args());
	}

	fn flush(&self) {}
}

pub fn init() {
	log::set_logger(&LOGGER).expect("logger already registered");
	log::set_max_level(LevelFilter::Info);
}
