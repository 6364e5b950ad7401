//! Kernel logger.
//!
//! Routes the `log` crate facade to the VGA console (mirrored to COM1 by
//! the print path). This is the kernel's audit channel: page-fault
//! classification, scheduler migrations, driver lifecycle, and boot
//! progress all land here. Host builds leave the facade uninitialized, so
//! log macros become no-ops in unit tests.

use log::{LevelFilter, Metadata, Record};

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        println!(
            "[{:5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger at the given level. Called once from the boot
/// sequencer; later calls are ignored.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
