//! Kernel logger behind the `log` facade
//!
//! Routes `log::{error, warn, info, debug, trace}` onto the serial console
//! with a `[LEVEL] target: message` prefix. Installed once during early boot;
//! until then (and on host test builds) records are dropped silently.

use log::{LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::println!(
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the kernel logger.
///
/// Safe to call more than once; only the first call wins (matching the
/// init-once discipline of the other boot singletons).
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
