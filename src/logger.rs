use std::io::Write;

use log::{Level, LevelFilter, Metadata, Record};

/// Minimal logger writing to stderr.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// The logger instance handed to the log facade.
static LOGGER: StderrLogger = StderrLogger;

/// Installs the stderr logger with the given level filter.
///
/// The library itself never installs a logger; applications and tests opt
/// in by calling this. If another logger is already installed the call is
/// a no-op.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
