//! A minimal `log` backend writing to standard error.
//!
//! The level comes from `UTHREAD_LOG` (`error`, `warn`, `info`, `debug`,
//! `trace` or `off`) and defaults to `info`.

use std::{
    io::{self, Write},
    sync::OnceLock,
};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Environment variable holding the maximum level.
pub const ENV_LEVEL: &str = "UTHREAD_LOG";

struct StderrLogger {
    level: LevelFilter,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let prefix = match record.level() {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };

        // Nowhere left to report a failed write.
        let _ = writeln!(io::stderr().lock(), "[{prefix}] {}: {}", record.target(), record.args());
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

static LOGGER: OnceLock<StderrLogger> = OnceLock::new();

/// Installs the logger as the process-wide `log` backend.
pub fn init() -> Result<(), SetLoggerError> {
    let level = std::env::var(ENV_LEVEL)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::Info);

    log::set_logger(LOGGER.get_or_init(|| StderrLogger { level }))?;
    log::set_max_level(level);
    Ok(())
}
