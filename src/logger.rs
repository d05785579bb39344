//! Stderr logger, controlled by the `SANDBOX_LOG_LEVEL` environment
//! variable. Every component logs through the `log` crate rather than
//! writing to stderr directly, so `main` is the only place that talks
//! to the terminal on its own terms.

use std::env;
use std::io::{stderr, Write};
use std::str::FromStr;

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

static LOGGER: OnceCell<SandboxLogger> = OnceCell::new();

/// Installs the global logger. Safe to call more than once; only the
/// first call takes effect.
pub fn init() {
    let level_filter = env::var("SANDBOX_LOG_LEVEL")
        .ok()
        .and_then(|s| LevelFilter::from_str(&s).ok())
        .unwrap_or(LevelFilter::Warn);

    let logger = LOGGER.get_or_init(|| SandboxLogger {
        level: level_filter.to_level(),
    });
    let _ = log::set_logger(logger).map(|()| log::set_max_level(level_filter));
}

pub struct SandboxLogger {
    level: Option<log::Level>,
}

impl Log for SandboxLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match self.level {
            Some(level) => metadata.level() <= level,
            None => false,
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = match (record.file(), record.line()) {
            (Some(file), Some(line)) => {
                writeln!(stderr(), "[{} {}:{}] {}", record.level(), file, line, record.args())
            }
            _ => writeln!(stderr(), "[{}] {}", record.level(), record.args()),
        };
    }

    fn flush(&self) {
        let _ = stderr().flush();
    }
}
