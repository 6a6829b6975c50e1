use std::{
    env, fmt,
    io::{self, Write as _},
    process,
};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Environment variable holding the maximum level (`trace` to `error`, or `off`).
pub const LEVEL_ENV: &str = "MEMPOOL_LOG";

static LOGGER: Logger = Logger;

/// Installs the logger, with the level taken from [`LEVEL_ENV`].
pub fn init() -> Result<(), log::SetLoggerError> {
    let value = env::var(LEVEL_ENV).ok();
    let level = value.as_deref().map(str::parse::<LevelFilter>);

    log::set_logger(&LOGGER)?;
    log::set_max_level(match level {
        Some(Ok(level)) => level,
        _ => LevelFilter::Info,
    });

    if let (Some(value), Some(Err(_))) = (value, level) {
        log::warn!("ignoring invalid {LEVEL_ENV} value {value:?}");
    }
    Ok(())
}

struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Lines from several processes share the terminal; the pid tells
        // them apart.
        let _ = writeln!(
            io::stderr().lock(),
            "[{}] {} {}",
            process::id(),
            LevelFormat(record.level()),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

struct LevelFormat(Level);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            Level::Trace => 35,
            Level::Debug => 34,
            Level::Info => 32,
            Level::Warn => 33,
            Level::Error => 31,
        };
        let msg = match self.0 {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        };
        write!(f, "\x1B[{color};1m{msg}\x1B[0m")
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_format() {
        assert_eq!(
            LevelFormat(Level::Info).to_string(),
            "\x1B[32;1m INFO\x1B[0m"
        );
        assert_eq!(
            LevelFormat(Level::Error).to_string(),
            "\x1B[31;1mERROR\x1B[0m"
        );
    }
}
