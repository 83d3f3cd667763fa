// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging utilities.
//!
//! Plain mode installs `env_logger` behind the `log` facade.  Structured mode
//! installs a slog root logger (terminal or JSON) and bridges the `log`
//! facade into it, so both styles of macro end up in the same drain.
//!
//! Request-scoped code logs through a [`slog::Logger`] derived from
//! [`root_logger`].

pub mod config;
pub mod structured;
#[macro_use]
pub mod wrapper;

#[cfg(test)]
mod tests;

use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, error, info};
use once_cell::sync::OnceCell;
use slog::{Drain, Logger, o};

use self::config::LoggingConfig;
use self::structured::{LoggerGuard, create_logger};

static INIT: Once = Once::new();
static USING_STRUCTURED: AtomicBool = AtomicBool::new(false);
static ROOT: OnceCell<Logger> = OnceCell::new();
static GUARD: OnceCell<LoggerGuard> = OnceCell::new();

/// Initialize plain logging with the specified level.
///
/// This function ensures logging is only initialized once.
pub fn init(level: Option<LevelFilter>) {
    init_with_config(level.unwrap_or(LevelFilter::Info), &LoggingConfig::default());
}

/// Initialize logging from configuration.  Only the first call has an
/// effect.
pub fn init_with_config(level: LevelFilter, config: &LoggingConfig) {
    INIT.call_once(|| {
        if config.structured {
            let logger = create_logger(&config.to_logger_config());
            let guard = slog_scope::set_global_logger(logger.clone());
            let _ = GUARD.set(LoggerGuard::new(guard));
            let _ = ROOT.set(logger);

            if slog_stdlog::init_with_level(level.to_level().unwrap_or(log::Level::Info)).is_ok() {
                USING_STRUCTURED.store(true, Ordering::SeqCst);
            }
            log::set_max_level(level);
        } else {
            let env = env_logger::Env::default().filter_or("RUST_LOG", level_name(level));
            let _ = env_logger::Builder::from_env(env)
                .format_timestamp_millis()
                .format_target(true)
                .try_init();
        }

        info!("Logging initialized at level: {}", log::max_level());
    });
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Trace => "trace",
        LevelFilter::Debug => "debug",
        LevelFilter::Info => "info",
        LevelFilter::Warn => "warn",
        LevelFilter::Error => "error",
        LevelFilter::Off => "off",
    }
}

/// Whether the structured logger is active.
pub fn is_structured_logging() -> bool {
    USING_STRUCTURED.load(Ordering::SeqCst)
}

/// The logger request loggers derive from.
///
/// Falls back to a logger that forwards every record to the `log` facade
/// when structured logging was never initialized.
pub fn root_logger() -> Logger {
    ROOT.get()
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}

/// Log an error with context and return the error.
///
/// This is useful for logging errors in a chain of Results.
pub fn log_error<E: std::fmt::Display>(context: &str, err: E) -> E {
    error!("{}: {}", context, err);
    err
}
