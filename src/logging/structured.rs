// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured logging built on slog.
//!
//! Provides the terminal and JSON drains and the per-request context every
//! log line of an exchange carries.

use std::io;
use std::net::SocketAddr;

use http::HeaderMap;
use http::header::USER_AGENT;
use slog::{Drain, Logger, o};
use slog_async::Async;
use slog_json::Json;
use slog_term::{FullFormat, TermDecorator};
use uuid::Uuid;

/// Structured logging format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable terminal output
    Terminal,
    /// JSON formatted output
    Json,
}

/// Structured logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Output format (Terminal or JSON)
    pub format: LogFormat,
    /// Log level
    pub level: slog::Level,
    /// Additional static key-value pairs to include in all logs
    pub static_fields: Vec<(String, String)>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Terminal,
            level: slog::Level::Info,
            static_fields: Vec::new(),
        }
    }
}

/// Create a structured logger with the given configuration
pub fn create_logger(config: &LoggerConfig) -> Logger {
    let logger = match config.format {
        LogFormat::Terminal => {
            let decorator = TermDecorator::new().build();
            let drain = FullFormat::new(decorator).build().fuse();
            let drain = drain.filter_level(config.level).fuse();
            Logger::root(Async::new(drain).build().fuse(), o!())
        }
        LogFormat::Json => {
            let drain = Json::new(io::stdout()).add_default_keys().build().fuse();
            let drain = drain.filter_level(config.level).fuse();
            Logger::root(Async::new(drain).build().fuse(), o!())
        }
    };

    with_static_fields(logger, &config.static_fields)
}

fn with_static_fields(mut logger: Logger, fields: &[(String, String)]) -> Logger {
    for (key, value) in fields {
        // slog keys are 'static; static fields are created once at startup.
        let key: &'static str = Box::leak(key.clone().into_boxed_str());
        logger = logger.new(o!(key => value.clone()));
    }
    logger
}

/// Generate a new request ID
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a child logger with request context
pub fn with_request_context(logger: &Logger, request_info: &RequestInfo) -> Logger {
    logger.new(o!(
        "request_id" => request_info.request_id.clone(),
        "method" => request_info.method.clone(),
        "path" => request_info.path.clone(),
        "remote_addr" => request_info.remote_addr.clone(),
        "user_agent" => request_info.user_agent.clone(),
    ))
}

/// Request information for logging context
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Unique ID for the request
    pub request_id: String,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Remote address
    pub remote_addr: String,
    /// User agent
    pub user_agent: String,
    /// Start time in milliseconds since epoch
    pub start_time_ms: u128,
}

impl RequestInfo {
    /// Create a new RequestInfo from request details
    pub fn new(method: String, path: String, remote_addr: String, user_agent: String) -> Self {
        Self {
            request_id: generate_request_id(),
            method,
            path,
            remote_addr,
            user_agent,
            start_time_ms: now_ms(),
        }
    }

    /// Capture request details, taking the request ID from `id_header` when
    /// the client supplied one.
    pub fn from_parts(
        method: &http::Method,
        uri: &http::Uri,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
        id_header: Option<&str>,
    ) -> Self {
        let mut info = Self::new(
            method.to_string(),
            uri.path().to_string(),
            remote_addr.map(|a| a.to_string()).unwrap_or_default(),
            headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        );

        let propagated = id_header
            .and_then(|name| headers.get(name))
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(id) = propagated {
            info.request_id = id.to_string();
        }
        info
    }

    /// Calculate elapsed time in milliseconds
    pub fn elapsed_ms(&self) -> u128 {
        now_ms().saturating_sub(self.start_time_ms)
    }
}

fn now_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Global logger guard that keeps the logger alive
pub struct LoggerGuard {
    _guard: slog_scope::GlobalLoggerGuard,
}

impl LoggerGuard {
    pub(crate) fn new(guard: slog_scope::GlobalLoggerGuard) -> Self {
        Self { _guard: guard }
    }
}

impl std::fmt::Debug for LoggerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoggerGuard")
    }
}
