// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use log::Level;
use serde::{Deserialize, Serialize};

use crate::core::{
    Exchange, Filter, FilterContext, ProxyError, RequestExchange, RequestFilter, ResponseExchange,
    ResponseFilter, ResponseWriter, Signal,
};
use crate::{debug_fmt, error_fmt, info_fmt, trace_fmt, warn_fmt};

/// Configuration for a logging filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingFilterConfig {
    /// Whether to log request headers
    #[serde(default = "default_true")]
    pub log_request_headers: bool,

    /// Whether to log request body
    #[serde(default = "default_false")]
    pub log_request_body: bool,

    /// Whether to log response headers
    #[serde(default = "default_true")]
    pub log_response_headers: bool,

    /// Whether to log response body
    #[serde(default = "default_false")]
    pub log_response_body: bool,

    /// Log level to use
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Maximum body size to log (in bytes)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_log_level() -> String {
    "trace".to_string()
}

fn default_max_body_size() -> usize {
    1024
}

impl Default for LoggingFilterConfig {
    fn default() -> Self {
        Self {
            log_request_headers: true,
            log_request_body: false,
            log_response_headers: true,
            log_response_body: false,
            log_level: default_log_level(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// A filter that logs requests and responses.
///
/// Response bodies are observed chunk by chunk as they stream past; the
/// first `max_body_size` bytes are kept and logged once the body ends.
#[derive(Debug)]
pub struct LoggingFilter {
    config: LoggingFilterConfig,
    captured: BytesMut,
    total: usize,
}

impl Default for LoggingFilter {
    fn default() -> Self {
        Self::new(LoggingFilterConfig::default())
    }
}

impl LoggingFilter {
    /// Create a new logging filter with the given configuration.
    pub fn new(config: LoggingFilterConfig) -> Self {
        Self {
            config,
            captured: BytesMut::new(),
            total: 0,
        }
    }

    /// Get the log level from the configuration.
    fn level(&self) -> Level {
        match self.config.log_level.to_lowercase().as_str() {
            "error" => Level::Error,
            "warn" => Level::Warn,
            "info" => Level::Info,
            "debug" => Level::Debug,
            _ => Level::Trace,
        }
    }

    /// Log a message at the configured log level.
    fn log(&self, request_id: &str, message: &str) {
        let context = format!("LoggingFilter {request_id}");
        match self.level() {
            Level::Error => error_fmt!(context, "{}", message),
            Level::Warn => warn_fmt!(context, "{}", message),
            Level::Info => info_fmt!(context, "{}", message),
            Level::Debug => debug_fmt!(context, "{}", message),
            Level::Trace => trace_fmt!(context, "{}", message),
        }
    }

    fn format_headers(headers: &HeaderMap) -> Vec<String> {
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| format!("{name}: {v}")))
            .collect()
    }

    /// Format body for logging (with size limits).
    fn format_body(&self, body: &[u8], total: usize) -> String {
        if total == 0 {
            return "[Empty body]".to_string();
        }

        let shown = &body[..body.len().min(self.config.max_body_size)];
        if total > shown.len() {
            return format!(
                "[Body truncated, showing {}/{} bytes]\n{}",
                shown.len(),
                total,
                String::from_utf8_lossy(shown)
            );
        }

        String::from_utf8_lossy(shown).to_string()
    }

    async fn request_id(ctx: &FilterContext) -> String {
        ctx.request().read().await.request_id.clone()
    }
}

impl Filter for LoggingFilter {
    fn name(&self) -> &str {
        "logging"
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }

    fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for LoggingFilter {
    async fn on_request(
        &mut self,
        ctx: &FilterContext,
        _writer: &mut ResponseWriter,
        exchange: &mut RequestExchange,
    ) -> Result<Signal, ProxyError> {
        let id = Self::request_id(ctx).await;

        if self.config.log_request_headers {
            self.log(&id, &format!(">> {} {}", exchange.method(), exchange.url()));
            for line in Self::format_headers(exchange.headers()) {
                self.log(&id, &format!(">> {line}"));
            }
        }

        if self.config.log_request_body {
            let body = exchange.body_buffer().await?.unwrap_or_default();
            let formatted = self.format_body(&body, body.len());
            self.log(&id, &format!(">> Request Body:\n{formatted}"));
        }

        Ok(Signal::Continue)
    }
}

#[async_trait]
impl ResponseFilter for LoggingFilter {
    async fn on_response_headers(
        &mut self,
        ctx: &FilterContext,
        exchange: &mut ResponseExchange,
    ) -> Result<(), ProxyError> {
        if self.config.log_response_headers {
            let id = Self::request_id(ctx).await;
            self.log(&id, &format!("<< {}", exchange.status_code()));
            for line in Self::format_headers(exchange.headers()) {
                self.log(&id, &format!("<< {line}"));
            }
        }
        Ok(())
    }

    async fn on_response_chunk(
        &mut self,
        _ctx: &FilterContext,
        _exchange: &mut ResponseExchange,
        chunk: Bytes,
    ) -> Result<Bytes, ProxyError> {
        self.total += chunk.len();
        if self.config.log_response_body && self.captured.len() < self.config.max_body_size {
            let take = (self.config.max_body_size - self.captured.len()).min(chunk.len());
            self.captured.extend_from_slice(&chunk[..take]);
        }
        Ok(chunk)
    }

    async fn on_response_eof(
        &mut self,
        ctx: &FilterContext,
        _exchange: &mut ResponseExchange,
        tail: Bytes,
    ) -> Result<Bytes, ProxyError> {
        if self.config.log_response_body {
            let id = Self::request_id(ctx).await;
            let formatted = self.format_body(&self.captured, self.total);
            self.log(&id, &format!("<< Response Body:\n{formatted}"));
        }
        Ok(tail)
    }
}
