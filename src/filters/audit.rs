// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exchange auditing.
//!
//! The request stage captures who asked for what; the response stage adds
//! the outcome and hands the finished [`AuditRecord`] to the [`AuditSink`]
//! registered as a proxy collaborator.  The two stages run on separate
//! filter instances and meet through the request context attributes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use http::header::{AUTHORIZATION, CONTENT_TYPE, SERVER, USER_AGENT};
use serde::{Deserialize, Serialize};
use slog::{error, info};

use crate::core::{
    Exchange, Filter, FilterContext, ProxyError, RequestExchange, RequestFilter, ResponseExchange,
    ResponseFilter, ResponseWriter, Signal,
};

const REQUEST_ATTRIBUTE: &str = "audit.request";

/// Destination for finished audit records.
#[async_trait]
pub trait AuditSink: fmt::Debug + Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), ProxyError>;
}

/// Writes audit records to the log as JSON.
#[derive(Debug, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), ProxyError> {
        let line = serde_json::to_string(&record)
            .map_err(|e| ProxyError::Other(format!("failed to encode audit record: {e}")))?;
        log::info!(target: "chainproxy::audit", "{line}");
        Ok(())
    }
}

/// Collaborator handle filters look up to reach the sink.
pub type SharedAuditSink = Arc<dyn AuditSink>;

/// One audited exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: String,
    /// Last four characters of the caller's API key
    pub api_key_hint: Option<String>,
    pub session_id: Option<String>,
    pub method: String,
    pub url: String,
    pub user_agent: Option<String>,
    pub request_content_type: Option<String>,
    pub request_body: Option<String>,
    pub request_at: Option<DateTime<Utc>>,
    pub status: Option<u16>,
    pub server: Option<String>,
    pub response_content_type: Option<String>,
    pub response_body: Option<String>,
    pub response_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<i64>,
}

/// Configuration for the audit filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Keep request and response bodies in the record
    #[serde(default = "default_true")]
    pub record_bodies: bool,

    /// Bodies are cut after this many bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Header carrying the caller's session
    #[serde(default = "default_session_header")]
    pub session_header: String,
}

fn default_true() -> bool {
    true
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_session_header() -> String {
    "X-Session-Id".to_string()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            record_bodies: true,
            max_body_bytes: default_max_body_bytes(),
            session_header: default_session_header(),
        }
    }
}

#[derive(Debug)]
pub struct AuditFilter {
    config: AuditConfig,
    response_body: BytesMut,
    truncated: bool,
}

impl AuditFilter {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            response_body: BytesMut::new(),
            truncated: false,
        }
    }

    fn header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
        names
            .iter()
            .filter_map(|name| headers.get(*name))
            .filter_map(|v| v.to_str().ok())
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn api_key_hint(headers: &HeaderMap) -> Option<String> {
        let key = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| Self::header(headers, &["api-key"]))?;
        let chars: Vec<char> = key.chars().collect();
        let start = chars.len().saturating_sub(4);
        Some(chars[start..].iter().collect())
    }

    fn body_text(&self, body: &[u8], truncated: bool) -> String {
        let shown = &body[..body.len().min(self.config.max_body_bytes)];
        let mut text = String::from_utf8_lossy(shown).into_owned();
        if truncated || body.len() > shown.len() {
            text.push_str("...[truncated]");
        }
        text
    }

    async fn request_half(ctx: &FilterContext) -> Option<AuditRecord> {
        let state = ctx.request().read().await;
        state
            .attributes
            .get(REQUEST_ATTRIBUTE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl Filter for AuditFilter {
    fn name(&self) -> &str {
        "audit"
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }

    fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for AuditFilter {
    async fn on_request(
        &mut self,
        ctx: &FilterContext,
        _writer: &mut ResponseWriter,
        exchange: &mut RequestExchange,
    ) -> Result<Signal, ProxyError> {
        let headers = exchange.headers();
        let mut record = AuditRecord {
            api_key_hint: Self::api_key_hint(headers),
            session_id: Self::header(headers, &[self.config.session_header.as_str()]),
            method: exchange.method().to_string(),
            url: exchange.url().to_string(),
            user_agent: Self::header(headers, &[USER_AGENT.as_str(), "x-user-agent"]),
            request_content_type: Self::header(headers, &[CONTENT_TYPE.as_str()]),
            request_at: Some(Utc::now()),
            ..AuditRecord::default()
        };

        if self.config.record_bodies {
            // A body that cannot be read is still audited, just without it.
            match exchange.body_buffer().await {
                Ok(Some(body)) if !body.is_empty() => {
                    record.request_body = Some(self.body_text(&body, false));
                }
                Ok(_) => {}
                Err(e) => error!(ctx.logger(), "failed to read request body for audit"; "error" => %e),
            }
        }

        let mut state = ctx.request().write().await;
        record.request_id = state.request_id.clone();
        let value = serde_json::to_value(&record)
            .map_err(|e| ProxyError::Other(format!("failed to encode audit record: {e}")))?;
        state.attributes.insert(REQUEST_ATTRIBUTE.to_string(), value);
        Ok(Signal::Continue)
    }
}

#[async_trait]
impl ResponseFilter for AuditFilter {
    async fn on_response_chunk(
        &mut self,
        _ctx: &FilterContext,
        _exchange: &mut ResponseExchange,
        chunk: Bytes,
    ) -> Result<Bytes, ProxyError> {
        if self.config.record_bodies {
            let room = self.config.max_body_bytes.saturating_sub(self.response_body.len());
            if chunk.len() > room {
                self.truncated = true;
            }
            self.response_body
                .extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
        Ok(chunk)
    }

    async fn on_response_eof(
        &mut self,
        ctx: &FilterContext,
        exchange: &mut ResponseExchange,
        tail: Bytes,
    ) -> Result<Bytes, ProxyError> {
        let mut record = match Self::request_half(ctx).await {
            Some(record) => record,
            None => AuditRecord {
                method: exchange.method().to_string(),
                url: exchange.url().to_string(),
                ..AuditRecord::default()
            },
        };

        let now = Utc::now();
        record.request_id = ctx.request().read().await.request_id.clone();
        record.status = Some(exchange.status_code().as_u16());
        record.server = Self::header(exchange.headers(), &[SERVER.as_str()]);
        record.response_content_type = Self::header(exchange.headers(), &[CONTENT_TYPE.as_str()]);
        record.response_at = Some(now);
        record.elapsed_ms = record
            .request_at
            .map(|at| (now - at).num_milliseconds());
        if self.config.record_bodies {
            record.response_body = Some(self.body_text(&self.response_body, self.truncated));
        }

        let sink: SharedAuditSink = ctx
            .collaborator::<SharedAuditSink>()
            .cloned()
            .unwrap_or_else(|| Arc::new(LogAuditSink));

        // The response is already on its way; a failed write is only logged.
        match sink.record(record).await {
            Ok(()) => info!(ctx.logger(), "audit record written"),
            Err(e) => error!(ctx.logger(), "failed to write audit record"; "error" => %e),
        }
        Ok(tail)
    }
}
