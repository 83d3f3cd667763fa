// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core primitives – errors, the filter contract and the per-request context.
//!
//! Everything a filter author touches is defined here.  The engine that
//! drives these types lives in [`crate::proxy`], the exchange views that
//! filters read and mutate live in [`exchange`].
//!
//! A filter is a plain object implementing [`Filter`].  It opts into the
//! request phase by returning itself from [`Filter::as_request_filter`] and
//! into the response phase through [`Filter::as_response_filter`].  Request
//! filters run in declared order, response filters in the exact reverse of
//! theirs.

pub mod exchange;


use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http::{Extensions, HeaderMap, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use serde::{Deserialize, Serialize};
use slog::{Logger, o};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::codec::CodecError;
use crate::splitter::SplitterSettings;

pub use exchange::{Exchange, RequestExchange, RequestHead, ResponseExchange};

/// Body type handed to the HTTP server for every response the proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

/// Errors that can occur during proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// HTTP client error
    #[error("HTTP client error: {0}")]
    ClientError(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A filter rejected the exchange.
    #[error("filter error: {0}")]
    FilterError(String),

    /// A filter error that carries its own HTTP status.
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    /// The upstream did not answer in time.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The round trip to the upstream failed.
    #[error("transport error: {0}")]
    TransportError(String),

    /// A response filter failed while the body was streaming.
    #[error("response pipeline error: {0}")]
    PipelineError(String),

    /// A splitter produced a zero-length chunk without signalling EOF.
    #[error("splitter violated contract: empty chunk without error")]
    EmptyChunk,

    /// Content-Encoding handling failed.
    #[error("codec error: {0}")]
    CodecError(#[from] CodecError),

    /// Protocol upgrade negotiation failed.
    #[error("upgrade error: {0}")]
    UpgradeError(String),

    /// A filter hook panicked.
    #[error("filter panicked: {0}")]
    Panic(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<crate::config::error::ConfigError> for ProxyError {
    fn from(err: crate::config::error::ConfigError) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

impl ProxyError {
    /// Build an error that maps to the given HTTP status.
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        ProxyError::Status {
            status,
            message: message.into(),
        }
    }

    /// The HTTP status the default error handler answers with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Status { status, .. } => *status,
            ProxyError::FilterError(_) => StatusCode::BAD_REQUEST,
            ProxyError::Panic(_) | ProxyError::ConfigError(_) | ProxyError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        ProxyError::Panic(message)
    }
}

/// Control signal returned by request filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Hand the exchange to the next filter.
    Continue,
    /// The filter wrote the complete response; nothing else runs.
    Intercept,
}

/// Pipeline stage a declared filter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Request,
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Request => write!(f, "request"),
            Stage::Response => write!(f, "response"),
        }
    }
}

/// Per-request state shared by every filter of one exchange.
#[derive(Debug, Default, Clone)]
pub struct RequestContext {
    /// Identifier used in every log line of the request
    pub request_id: String,
    /// The original client's IP address
    pub client_ip: Option<String>,
    /// The start time of the request
    pub start_time: Option<Instant>,
    /// Marks a streaming exchange such as server-sent events
    pub stream: bool,
    /// Overrides the route's splitter for this response
    pub splitter: Option<SplitterSettings>,
    /// Custom attributes that can be set by filters
    pub attributes: HashMap<String, serde_json::Value>,
}

/// Everything a filter hook can reach besides the exchange itself.
///
/// The context is cheap to clone.  Each hook invocation receives a copy whose
/// logger is tagged with the filter name and the hook being run.
#[derive(Debug, Clone)]
pub struct FilterContext {
    request: Arc<RwLock<RequestContext>>,
    logger: Logger,
    cancel: CancellationToken,
    collaborators: Arc<Extensions>,
}

impl FilterContext {
    pub fn new(
        request: Arc<RwLock<RequestContext>>,
        logger: Logger,
        cancel: CancellationToken,
        collaborators: Arc<Extensions>,
    ) -> Self {
        Self {
            request,
            logger,
            cancel,
            collaborators,
        }
    }

    /// Shared request state.
    pub fn request(&self) -> &Arc<RwLock<RequestContext>> {
        &self.request
    }

    /// Request-scoped structured logger.
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Fires when the client goes away or the server shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Look up a collaborator registered on the proxy, e.g. an audit sink.
    pub fn collaborator<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.collaborators.get::<T>()
    }

    pub(crate) fn scoped(&self, filter: &str, hook: &'static str) -> Self {
        Self {
            request: self.request.clone(),
            logger: self
                .logger
                .new(o!("filter" => filter.to_string(), "hook" => hook)),
            cancel: self.cancel.clone(),
            collaborators: self.collaborators.clone(),
        }
    }
}

/// Response under construction by a request filter that intercepts.
#[derive(Debug)]
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    written: bool,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            written: false,
        }
    }
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
        self.written = true;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Append bytes to the response body.
    pub fn write(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
        self.written = true;
    }

    /// Replace the response with a JSON document.
    pub fn write_json<T: Serialize>(&mut self, status: StatusCode, value: &T) -> Result<(), ProxyError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| ProxyError::Other(format!("failed to encode JSON response: {e}")))?;
        self.status = status;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body.clear();
        self.write(&body);
        Ok(())
    }

    /// Whether anything has been written so far.
    pub fn is_written(&self) -> bool {
        self.written
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn into_response(self) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(self.body.freeze()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response.headers_mut().remove(CONTENT_LENGTH);
        response
    }
}

/// Build a complete in-memory body.
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Request-phase capability.
#[async_trait]
pub trait RequestFilter: Send {
    /// Inspect or mutate the outbound request.
    ///
    /// Returning [`Signal::Intercept`] ends the exchange with whatever was
    /// written to `writer`.  An error ends it with a JSON error response.
    async fn on_request(
        &mut self,
        ctx: &FilterContext,
        writer: &mut ResponseWriter,
        exchange: &mut RequestExchange,
    ) -> Result<Signal, ProxyError>;
}

/// Response-phase capability.  All hooks default to pass-through.
#[async_trait]
pub trait ResponseFilter: Send {
    /// Runs once before any body byte is read.  Header changes made here are
    /// the ones the client sees.
    async fn on_response_headers(
        &mut self,
        _ctx: &FilterContext,
        _exchange: &mut ResponseExchange,
    ) -> Result<(), ProxyError> {
        Ok(())
    }

    /// Transform one chunk.  Returning an empty chunk swallows it.
    async fn on_response_chunk(
        &mut self,
        _ctx: &FilterContext,
        _exchange: &mut ResponseExchange,
        chunk: Bytes,
    ) -> Result<Bytes, ProxyError> {
        Ok(chunk)
    }

    /// Runs once at end of stream with the tail produced by the filters
    /// before it.  Whatever is returned is written before the body closes.
    async fn on_response_eof(
        &mut self,
        _ctx: &FilterContext,
        _exchange: &mut ResponseExchange,
        tail: Bytes,
    ) -> Result<Bytes, ProxyError> {
        Ok(tail)
    }
}

/// A filter that participates in one or both pipeline phases.
pub trait Filter: fmt::Debug + Send {
    /// Get the filter name.
    fn name(&self) -> &str;

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        None
    }

    fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
        None
    }
}

/// A filter instance bound to its declared name and stage.
///
/// Instances are created per request and never shared between requests.
#[derive(Debug)]
pub struct NamedFilter {
    pub name: String,
    pub stage: Stage,
    pub filter: Box<dyn Filter>,
}

impl NamedFilter {
    pub fn new(name: impl Into<String>, stage: Stage, filter: Box<dyn Filter>) -> Self {
        Self {
            name: name.into(),
            stage,
            filter,
        }
    }
}
