// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reverse proxy engine.
//!
//! [`ReverseProxy::serve`] takes one inbound request through the request
//! filters, the [`Director`] and the [`Transport`], then streams the
//! upstream response back through the response filters.  Filters are
//! instantiated per request from the [`FilterRegistry`], so a filter keeps
//! state for exactly one exchange.

pub mod headers;
mod pipeline;
pub mod transport;
pub mod upgrade;

#[cfg(test)]
mod tests;

use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http::{Extensions, HeaderMap, Request, Response, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use slog::{Logger, debug, error, o, warn};
use tokio::sync::RwLock;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::codec;
use crate::core::{
    Exchange, FilterContext, NamedFilter, ProxyBody, ProxyError, RequestContext,
    RequestExchange, RequestHead, ResponseExchange, ResponseWriter, Signal, Stage, empty_body,
    full_body,
};
use crate::filters::{FilterConfig, FilterRegistry};
use crate::logging::structured::{RequestInfo, with_request_context};
use crate::pool::BufferPool;
use crate::splitter::{self, SplitterSettings};

pub use headers::{Director, SingleHostDirector};
pub use transport::{ReqwestTransport, Transport};
pub use upgrade::{BoxedIo, ClientUpgrade, PendingUpgrade, UpstreamUpgrade};

use pipeline::{BoundFilter, ResponsePipeline};

/// Turns an engine failure into the response the client receives.
pub trait ErrorHandler: fmt::Debug + Send + Sync {
    fn handle(&self, logger: &Logger, error: &ProxyError) -> Response<ProxyBody>;
}

/// Logs the failure and answers with a JSON error document.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonErrorHandler;

impl ErrorHandler for JsonErrorHandler {
    fn handle(&self, logger: &Logger, error: &ProxyError) -> Response<ProxyBody> {
        let status = error.status_code();
        if status.is_server_error() {
            error!(logger, "http: proxy error"; "error" => %error, "status" => status.as_u16());
        } else {
            warn!(logger, "request rejected"; "error" => %error, "status" => status.as_u16());
        }
        json_error(status, &error.to_string())
    }
}

/// `{"success":false,"message":<reason phrase>,"error":<detail>}`
pub fn json_error(status: StatusCode, detail: &str) -> Response<ProxyBody> {
    let body = json!({
        "success": false,
        "message": status.canonical_reason().unwrap_or("Error"),
        "error": detail,
    });
    let mut response = Response::new(full_body(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// A configured reverse proxy.  Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct ReverseProxy {
    director: Arc<dyn Director>,
    transport: Arc<dyn Transport>,
    registry: Arc<FilterRegistry>,
    request_filters: Vec<FilterConfig>,
    response_filters: Vec<FilterConfig>,
    splitter: SplitterSettings,
    flush_interval: Option<Duration>,
    pool: Arc<BufferPool>,
    error_handler: Arc<dyn ErrorHandler>,
    collaborators: Arc<Extensions>,
    logger: Logger,
    request_id_header: Option<String>,
    shutdown: CancellationToken,
}

/// Builder for [`ReverseProxy`].
#[derive(Debug)]
pub struct ReverseProxyBuilder {
    director: Arc<dyn Director>,
    transport: Option<Arc<dyn Transport>>,
    registry: Option<Arc<FilterRegistry>>,
    request_filters: Vec<FilterConfig>,
    response_filters: Vec<FilterConfig>,
    splitter: SplitterSettings,
    flush_interval_ms: i64,
    pool: Option<Arc<BufferPool>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    collaborators: Extensions,
    logger: Option<Logger>,
    request_id_header: Option<String>,
    shutdown: Option<CancellationToken>,
}

impl ReverseProxyBuilder {
    /// Upstream transport.  Defaults to [`ReqwestTransport`] with a 30 second
    /// timeout.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registry filters are instantiated from.  Defaults to the global one.
    pub fn registry(mut self, registry: Arc<FilterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn request_filter(mut self, filter: FilterConfig) -> Self {
        self.request_filters.push(filter);
        self
    }

    pub fn request_filters(mut self, filters: impl IntoIterator<Item = FilterConfig>) -> Self {
        self.request_filters.extend(filters);
        self
    }

    pub fn response_filter(mut self, filter: FilterConfig) -> Self {
        self.response_filters.push(filter);
        self
    }

    pub fn response_filters(mut self, filters: impl IntoIterator<Item = FilterConfig>) -> Self {
        self.response_filters.extend(filters);
        self
    }

    pub fn splitter(mut self, settings: SplitterSettings) -> Self {
        self.splitter = settings;
        self
    }

    /// Coalesce response writes for this many milliseconds.  Zero or a
    /// negative value writes every chunk immediately.
    pub fn flush_interval_ms(mut self, interval: i64) -> Self {
        self.flush_interval_ms = interval;
        self
    }

    pub fn buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Make a value reachable from every filter through
    /// [`FilterContext::collaborator`].
    pub fn collaborator<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.collaborators.insert(value);
        self
    }

    /// Add every collaborator in `collaborators`.
    pub fn collaborators(mut self, collaborators: Extensions) -> Self {
        self.collaborators.extend(collaborators);
        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Header a client-supplied request ID is taken from.
    pub fn request_id_header(mut self, header: Option<String>) -> Self {
        self.request_id_header = header;
        self
    }

    /// Token whose cancellation aborts every in-flight exchange.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Validate the filter declarations and build the proxy.
    ///
    /// Every declared filter is instantiated once to check that it exists,
    /// accepts its config and supports the stage it is declared in.
    pub fn build(self) -> Result<ReverseProxy, ProxyError> {
        let registry = self.registry.unwrap_or_else(FilterRegistry::global);
        for decl in &self.request_filters {
            check_declaration(&registry, decl, Stage::Request)?;
        }
        for decl in &self.response_filters {
            check_declaration(&registry, decl, Stage::Response)?;
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(Duration::from_secs(30))?),
        };

        let flush_interval =
            (self.flush_interval_ms > 0).then(|| Duration::from_millis(self.flush_interval_ms as u64));

        let logger = self
            .logger
            .unwrap_or_else(crate::logging::root_logger)
            .new(o!("component" => "proxy"));

        Ok(ReverseProxy {
            director: self.director,
            transport,
            registry,
            request_filters: self.request_filters,
            response_filters: self.response_filters,
            pool: self
                .pool
                .unwrap_or_else(|| BufferPool::shared(self.splitter.size)),
            splitter: self.splitter,
            flush_interval,
            error_handler: self.error_handler.unwrap_or_else(|| Arc::new(JsonErrorHandler)),
            collaborators: Arc::new(self.collaborators),
            logger,
            request_id_header: self.request_id_header,
            shutdown: self.shutdown.unwrap_or_default(),
        })
    }
}

fn check_declaration(registry: &FilterRegistry, decl: &FilterConfig, stage: Stage) -> Result<(), ProxyError> {
    let mut filter = registry.create(&decl.name, decl.config.clone())?;
    let capable = match stage {
        Stage::Request => filter.as_request_filter().is_some(),
        Stage::Response => filter.as_response_filter().is_some(),
    };
    if capable {
        Ok(())
    } else {
        Err(ProxyError::ConfigError(format!(
            "filter '{}' cannot run in the {stage} stage",
            decl.name
        )))
    }
}

/// Content type of a response marked as a stream whose upstream named none.
const STREAM_CONTENT_TYPE: &str = "text/event-stream; charset=utf-8";

fn default_stream_content_type(headers: &mut HeaderMap) {
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(STREAM_CONTENT_TYPE));
    }
}

/// Reply to a request filter error: the carried status, else `400`.
fn request_filter_error(err: &ProxyError) -> Response<ProxyBody> {
    let status = match err {
        ProxyError::Status { status, .. } => *status,
        _ => StatusCode::BAD_REQUEST,
    };
    json_error(status, &err.to_string())
}

impl ReverseProxy {
    pub fn builder(director: impl Director + 'static) -> ReverseProxyBuilder {
        ReverseProxyBuilder {
            director: Arc::new(director),
            transport: None,
            registry: None,
            request_filters: Vec::new(),
            response_filters: Vec::new(),
            splitter: SplitterSettings::default(),
            flush_interval_ms: 0,
            pool: None,
            error_handler: None,
            collaborators: Extensions::new(),
            logger: None,
            request_id_header: Some("X-Request-Id".to_string()),
            shutdown: None,
        }
    }

    pub fn director(&self) -> &Arc<dyn Director> {
        &self.director
    }

    /// Coalescing interval, `None` when every chunk is written immediately.
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval
    }

    /// Proxy one request.  Never fails: errors become error responses.
    pub async fn serve(
        &self,
        request: Request<reqwest::Body>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<ProxyBody> {
        let started = Instant::now();
        let info = RequestInfo::from_parts(
            request.method(),
            request.uri(),
            request.headers(),
            remote_addr,
            self.request_id_header.as_deref(),
        );
        let logger = with_request_context(&self.logger, &info);

        // Cancelled once the exchange is over, whichever task ends it.
        let cancel = self.shutdown.child_token();
        let guard = cancel.clone().drop_guard();

        let state = RequestContext {
            request_id: info.request_id.clone(),
            client_ip: remote_addr.map(|a| a.ip().to_string()),
            start_time: Some(started),
            ..RequestContext::default()
        };
        let ctx = FilterContext::new(
            Arc::new(RwLock::new(state)),
            logger.clone(),
            cancel,
            self.collaborators.clone(),
        );

        let response = match self.exchange(request, remote_addr, &ctx, guard).await {
            Ok(response) => response,
            Err(err) => self.error_handler.handle(&logger, &err),
        };

        debug!(logger, "[timing] {} {} -> {}", info.method, info.path, response.status().as_u16();
            "elapsed" => ?started.elapsed());
        response
    }

    fn instantiate(&self, decls: &[FilterConfig], stage: Stage) -> Result<Vec<NamedFilter>, ProxyError> {
        decls
            .iter()
            .map(|decl| {
                self.registry
                    .create(&decl.name, decl.config.clone())
                    .map(|filter| NamedFilter::new(decl.name.clone(), stage, filter))
            })
            .collect()
    }

    async fn exchange(
        &self,
        request: Request<reqwest::Body>,
        remote_addr: Option<SocketAddr>,
        ctx: &FilterContext,
        guard: DropGuard,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let request_filters = self.instantiate(&self.request_filters, Stage::Request)?;
        let response_filters = self.instantiate(&self.response_filters, Stage::Response)?;

        let mut exchange = RequestExchange::new(request, remote_addr);
        let client_upgrade = exchange.extensions_mut().remove::<ClientUpgrade>();

        /* ---------- request filters ---------- */
        if let Some(response) = self.run_request_filters(request_filters, ctx, &mut exchange).await? {
            return Ok(response);
        }

        /* ---------- outbound request ---------- */
        self.director.direct(&mut exchange)?;
        let requested_upgrade =
            headers::prepare_outbound(exchange.headers_mut(), remote_addr.map(|a| a.ip()))?;
        let head = exchange.head();

        let upstream_start = Instant::now();
        let response = self.transport.round_trip(exchange.into_request()).await?;
        debug!(ctx.logger(), "upstream answered";
            "status" => response.status().as_u16(), "upstream" => ?upstream_start.elapsed());

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return self.switch_protocols(requested_upgrade, client_upgrade, response, ctx, guard);
        }

        /* ---------- response pipeline ---------- */
        self.stream_response(response, head, response_filters, ctx, guard)
            .await
    }

    /// Run request filters in declared order.  `Some` is a finished
    /// response: an interception or a filter error.
    async fn run_request_filters(
        &self,
        mut filters: Vec<NamedFilter>,
        ctx: &FilterContext,
        exchange: &mut RequestExchange,
    ) -> Result<Option<Response<ProxyBody>>, ProxyError> {
        let mut writer = ResponseWriter::new();
        for named in filters.iter_mut() {
            let Some(filter) = named.filter.as_request_filter() else {
                continue;
            };
            let hook_ctx = ctx.scoped(&named.name, "request");
            let outcome = AssertUnwindSafe(filter.on_request(&hook_ctx, &mut writer, exchange))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(Signal::Continue)) => {}
                Ok(Ok(Signal::Intercept)) => {
                    debug!(hook_ctx.logger(), "request intercepted"; "status" => writer.status().as_u16());
                    return Ok(Some(writer.into_response()));
                }
                Ok(Err(err)) => {
                    warn!(hook_ctx.logger(), "request filter failed"; "error" => %err);
                    return Ok(Some(request_filter_error(&err)));
                }
                Err(panic) => return Err(ProxyError::from_panic(panic)),
            }
        }
        Ok(None)
    }

    /// Relay a `101 Switching Protocols` answer and splice the two
    /// connections once both sides have switched.
    fn switch_protocols(
        &self,
        requested: Option<String>,
        client: Option<ClientUpgrade>,
        response: Response<reqwest::Body>,
        ctx: &FilterContext,
        guard: DropGuard,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let offered = headers::upgrade_type(response.headers()).unwrap_or_default();
        if !headers::is_printable(&offered) {
            return Err(ProxyError::UpgradeError(format!(
                "backend tried to switch to invalid protocol {offered:?}"
            )));
        }
        let requested = requested.unwrap_or_default();
        if !requested.eq_ignore_ascii_case(&offered) {
            return Err(ProxyError::UpgradeError(format!(
                "backend tried to switch protocol {offered:?} when {requested:?} was requested"
            )));
        }

        let upstream = response
            .extensions()
            .get::<UpstreamUpgrade>()
            .and_then(|u| u.0.take())
            .ok_or_else(|| {
                ProxyError::UpgradeError("101 switching protocols response with non-writable body".to_string())
            })?;
        let client = client.and_then(|c| c.0.take()).ok_or_else(|| {
            ProxyError::UpgradeError("client connection cannot switch protocols".to_string())
        })?;

        let logger = ctx.logger().new(o!("upgrade" => offered));
        let cancel = ctx.cancellation().clone();
        tokio::spawn(async move {
            let _guard = guard;
            let spliced = async {
                let upstream = upstream.await?;
                let client = client.await?;
                upgrade::splice(client, upstream, cancel).await
            };
            match spliced.await {
                Ok(()) => debug!(logger, "upgraded connection closed"),
                Err(e) => warn!(logger, "upgraded connection failed"; "error" => %e),
            }
        });

        let (parts, _) = response.into_parts();
        let mut switched = Response::new(empty_body());
        *switched.status_mut() = parts.status;
        *switched.headers_mut() = parts.headers;
        Ok(switched)
    }

    async fn stream_response(
        &self,
        response: Response<reqwest::Body>,
        head: RequestHead,
        filters: Vec<NamedFilter>,
        ctx: &FilterContext,
        guard: DropGuard,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let (parts, body) = response.into_parts();
        let mut inbound = parts.headers;
        headers::prepare_inbound(&mut inbound);

        let (marked_stream, splitter_override) = {
            let state = ctx.request().read().await;
            (state.stream, state.splitter.clone())
        };
        let settings = splitter_override.unwrap_or_else(|| self.splitter.clone());
        let decoding = settings.decompress && codec::is_encoded(&inbound)?;

        if filters.is_empty() && !decoding {
            if marked_stream {
                default_stream_content_type(&mut inbound);
            }
            let mut relayed = Response::new(body.map_err(ProxyError::from).boxed_unsync());
            *relayed.status_mut() = parts.status;
            *relayed.headers_mut() = inbound;
            return Ok(relayed);
        }

        let mut exchange = ResponseExchange::new(parts.status, parts.version, inbound, head);
        let upstream_length = exchange.content_length();

        let chunker = splitter::build_splitter(&settings, exchange.headers(), &self.pool)?;
        if decoding {
            exchange.headers_mut().remove(CONTENT_ENCODING);
        }
        // Filters may change the body size; the length is recomputed by
        // the HTTP layer from the streamed body.
        exchange.headers_mut().remove(CONTENT_LENGTH);

        let mut bound: Vec<BoundFilter> = filters
            .into_iter()
            .rev()
            .map(|named| BoundFilter::new(named, ctx))
            .collect();
        pipeline::apply_headers(&mut bound, &mut exchange).await?;

        if marked_stream {
            default_stream_content_type(exchange.headers_mut());
        }
        // Header hooks may have turned the response into an event stream.
        let streaming = marked_stream || splitter::is_event_stream(exchange.headers());

        let flush = match self.flush_interval {
            Some(interval) if !streaming && upstream_length >= 0 => Some(interval),
            _ => None,
        };

        let status = exchange.status_code();
        let outbound = exchange.headers().clone();
        let (source, trailers) = pipeline::body_source(body);
        let producer = ResponsePipeline {
            splitter: chunker,
            source,
            filters: bound,
            exchange,
            trailers,
            logger: ctx.logger().clone(),
        };
        let mut rx = producer.spawn(flush, guard);

        // Streams commit their head at once; anything else waits for its
        // first chunk so an early failure still gets a proper error status.
        let first = if streaming { None } else { rx.recv().await };
        if let Some(Err(err)) = first {
            return Err(err);
        }

        let mut relayed = Response::new(pipeline::pipe_body(first, rx));
        *relayed.status_mut() = status;
        *relayed.headers_mut() = outbound;
        Ok(relayed)
    }
}
