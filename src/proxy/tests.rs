// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::stream;
    use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue};
    use http::{HeaderMap, Method, Request, Response, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use slog::{Discard, Logger, o};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::io::StreamReader;

    use crate::codec::{Encoding, compress};
    use crate::core::{
        Exchange, Filter, FilterContext, ProxyBody, ProxyError, RequestExchange, RequestFilter,
        RequestHead, ResponseExchange, ResponseFilter, ResponseWriter, Signal,
    };
    use crate::filters::{FilterConfig, FilterRegistry, parse_config};
    use crate::proxy::pipeline::ResponsePipeline;
    use crate::proxy::{
        ClientUpgrade, ErrorHandler, PendingUpgrade, ReverseProxy, SingleHostDirector, Transport,
        UpstreamUpgrade, json_error,
    };
    use crate::splitter::{ChunkSource, Splitter, SplitterKind, SplitterSettings};

    /* ---------- test transport ---------- */

    #[derive(Debug, Clone)]
    struct Captured {
        method: Method,
        uri: String,
        headers: HeaderMap,
        body: Bytes,
    }

    type Responder = Box<dyn Fn() -> Response<reqwest::Body> + Send + Sync>;

    struct MockTransport {
        calls: AtomicUsize,
        captured: Mutex<Vec<Captured>>,
        respond: Responder,
    }

    impl std::fmt::Debug for MockTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockTransport").finish()
        }
    }

    impl MockTransport {
        fn new(respond: impl Fn() -> Response<reqwest::Body> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                captured: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        fn text(body: &'static str) -> Arc<Self> {
            Self::new(move || {
                Response::builder()
                    .header(CONTENT_TYPE, "text/plain")
                    .header(CONTENT_LENGTH, body.len())
                    .body(reqwest::Body::from(body))
                    .unwrap()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last(&self) -> Captured {
            self.captured.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn round_trip(
            &self,
            request: Request<reqwest::Body>,
        ) -> Result<Response<reqwest::Body>, ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (parts, body) = request.into_parts();
            let body = body.collect().await?.to_bytes();
            self.captured.lock().unwrap().push(Captured {
                method: parts.method,
                uri: parts.uri.to_string(),
                headers: parts.headers,
                body,
            });
            Ok((self.respond)())
        }
    }

    #[derive(Debug)]
    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn round_trip(
            &self,
            _request: Request<reqwest::Body>,
        ) -> Result<Response<reqwest::Body>, ProxyError> {
            Err(ProxyError::TransportError("connection refused".to_string()))
        }
    }

    /* ---------- test filters ---------- */

    type Journal = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct Recording {
        label: String,
        journal: Journal,
    }

    impl Filter for Recording {
        fn name(&self) -> &str {
            "record"
        }
        fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
            Some(self)
        }
        fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestFilter for Recording {
        async fn on_request(
            &mut self,
            _ctx: &FilterContext,
            _writer: &mut ResponseWriter,
            _exchange: &mut RequestExchange,
        ) -> Result<Signal, ProxyError> {
            self.journal.lock().unwrap().push(format!("request:{}", self.label));
            Ok(Signal::Continue)
        }
    }

    #[async_trait]
    impl ResponseFilter for Recording {
        async fn on_response_headers(
            &mut self,
            _ctx: &FilterContext,
            _exchange: &mut ResponseExchange,
        ) -> Result<(), ProxyError> {
            self.journal.lock().unwrap().push(format!("response:{}", self.label));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Deny;

    impl Filter for Deny {
        fn name(&self) -> &str {
            "deny"
        }
        fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestFilter for Deny {
        async fn on_request(
            &mut self,
            _ctx: &FilterContext,
            writer: &mut ResponseWriter,
            _exchange: &mut RequestExchange,
        ) -> Result<Signal, ProxyError> {
            writer.set_status(StatusCode::FORBIDDEN);
            writer.write(b"denied");
            Ok(Signal::Intercept)
        }
    }

    /// Fails the request stage in the way its config says.
    #[derive(Debug)]
    struct Broken {
        mode: String,
    }

    impl Filter for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
            Some(self)
        }
        fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestFilter for Broken {
        async fn on_request(
            &mut self,
            _ctx: &FilterContext,
            _writer: &mut ResponseWriter,
            _exchange: &mut RequestExchange,
        ) -> Result<Signal, ProxyError> {
            match self.mode.as_str() {
                "error" => Err(ProxyError::FilterError("missing api key".to_string())),
                "status" => Err(ProxyError::status(StatusCode::UNAUTHORIZED, "who are you")),
                "panic" => panic!("request filter exploded"),
                _ => Ok(Signal::Continue),
            }
        }
    }

    #[async_trait]
    impl ResponseFilter for Broken {
        async fn on_response_headers(
            &mut self,
            _ctx: &FilterContext,
            _exchange: &mut ResponseExchange,
        ) -> Result<(), ProxyError> {
            match self.mode.as_str() {
                "response_error" => Err(ProxyError::FilterError("bad upstream headers".to_string())),
                "response_status" => Err(ProxyError::status(StatusCode::IM_A_TEAPOT, "teapot")),
                _ => Ok(()),
            }
        }
    }

    /// Turns any request into `POST {"x":1}`.
    #[derive(Debug)]
    struct Rewrite;

    impl Filter for Rewrite {
        fn name(&self) -> &str {
            "rewrite"
        }
        fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestFilter for Rewrite {
        async fn on_request(
            &mut self,
            _ctx: &FilterContext,
            _writer: &mut ResponseWriter,
            exchange: &mut RequestExchange,
        ) -> Result<Signal, ProxyError> {
            let body = br#"{"x":1}"#;
            exchange.set_method(Method::POST);
            exchange
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            exchange.set_body(reqwest::Body::from(&body[..]), body.len() as i64);
            Ok(Signal::Continue)
        }
    }

    /// Uppercases chunks, drops lines containing `drop`, and counts what it
    /// let through into an `x-checksum` trailer.
    #[derive(Debug, Default)]
    struct Shout {
        seen: usize,
    }

    impl Filter for Shout {
        fn name(&self) -> &str {
            "shout"
        }
        fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl ResponseFilter for Shout {
        async fn on_response_headers(
            &mut self,
            _ctx: &FilterContext,
            exchange: &mut ResponseExchange,
        ) -> Result<(), ProxyError> {
            exchange.declare_trailer(&HeaderName::from_static("x-checksum"));
            Ok(())
        }

        async fn on_response_chunk(
            &mut self,
            _ctx: &FilterContext,
            _exchange: &mut ResponseExchange,
            chunk: Bytes,
        ) -> Result<Bytes, ProxyError> {
            if chunk.windows(4).any(|w| w == b"drop") {
                return Ok(Bytes::new());
            }
            self.seen += chunk.len();
            Ok(Bytes::from(chunk.to_ascii_uppercase()))
        }

        async fn on_response_eof(
            &mut self,
            _ctx: &FilterContext,
            exchange: &mut ResponseExchange,
            tail: Bytes,
        ) -> Result<Bytes, ProxyError> {
            exchange
                .trailers_mut()
                .insert("x-checksum", HeaderValue::from(self.seen));
            Ok(tail)
        }
    }

    /// Fails the body stage in the way its config says.  `eof_panic`
    /// swallows every chunk so nothing is sent before the end hook runs.
    #[derive(Debug)]
    struct Faulty {
        mode: String,
    }

    impl Filter for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }
        fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl ResponseFilter for Faulty {
        async fn on_response_chunk(
            &mut self,
            _ctx: &FilterContext,
            _exchange: &mut ResponseExchange,
            chunk: Bytes,
        ) -> Result<Bytes, ProxyError> {
            match self.mode.as_str() {
                "chunk_panic" => panic!("chunk hook exploded"),
                "chunk_error" => Err(ProxyError::FilterError("corrupt chunk".to_string())),
                "eof_panic" => Ok(Bytes::new()),
                _ => Ok(chunk),
            }
        }

        async fn on_response_eof(
            &mut self,
            _ctx: &FilterContext,
            _exchange: &mut ResponseExchange,
            tail: Bytes,
        ) -> Result<Bytes, ProxyError> {
            if self.mode == "eof_panic" {
                panic!("eof hook exploded");
            }
            Ok(tail)
        }
    }

    /// Holds back the whole body and releases it bracketed at the end.
    #[derive(Debug, Default)]
    struct Batch {
        held: Vec<u8>,
    }

    impl Filter for Batch {
        fn name(&self) -> &str {
            "batch"
        }
        fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl ResponseFilter for Batch {
        async fn on_response_chunk(
            &mut self,
            _ctx: &FilterContext,
            _exchange: &mut ResponseExchange,
            chunk: Bytes,
        ) -> Result<Bytes, ProxyError> {
            self.held.extend_from_slice(&chunk);
            Ok(Bytes::new())
        }

        async fn on_response_eof(
            &mut self,
            _ctx: &FilterContext,
            _exchange: &mut ResponseExchange,
            tail: Bytes,
        ) -> Result<Bytes, ProxyError> {
            let mut out = Vec::with_capacity(self.held.len() + tail.len() + 2);
            out.push(b'[');
            out.append(&mut self.held);
            out.extend_from_slice(&tail);
            out.push(b']');
            Ok(Bytes::from(out))
        }
    }

    /// Marks the exchange as a stream.
    #[derive(Debug)]
    struct MarkStream;

    impl Filter for MarkStream {
        fn name(&self) -> &str {
            "mark_stream"
        }
        fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestFilter for MarkStream {
        async fn on_request(
            &mut self,
            ctx: &FilterContext,
            _writer: &mut ResponseWriter,
            _exchange: &mut RequestExchange,
        ) -> Result<Signal, ProxyError> {
            ctx.request().write().await.stream = true;
            Ok(Signal::Continue)
        }
    }

    /// Relabels the upstream response as server-sent events.
    #[derive(Debug)]
    struct AsEvents;

    impl Filter for AsEvents {
        fn name(&self) -> &str {
            "as_events"
        }
        fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl ResponseFilter for AsEvents {
        async fn on_response_headers(
            &mut self,
            _ctx: &FilterContext,
            exchange: &mut ResponseExchange,
        ) -> Result<(), ProxyError> {
            exchange
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            Ok(())
        }
    }

    #[derive(serde::Deserialize)]
    struct LabelConfig {
        #[serde(default)]
        label: String,
    }

    fn registry(journal: &Journal) -> Arc<FilterRegistry> {
        let registry = FilterRegistry::new();
        let journal = journal.clone();
        registry
            .register("record", move |cfg| {
                let cfg: LabelConfig = parse_config("record", cfg)?;
                Ok(Box::new(Recording {
                    label: cfg.label,
                    journal: journal.clone(),
                }) as Box<dyn Filter>)
            })
            .unwrap();
        registry
            .register("deny", |_| Ok(Box::new(Deny) as Box<dyn Filter>))
            .unwrap();
        registry
            .register("broken", |cfg| {
                let cfg: LabelConfig = parse_config("broken", cfg)?;
                Ok(Box::new(Broken { mode: cfg.label }) as Box<dyn Filter>)
            })
            .unwrap();
        registry
            .register("rewrite", |_| Ok(Box::new(Rewrite) as Box<dyn Filter>))
            .unwrap();
        registry
            .register("shout", |_| Ok(Box::new(Shout::default()) as Box<dyn Filter>))
            .unwrap();
        registry
            .register("faulty", |cfg| {
                let cfg: LabelConfig = parse_config("faulty", cfg)?;
                Ok(Box::new(Faulty { mode: cfg.label }) as Box<dyn Filter>)
            })
            .unwrap();
        registry
            .register("batch", |_| Ok(Box::new(Batch::default()) as Box<dyn Filter>))
            .unwrap();
        registry
            .register("mark_stream", |_| Ok(Box::new(MarkStream) as Box<dyn Filter>))
            .unwrap();
        registry
            .register("as_events", |_| Ok(Box::new(AsEvents) as Box<dyn Filter>))
            .unwrap();
        Arc::new(registry)
    }

    fn labelled(name: &str, label: &str) -> FilterConfig {
        FilterConfig::with_config(name, json!({ "label": label }))
    }

    fn proxy(transport: Arc<dyn Transport>, journal: &Journal) -> crate::proxy::ReverseProxyBuilder {
        ReverseProxy::builder(SingleHostDirector::new("http://upstream.test/base").unwrap())
            .transport(transport)
            .registry(registry(journal))
            .logger(Logger::root(Discard, o!()))
    }

    fn client() -> Option<SocketAddr> {
        Some("192.0.2.7:40000".parse().unwrap())
    }

    fn get(uri: &str) -> Request<reqwest::Body> {
        Request::builder()
            .uri(uri)
            .body(reqwest::Body::from(Vec::new()))
            .unwrap()
    }

    async fn body_json(response: Response<ProxyBody>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /* ---------- build ---------- */

    #[test]
    fn test_build_rejects_unknown_filter() {
        let journal = Journal::default();
        let err = proxy(MockTransport::text("ok"), &journal)
            .request_filter(FilterConfig::new("nope"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ProxyError::ConfigError(_)));
    }

    #[test]
    fn test_build_rejects_filter_in_unsupported_stage() {
        let journal = Journal::default();
        let err = proxy(MockTransport::text("ok"), &journal)
            .response_filter(FilterConfig::new("deny"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("response stage"));
    }

    #[test]
    fn test_non_positive_flush_interval_is_immediate() {
        let journal = Journal::default();
        let built = proxy(MockTransport::text("ok"), &journal)
            .flush_interval_ms(-1)
            .build()
            .unwrap();
        assert_eq!(built.flush_interval(), None);

        let built = proxy(MockTransport::text("ok"), &journal)
            .flush_interval_ms(25)
            .build()
            .unwrap();
        assert_eq!(built.flush_interval(), Some(Duration::from_millis(25)));
    }

    /* ---------- request side ---------- */

    #[tokio::test]
    async fn test_filter_order_request_forward_response_reversed() {
        let journal = Journal::default();
        let transport = MockTransport::text("ok");
        let proxy = proxy(transport.clone(), &journal)
            .request_filters([labelled("record", "a"), labelled("record", "b")])
            .response_filters([labelled("record", "c"), labelled("record", "d")])
            .build()
            .unwrap();

        let response = proxy.serve(get("/orders"), client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "ok");

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["request:a", "request:b", "response:d", "response:c"]
        );
    }

    #[tokio::test]
    async fn test_director_and_forwarding_headers() {
        let journal = Journal::default();
        let transport = MockTransport::text("ok");
        let proxy = proxy(transport.clone(), &journal).build().unwrap();

        let request = Request::builder()
            .uri("/orders?page=2")
            .header("connection", "keep-alive, x-private")
            .header("x-private", "secret")
            .header("x-forwarded-for", "203.0.113.1")
            .body(reqwest::Body::from(Vec::new()))
            .unwrap();
        proxy.serve(request, client()).await;

        let sent = transport.last();
        assert_eq!(sent.uri, "http://upstream.test/base/orders?page=2");
        assert!(sent.headers.get("connection").is_none());
        assert!(sent.headers.get("x-private").is_none());
        assert_eq!(sent.headers["x-forwarded-for"], "203.0.113.1, 192.0.2.7");
    }

    #[tokio::test]
    async fn test_intercept_never_reaches_upstream() {
        let journal = Journal::default();
        let transport = MockTransport::text("ok");
        let proxy = proxy(transport.clone(), &journal)
            .request_filters([FilterConfig::new("deny"), labelled("record", "late")])
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "denied");
        assert_eq!(transport.calls(), 0);
        assert!(journal.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_rewritten_to_post_with_body() {
        let journal = Journal::default();
        let transport = MockTransport::text("ok");
        let proxy = proxy(transport.clone(), &journal)
            .request_filter(FilterConfig::new("rewrite"))
            .build()
            .unwrap();

        proxy.serve(get("/items"), client()).await;

        let sent = transport.last();
        assert_eq!(sent.method, Method::POST);
        assert_eq!(sent.body, Bytes::from_static(br#"{"x":1}"#));
        assert_eq!(sent.headers[CONTENT_LENGTH], "7");
    }

    #[tokio::test]
    async fn test_request_filter_error_answers_400() {
        let journal = Journal::default();
        let transport = MockTransport::text("ok");
        let proxy = proxy(transport.clone(), &journal)
            .request_filter(labelled("broken", "error"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Bad Request");
        assert!(body["error"].as_str().unwrap().contains("missing api key"));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_request_filter_error_keeps_carried_status() {
        let journal = Journal::default();
        let proxy = proxy(MockTransport::text("ok"), &journal)
            .request_filter(labelled("broken", "status"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "who are you");
    }

    #[tokio::test]
    async fn test_request_filter_panic_answers_500() {
        let journal = Journal::default();
        let transport = MockTransport::text("ok");
        let proxy = proxy(transport.clone(), &journal)
            .request_filter(labelled("broken", "panic"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("exploded"));
        assert_eq!(transport.calls(), 0);
    }

    /* ---------- upstream failures ---------- */

    #[tokio::test]
    async fn test_transport_failure_answers_502() {
        let journal = Journal::default();
        let proxy = proxy(Arc::new(FailingTransport), &journal).build().unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Bad Gateway");
        assert!(body["error"].as_str().unwrap().contains("connection refused"));
    }

    #[derive(Debug)]
    struct Unavailable;

    impl ErrorHandler for Unavailable {
        fn handle(&self, _logger: &Logger, error: &ProxyError) -> Response<ProxyBody> {
            json_error(StatusCode::SERVICE_UNAVAILABLE, &error.to_string())
        }
    }

    #[tokio::test]
    async fn test_custom_error_handler() {
        let journal = Journal::default();
        let proxy = proxy(Arc::new(FailingTransport), &journal)
            .error_handler(Arc::new(Unavailable))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_response_header_hook_failure() {
        let journal = Journal::default();
        let proxy = proxy(MockTransport::text("ok"), &journal)
            .response_filter(labelled("broken", "response_error"))
            .build()
            .unwrap();
        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("filter 'broken'"));

        let proxy = self::proxy(MockTransport::text("ok"), &journal)
            .response_filter(labelled("broken", "response_status"))
            .build()
            .unwrap();
        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    /* ---------- response streaming ---------- */

    #[tokio::test]
    async fn test_pass_through_keeps_length() {
        let journal = Journal::default();
        let proxy = proxy(MockTransport::text("hello"), &journal).build().unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.headers()[CONTENT_LENGTH], "5");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn test_swallowed_chunks_and_trailers() {
        let journal = Journal::default();
        let transport = MockTransport::new(|| {
            Response::builder()
                .header(CONTENT_TYPE, "text/plain")
                .body(reqwest::Body::from("keep one\ndrop me\nkeep two\n"))
                .unwrap()
        });
        let proxy = proxy(transport, &journal)
            .splitter(SplitterSettings {
                kind: SplitterKind::Line,
                ..SplitterSettings::default()
            })
            .response_filter(FilterConfig::new("shout"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.headers()["trailer"], "x-checksum");
        assert!(response.headers().get(CONTENT_LENGTH).is_none());

        let collected = response.into_body().collect().await.unwrap();
        let trailers = collected.trailers().cloned().unwrap();
        assert_eq!(collected.to_bytes(), "KEEP ONE\nKEEP TWO\n");
        assert_eq!(trailers["x-checksum"], "18");
    }

    #[tokio::test]
    async fn test_gzip_body_is_decoded_for_filters() {
        let journal = Journal::default();
        let transport = MockTransport::new(|| {
            let encoded = compress(Encoding::Gzip, b"hello world").unwrap();
            Response::builder()
                .header(CONTENT_ENCODING, "gzip")
                .header(CONTENT_LENGTH, encoded.len())
                .body(reqwest::Body::from(encoded))
                .unwrap()
        });
        let proxy = proxy(transport, &journal)
            .splitter(SplitterSettings {
                decompress: true,
                ..SplitterSettings::default()
            })
            .response_filter(FilterConfig::new("shout"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "HELLO WORLD");
    }

    fn chunked_upstream(content_type: &'static str) -> Arc<MockTransport> {
        MockTransport::new(move || {
            let chunks: Vec<Result<&'static str, io::Error>> =
                vec![Ok("data: a\n\n"), Ok("data: b\n\n"), Ok("data: c\n\n")];
            Response::builder()
                .header(CONTENT_TYPE, content_type)
                .header(CONTENT_LENGTH, 27)
                .body(reqwest::Body::wrap_stream(stream::iter(chunks)))
                .unwrap()
        })
    }

    async fn data_frames(response: Response<ProxyBody>) -> Vec<Bytes> {
        let mut body = response.into_body();
        let mut frames = Vec::new();
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame.unwrap().into_data() {
                frames.push(data);
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_flush_interval_coalesces_writes() {
        let journal = Journal::default();
        let proxy = proxy(chunked_upstream("text/plain"), &journal)
            .response_filter(labelled("record", "x"))
            .flush_interval_ms(200)
            .build()
            .unwrap();

        let frames = data_frames(proxy.serve(get("/"), client()).await).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], "data: a\n\ndata: b\n\ndata: c\n\n");
    }

    #[tokio::test]
    async fn test_event_streams_flush_immediately() {
        let journal = Journal::default();
        let proxy = proxy(chunked_upstream("text/event-stream"), &journal)
            .response_filter(labelled("record", "x"))
            .flush_interval_ms(200)
            .build()
            .unwrap();

        let frames = data_frames(proxy.serve(get("/"), client()).await).await;
        assert_eq!(frames, vec!["data: a\n\n", "data: b\n\n", "data: c\n\n"]);
    }

    #[tokio::test]
    async fn test_header_hook_can_turn_response_into_event_stream() {
        let journal = Journal::default();
        let proxy = proxy(chunked_upstream("text/plain"), &journal)
            .response_filter(FilterConfig::new("as_events"))
            .flush_interval_ms(200)
            .build()
            .unwrap();

        let frames = data_frames(proxy.serve(get("/"), client()).await).await;
        assert_eq!(frames, vec!["data: a\n\n", "data: b\n\n", "data: c\n\n"]);
    }

    fn untyped_upstream() -> Arc<MockTransport> {
        MockTransport::new(|| {
            Response::builder()
                .body(reqwest::Body::from("data: tick\n\n"))
                .unwrap()
        })
    }

    #[tokio::test]
    async fn test_marked_stream_defaults_content_type() {
        let journal = Journal::default();

        let filtered = proxy(untyped_upstream(), &journal)
            .request_filter(FilterConfig::new("mark_stream"))
            .response_filter(labelled("record", "x"))
            .build()
            .unwrap();
        let response = filtered.serve(get("/"), client()).await;
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream; charset=utf-8");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "data: tick\n\n");

        let relayed = proxy(untyped_upstream(), &journal)
            .request_filter(FilterConfig::new("mark_stream"))
            .build()
            .unwrap();
        let response = relayed.serve(get("/"), client()).await;
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream; charset=utf-8");
    }

    #[tokio::test]
    async fn test_marked_stream_keeps_upstream_content_type() {
        let journal = Journal::default();
        let proxy = proxy(MockTransport::text("hi"), &journal)
            .request_filter(FilterConfig::new("mark_stream"))
            .response_filter(labelled("record", "x"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }

    #[tokio::test]
    async fn test_filter_releasing_body_at_eof() {
        let journal = Journal::default();
        let proxy = proxy(chunked_upstream("text/plain"), &journal)
            .response_filter(FilterConfig::new("batch"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let frames = data_frames(response).await;
        assert_eq!(frames, vec!["[data: a\n\ndata: b\n\ndata: c\n\n]"]);
    }

    /* ---------- response body failures ---------- */

    #[tokio::test]
    async fn test_chunk_hook_panic_answers_500() {
        let journal = Journal::default();
        let proxy = proxy(MockTransport::text("ok"), &journal)
            .response_filter(labelled("faulty", "chunk_panic"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("chunk hook exploded"));
    }

    #[tokio::test]
    async fn test_eof_hook_panic_answers_500() {
        let journal = Journal::default();
        let proxy = proxy(MockTransport::text("ok"), &journal)
            .response_filter(labelled("faulty", "eof_panic"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("eof hook exploded"));
    }

    #[tokio::test]
    async fn test_chunk_hook_error_reaches_error_handler() {
        let journal = Journal::default();
        let proxy = proxy(MockTransport::text("ok"), &journal)
            .response_filter(labelled("faulty", "chunk_error"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Bad Gateway");
        let detail = body["error"].as_str().unwrap();
        assert!(detail.contains("filter 'faulty'"));
        assert!(detail.contains("corrupt chunk"));
    }

    #[tokio::test]
    async fn test_committed_stream_aborts_body_on_panic() {
        let journal = Journal::default();
        let proxy = proxy(chunked_upstream("text/event-stream"), &journal)
            .response_filter(labelled("faulty", "chunk_panic"))
            .build()
            .unwrap();

        let response = proxy.serve(get("/"), client()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let err = response.into_body().collect().await.unwrap_err();
        assert!(matches!(err, ProxyError::Panic(ref m) if m.contains("chunk hook exploded")));
    }

    #[derive(Debug)]
    struct EmptyChunks;

    #[async_trait]
    impl Splitter for EmptyChunks {
        async fn next_chunk(&mut self, _source: &mut ChunkSource) -> io::Result<Option<Bytes>> {
            Ok(Some(Bytes::new()))
        }
    }

    #[tokio::test]
    async fn test_empty_chunk_is_a_pipeline_error() {
        let head = RequestHead {
            method: Method::GET,
            url: "/".parse().unwrap(),
            host: None,
            remote_addr: None,
        };
        let source: ChunkSource = Box::new(StreamReader::new(stream::iter(vec![Ok::<_, io::Error>(
            Bytes::from_static(b"data"),
        )])));
        let pipeline = ResponsePipeline {
            splitter: Box::new(EmptyChunks),
            source,
            filters: Vec::new(),
            exchange: ResponseExchange::new(StatusCode::OK, http::Version::HTTP_11, HeaderMap::new(), head),
            trailers: Default::default(),
            logger: Logger::root(Discard, o!()),
        };

        let guard = tokio_util::sync::CancellationToken::new().drop_guard();
        let mut rx = pipeline.spawn(None, guard);
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("pipeline must not spin on empty chunks");
        assert!(matches!(first, Some(Err(ProxyError::EmptyChunk))));
    }

    /* ---------- upgrades ---------- */

    fn switching(protocol: &'static str, upstream_io: Arc<Mutex<Option<tokio::io::DuplexStream>>>) -> Arc<MockTransport> {
        MockTransport::new(move || {
            let mut builder = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header("connection", "Upgrade")
                .header("upgrade", protocol);
            if let Some(io) = upstream_io.lock().unwrap().take() {
                builder = builder.extension(UpstreamUpgrade(PendingUpgrade::ready(Box::new(io))));
            }
            builder.body(reqwest::Body::from(Vec::new())).unwrap()
        })
    }

    fn upgrade_request(protocol: &str, io: tokio::io::DuplexStream) -> Request<reqwest::Body> {
        Request::builder()
            .uri("/ws")
            .header("connection", "Upgrade")
            .header("upgrade", protocol)
            .extension(ClientUpgrade(PendingUpgrade::ready(Box::new(io))))
            .body(reqwest::Body::from(Vec::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upgrade_splices_connections() {
        let journal = Journal::default();
        let (upstream_side, mut upstream) = tokio::io::duplex(1024);
        let (client_side, mut client) = tokio::io::duplex(1024);
        let transport = switching("websocket", Arc::new(Mutex::new(Some(upstream_side))));
        let proxy = proxy(transport.clone(), &journal).build().unwrap();

        let response = proxy.serve(upgrade_request("WebSocket", client_side), self::client()).await;
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()["upgrade"], "websocket");
        assert_eq!(transport.last().headers["upgrade"], "WebSocket");

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_upgrade_protocol_mismatch_is_rejected() {
        let journal = Journal::default();
        let (upstream_side, _upstream) = tokio::io::duplex(64);
        let (client_side, _client) = tokio::io::duplex(64);
        let transport = switching("h2c", Arc::new(Mutex::new(Some(upstream_side))));
        let proxy = proxy(transport, &journal).build().unwrap();

        let response = proxy.serve(upgrade_request("websocket", client_side), client()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("h2c"));
    }

    #[tokio::test]
    async fn test_upgrade_without_client_connection_fails() {
        let journal = Journal::default();
        let (upstream_side, _upstream) = tokio::io::duplex(64);
        let transport = switching("websocket", Arc::new(Mutex::new(Some(upstream_side))));
        let proxy = proxy(transport, &journal).build().unwrap();

        let request = Request::builder()
            .uri("/ws")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .body(reqwest::Body::from(Vec::new()))
            .unwrap();
        let response = proxy.serve(request, client()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
