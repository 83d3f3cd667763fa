// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests: a real upstream, the loader and the server.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use chainproxy::codec::{Encoding, compress};
use chainproxy::{Filter, FilterContext, ProxyError, ResponseExchange, ResponseFilter};
use serde_json::json;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Prefixes every line with its number.
#[derive(Debug, Default)]
struct NumberLines {
    seen: usize,
}

impl Filter for NumberLines {
    fn name(&self) -> &str {
        "number_lines"
    }

    fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
        Some(self)
    }
}

#[async_trait]
impl ResponseFilter for NumberLines {
    async fn on_response_chunk(
        &mut self,
        _ctx: &FilterContext,
        _exchange: &mut ResponseExchange,
        chunk: Bytes,
    ) -> Result<Bytes, ProxyError> {
        self.seen += 1;
        Ok(Bytes::from(format!("{}: {}", self.seen, String::from_utf8_lossy(&chunk))))
    }
}

#[tokio::test]
async fn test_request_is_rewritten_and_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/orders"))
        .and(query_param("page", "3"))
        .and(header("x-gateway", "chainproxy"))
        .and(body_string("{\"id\":7}"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("server", "upstream")
                .set_body_string("stored"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = common::serve(common::loader(json!({
        "proxy": {
            "target": format!("{}/api/v2", upstream.uri()),
            "request_filters": [
                {"name": "header", "config": {"add_request_headers": {"x-gateway": "chainproxy"}}}
            ],
            "response_filters": [
                {"name": "header", "config": {"remove_response_headers": ["server"]}}
            ]
        }
    })))
    .await;

    let response = reqwest::Client::new()
        .post(proxy.url("/orders?page=3"))
        .body("{\"id\":7}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    assert!(response.headers().get("server").is_none());
    assert_eq!(response.text().await.unwrap(), "stored");

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_request_id_is_propagated() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-request-id", "abc-123"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = common::serve(common::loader(json!({
        "proxy": {"target": upstream.uri()}
    })))
    .await;

    let response = reqwest::Client::new()
        .get(proxy.url("/ping"))
        .header("x-request-id", "abc-123")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 204);

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_line_splitting_response_filter() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/log"))
        .respond_with(ResponseTemplate::new(200).set_body_string("alpha\nbeta\ngamma\n"))
        .mount(&upstream)
        .await;

    let proxy = common::serve(
        common::loader(json!({
            "proxy": {
                "target": upstream.uri(),
                "splitter": {"kind": "line"},
                "response_filters": [{"name": "number_lines"}]
            }
        }))
        .with_filter("number_lines", |_| Ok(Box::new(NumberLines::default()) as Box<dyn Filter>)),
    )
    .await;

    let response = reqwest::get(proxy.url("/log")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers().get("content-length").is_none());
    assert_eq!(
        response.text().await.unwrap(),
        "1: alpha\n2: beta\n3: gamma\n"
    );

    // Filters are built per request, so numbering starts over.
    let again = reqwest::get(proxy.url("/log")).await.unwrap();
    assert!(again.text().await.unwrap().starts_with("1: alpha\n"));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_compressed_response_is_decoded_for_filters() {
    let upstream = MockServer::start().await;
    let body = compress(Encoding::Gzip, b"one\ntwo\n").unwrap();
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "gzip")
                .set_body_raw(body, "text/plain"),
        )
        .mount(&upstream)
        .await;

    let proxy = common::serve(
        common::loader(json!({
            "proxy": {
                "target": upstream.uri(),
                "splitter": {"kind": "line", "decompress": true},
                "response_filters": [{"name": "number_lines"}]
            }
        }))
        .with_filter("number_lines", |_| Ok(Box::new(NumberLines::default()) as Box<dyn Filter>)),
    )
    .await;

    let response = reqwest::get(proxy.url("/")).await.unwrap();
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(response.text().await.unwrap(), "1: one\n2: two\n");

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_pass_through_keeps_content_length() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("0123456789"))
        .mount(&upstream)
        .await;

    let proxy = common::serve(common::loader(json!({
        "proxy": {"target": upstream.uri()}
    })))
    .await;

    let response = reqwest::get(proxy.url("/")).await.unwrap();
    assert_eq!(response.headers()["content-length"], "10");
    assert_eq!(response.text().await.unwrap(), "0123456789");

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_intercepts_before_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = common::serve(common::loader(json!({
        "proxy": {
            "target": upstream.uri(),
            "request_filters": [
                {"name": "rate_limit", "config": {"rate": 0.01, "burst": 1, "scope": "e2e-intercept"}}
            ]
        }
    })))
    .await;

    let client = reqwest::Client::new();
    let first = client.get(proxy.url("/")).send().await.unwrap();
    assert_eq!(first.status().as_u16(), 200);

    let second = client.get(proxy.url("/")).send().await.unwrap();
    assert_eq!(second.status().as_u16(), 429);
    assert!(second.headers().contains_key("retry-after"));

    proxy.shutdown().await;
}
