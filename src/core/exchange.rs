// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Uniform view over the two sides of a proxied exchange.
//!
//! [`RequestExchange`] wraps the request on its way upstream and owns its
//! body.  [`ResponseExchange`] wraps the upstream response head; its body is
//! owned by the streaming pipeline, so the body accessors of the
//! [`Exchange`] trait are inert on that side.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, HeaderName, HeaderValue, TRAILER};
use http::{Extensions, HeaderMap, Method, Request, StatusCode, Uri, Version};
use http_body_util::BodyExt;

use super::ProxyError;

/// Read/write access shared by request and response exchanges.
#[async_trait]
pub trait Exchange: Send {
    fn method(&self) -> &Method;

    fn url(&self) -> &Uri;

    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Response status, `None` on the request side.
    fn status(&self) -> Option<StatusCode>;

    /// Declared body length, `-1` when unknown.
    fn content_length(&self) -> i64;

    fn remote_addr(&self) -> Option<SocketAddr>;

    fn host(&self) -> Option<&str>;

    /// Live request body.  Always `None` for responses.
    fn body(&mut self) -> Option<&mut reqwest::Body>;

    /// Buffered copy of the request body.
    ///
    /// Reads the body once, keeps the bytes and reinstalls a fresh body so
    /// later readers are unaffected.  Always `None` for responses.
    async fn body_buffer(&mut self) -> Result<Option<Bytes>, ProxyError>;

    /// Replace the body and its length.  The previous body is dropped.
    /// No-op for responses.
    fn set_body(&mut self, body: reqwest::Body, length: i64);
}

/// The outbound request as seen by request filters.
#[derive(Debug)]
pub struct RequestExchange {
    method: Method,
    url: Uri,
    version: Version,
    headers: HeaderMap,
    extensions: Extensions,
    body: Option<reqwest::Body>,
    buffered: Option<Bytes>,
    content_length: i64,
    remote_addr: Option<SocketAddr>,
}

impl RequestExchange {
    pub fn new(request: Request<reqwest::Body>, remote_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = request.into_parts();
        let content_length = declared_length(&parts.headers).unwrap_or_else(|| {
            hyper::body::Body::size_hint(&body)
                .exact()
                .map_or(-1, |n| n as i64)
        });
        let buffered = body.as_bytes().map(Bytes::copy_from_slice);

        Self {
            method: parts.method,
            url: parts.uri,
            version: parts.version,
            headers: parts.headers,
            extensions: parts.extensions,
            body: Some(body),
            buffered,
            content_length,
            remote_addr,
        }
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn set_url(&mut self, url: Uri) {
        self.url = url;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Snapshot of the request line for the response side.
    pub fn head(&self) -> RequestHead {
        RequestHead {
            method: self.method.clone(),
            url: self.url.clone(),
            host: self.host().map(str::to_string),
            remote_addr: self.remote_addr,
        }
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Reassemble the request for the transport.
    pub fn into_request(self) -> Request<reqwest::Body> {
        let body = self.body.unwrap_or_else(|| reqwest::Body::from(Bytes::new()));
        let mut request = Request::new(body);
        *request.method_mut() = self.method;
        *request.uri_mut() = self.url;
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers;
        *request.extensions_mut() = self.extensions;
        request
    }
}

#[async_trait]
impl Exchange for RequestExchange {
    fn method(&self) -> &Method {
        &self.method
    }

    fn url(&self) -> &Uri {
        &self.url
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn status(&self) -> Option<StatusCode> {
        None
    }

    fn content_length(&self) -> i64 {
        self.content_length
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn host(&self) -> Option<&str> {
        self.headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.url.authority().map(|a| a.as_str()))
    }

    fn body(&mut self) -> Option<&mut reqwest::Body> {
        self.body.as_mut()
    }

    async fn body_buffer(&mut self) -> Result<Option<Bytes>, ProxyError> {
        if let Some(bytes) = &self.buffered {
            return Ok(Some(bytes.clone()));
        }
        let Some(body) = self.body.take() else {
            return Ok(None);
        };

        let bytes = body.collect().await?.to_bytes();
        self.body = Some(reqwest::Body::from(bytes.clone()));
        self.buffered = Some(bytes.clone());
        Ok(Some(bytes))
    }

    fn set_body(&mut self, body: reqwest::Body, length: i64) {
        self.buffered = body.as_bytes().map(Bytes::copy_from_slice);
        // The replaced body is dropped here, which releases its stream.
        self.body = Some(body);
        self.content_length = length;

        if length >= 0 {
            self.headers.insert(CONTENT_LENGTH, HeaderValue::from(length as u64));
        } else {
            self.headers.remove(CONTENT_LENGTH);
        }
    }
}

/// Request line details kept once the request has gone upstream.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub url: Uri,
    pub host: Option<String>,
    pub remote_addr: Option<SocketAddr>,
}

/// The upstream response head as seen by response filters.
#[derive(Debug)]
pub struct ResponseExchange {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    trailers: HeaderMap,
    content_length: i64,
    origin: RequestHead,
}

impl ResponseExchange {
    pub fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        origin: RequestHead,
    ) -> Self {
        let content_length = declared_length(&headers).unwrap_or(-1);
        Self {
            status,
            version,
            headers,
            trailers: HeaderMap::new(),
            content_length,
            origin,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Trailer values sent after the last body chunk.
    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    pub fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    /// Announce a trailer in the `Trailer` header.  Only effective from the
    /// header hook, before the response head is committed.
    pub fn declare_trailer(&mut self, name: &HeaderName) {
        let declared = self
            .headers
            .get_all(TRAILER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|n| n.trim().eq_ignore_ascii_case(name.as_str()));
        if !declared {
            self.headers
                .append(TRAILER, HeaderValue::from_name(name.clone()));
        }
    }

    pub(crate) fn sync_content_length(&mut self) {
        self.content_length = declared_length(&self.headers).unwrap_or(-1);
    }

    pub(crate) fn take_trailers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.trailers)
    }
}

#[async_trait]
impl Exchange for ResponseExchange {
    fn method(&self) -> &Method {
        &self.origin.method
    }

    fn url(&self) -> &Uri {
        &self.origin.url
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn status(&self) -> Option<StatusCode> {
        Some(self.status)
    }

    fn content_length(&self) -> i64 {
        self.content_length
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.origin.remote_addr
    }

    fn host(&self) -> Option<&str> {
        self.origin.host.as_deref()
    }

    fn body(&mut self) -> Option<&mut reqwest::Body> {
        None
    }

    async fn body_buffer(&mut self) -> Result<Option<Bytes>, ProxyError> {
        Ok(None)
    }

    fn set_body(&mut self, _body: reqwest::Body, _length: i64) {}
}

fn declared_length(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
}
