// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upstream round trips.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use tokio::time::timeout;

use super::upgrade::{BoxedIo, PendingUpgrade, UpstreamUpgrade};
use crate::core::ProxyError;

/// Performs one request against the upstream.
///
/// Implementations must not follow redirects or decode bodies; the response
/// is relayed as the upstream sent it.  A `101` response carries an
/// [`UpstreamUpgrade`] in its extensions.
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    async fn round_trip(
        &self,
        request: Request<reqwest::Body>,
    ) -> Result<Response<reqwest::Body>, ProxyError>;
}

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Create a transport whose requests time out after `timeout` waiting
    /// for the response head.
    pub fn new(timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(ProxyError::ClientError)?;
        Ok(Self { client, timeout })
    }

    /// Use a preconfigured client.
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn round_trip(
        &self,
        request: Request<reqwest::Body>,
    ) -> Result<Response<reqwest::Body>, ProxyError> {
        let request = reqwest::Request::try_from(request).map_err(ProxyError::ClientError)?;

        let upstream = timeout(self.timeout, self.client.execute(request))
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))?
            .map_err(|e| ProxyError::TransportError(e.to_string()))?;

        let mut builder = Response::builder()
            .status(upstream.status())
            .version(upstream.version());
        if let Some(headers) = builder.headers_mut() {
            *headers = upstream.headers().clone();
        }

        let response = if upstream.status() == StatusCode::SWITCHING_PROTOCOLS {
            let pending = PendingUpgrade::new(async move {
                let io = upstream.upgrade().await.map_err(std::io::Error::other)?;
                Ok(Box::new(io) as BoxedIo)
            });
            builder
                .extension(UpstreamUpgrade(pending))
                .body(reqwest::Body::from(Vec::new()))
        } else {
            builder.body(reqwest::Body::from(upstream))
        };

        response.map_err(|e| ProxyError::Other(format!("failed to assemble upstream response: {e}")))
    }
}
