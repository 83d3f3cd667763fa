// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP server in front of the [`ReverseProxy`].
//!
//! The server is a *thin* wrapper around **hyper-util**.  It owns the
//! listening socket and translates between hyper's body types and the
//! `reqwest` bodies the engine works with.
//!
//! **Protocol support**
//! Uses `hyper_util::server::conn::auto::Builder`, so the same connection
//! transparently handles both HTTP/1.1 *and* HTTP/2.  HTTP/1.1 connections
//! may be upgraded; the raw connection is handed to the engine, which splices
//! it to the upstream once the upstream agrees to switch.
//!
//! ## Body streaming
//! Inbound bodies are **streamed** straight into the upstream connection.


use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body as _, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::{ProxyBody, ProxyError};
use crate::proxy::headers::upgrade_type;
use crate::proxy::{BoxedIo, ClientUpgrade, PendingUpgrade, ReverseProxy};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Configuration for the HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long open connections may drain after a shutdown signal
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> Result<SocketAddr, ProxyError> {
        format!("{}:{}", self.host, self.port)
            .parse::<SocketAddr>()
            .map_err(|e| ProxyError::ConfigError(format!("Invalid server address: {e}")))
    }
}

/// HTTP server for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    /// Server configuration
    config: ServerConfig,
    /// The engine every request is handed to
    proxy: Arc<ReverseProxy>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, proxy: Arc<ReverseProxy>) -> Self {
        Self { config, proxy }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn proxy(&self) -> &Arc<ReverseProxy> {
        &self.proxy
    }

    /// Bind the configured address and serve until Ctrl-C or SIGTERM.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let addr = self.config.address()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Other(format!("Failed to bind: {e}")))?;

        info!("chainproxy listening on http://{}", addr);

        // On Unix, install the SIGTERM stream once and store it in a variable
        #[cfg(unix)]
        let mut term_stream = signal(SignalKind::terminate())
            .map_err(|e| ProxyError::Other(format!("Cannot install SIGTERM handler: {e}")))?;

        let shutdown = async move {
            #[cfg(unix)]
            let sigterm = term_stream.recv();
            #[cfg(not(unix))]
            let sigterm = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = signal::ctrl_c() => info!("Received Ctrl-C; initiating graceful shutdown"),
                _ = sigterm => info!("Received SIGTERM; initiating graceful shutdown"),
            }
        };

        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// drain open connections.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        // Cancelled to ask every connection to close gracefully
        let closing = CancellationToken::new();
        let mut join_set = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, remote_addr)) => {
                            let proxy = self.proxy.clone();
                            let closing = closing.clone();
                            join_set.spawn(serve_connection(stream, remote_addr, proxy, closing));
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                // Reap finished connection tasks so the set does not grow
                Some(_) = join_set.join_next(), if !join_set.is_empty() => {}
            }
        }

        info!("Shutting down; waiting for {} connection(s)", join_set.len());
        closing.cancel();

        let shutdown_timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let start_time = tokio::time::Instant::now();

        let drain = async {
            let mut completed = 0;
            let total = join_set.len();

            while let Some(res) = join_set.join_next().await {
                completed += 1;
                match res {
                    Ok(_) => debug!("Connection task completed ({}/{})", completed, total),
                    Err(e) if e.is_cancelled() => debug!("Connection task cancelled ({}/{})", completed, total),
                    Err(e) => error!("Connection task failed ({}/{}): {}", completed, total, e),
                }
            }
        };

        match tokio::time::timeout(shutdown_timeout, drain).await {
            Ok(_) => info!(
                "All connections drained gracefully in {:.1}s",
                start_time.elapsed().as_secs_f32()
            ),
            Err(_) => {
                warn!(
                    "Shutdown timed out after {} seconds, some connections may be forcefully closed",
                    shutdown_timeout.as_secs()
                );
                join_set.shutdown().await;
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    remote_addr: SocketAddr,
    proxy: Arc<ReverseProxy>,
    closing: CancellationToken,
) {
    let service = service_fn(move |req: Request<Incoming>| {
        let proxy = proxy.clone();
        async move { Ok::<_, Infallible>(handle_request(req, proxy, remote_addr).await) }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    let mut conn = std::pin::pin!(connection);

    tokio::select! {
        res = &mut conn => log_connection_end(res.err()),
        _ = closing.cancelled() => {
            debug!("Connection received shutdown signal, waiting for graceful close");
            conn.as_mut().graceful_shutdown();
            log_connection_end(conn.await.err());
        }
    }
}

fn log_connection_end(err: Option<Box<dyn std::error::Error + Send + Sync>>) {
    match err {
        None => debug!("Connection closed normally"),
        Some(e) => {
            let err_str = e.to_string();
            if !err_str.contains("connection closed") && !err_str.contains("connection reset") {
                error!("Connection error: {}", e);
            }
        }
    }
}

/// Convert hyper's inbound body for the engine.
fn into_proxy_body(body: Incoming) -> reqwest::Body {
    if body.is_end_stream() {
        return reqwest::Body::from(Bytes::new());
    }
    reqwest::Body::wrap_stream(body.into_data_stream())
}

/// Handle an incoming HTTP request.
async fn handle_request(
    mut req: Request<Incoming>,
    proxy: Arc<ReverseProxy>,
    remote_addr: SocketAddr,
) -> Response<ProxyBody> {
    trace!("Incoming {} {} over {:?}", req.method(), req.uri(), req.version());

    if upgrade_type(req.headers()).is_some() {
        let on_upgrade = hyper::upgrade::on(&mut req);
        let pending = PendingUpgrade::new(async move {
            let upgraded = on_upgrade.await.map_err(io::Error::other)?;
            Ok(Box::new(TokioIo::new(upgraded)) as BoxedIo)
        });
        req.extensions_mut().insert(ClientUpgrade(pending));
    }

    proxy.serve(req.map(into_proxy_body), Some(remote_addr)).await
}
