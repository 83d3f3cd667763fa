// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! chainproxy - a streaming HTTP reverse proxy driven by an ordered filter chain
//!
//! Every inbound request runs through a list of *request filters* that may
//! rewrite it or answer it directly.  It is then forwarded to a single
//! upstream and the response body is cut into chunks by a configurable
//! splitter and pushed through a list of *response filters* while it streams
//! back to the client.
//!
//! # Core Principles
//!
//! - **Streaming**: response bodies are never buffered unless a filter asks for it
//! - **Per-request filters**: each exchange gets fresh filter instances built
//!   from a registry, so filters may keep state without locking
//! - **Configuration**: chains, splitting and flushing are driven by layered
//!   configuration (files and environment variables)
//!
//! # Custom Filters
//!
//! A filter implements [`Filter`] and exposes the stages it supports:
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use chainproxy::{
//!     ChainProxy, Exchange, Filter, FilterContext, ProxyError, RequestExchange, RequestFilter,
//!     ResponseWriter, Signal,
//! };
//!
//! #[derive(Debug)]
//! struct Tag;
//!
//! impl Filter for Tag {
//!     fn name(&self) -> &str {
//!         "tag"
//!     }
//!
//!     fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
//!         Some(self)
//!     }
//! }
//!
//! #[async_trait]
//! impl RequestFilter for Tag {
//!     async fn on_request(
//!         &mut self,
//!         _ctx: &FilterContext,
//!         _writer: &mut ResponseWriter,
//!         exchange: &mut RequestExchange,
//!     ) -> Result<Signal, ProxyError> {
//!         exchange.headers_mut().insert("x-tagged", "1".parse().unwrap());
//!         Ok(Signal::Continue)
//!     }
//! }
//!
//! # async fn run() -> Result<(), chainproxy::LoaderError> {
//! let proxy = ChainProxy::loader()
//!     .with_config_file("chainproxy.yaml")
//!     .with_env_vars()
//!     .with_filter("tag", |_config| Ok(Box::new(Tag)))
//!     .build()?;
//! proxy.start().await
//! # }
//! ```

#[macro_use]
pub mod logging;

pub mod codec;
pub mod config;
pub mod core;
pub mod filters;
pub mod loader;
pub mod pool;
pub mod proxy;
pub mod server;
pub mod splitter;

pub use crate::config::{Config, ConfigError, ConfigProvider, ConfigProviderExt};
pub use crate::core::{
    Exchange, Filter, FilterContext, ProxyBody, ProxyError, RequestContext, RequestExchange,
    RequestFilter, ResponseExchange, ResponseFilter, ResponseWriter, Signal, Stage,
};
pub use crate::filters::{FilterConfig, FilterRegistry, register_filter};
pub use crate::loader::{ChainProxy, LoaderError, ProxyLoader};
pub use crate::proxy::{Director, ErrorHandler, ReverseProxy, SingleHostDirector, Transport};
pub use crate::server::{ProxyServer, ServerConfig};
pub use crate::splitter::{SplitterKind, SplitterSettings};
