// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level entry-point – "turn the key and go".
//!
//! The [`ProxyLoader`] consumes configuration, initializes logging, checks
//! the declared filter chains against the registry and returns a
//! [`ChainProxy`] whose server is ready to start.


use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use http::Extensions;
use log::LevelFilter;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError, ConfigProvider, EnvConfigProvider, FileConfigProvider, Settings};
use crate::core::{Filter, ProxyError};
use crate::filters::FilterRegistry;
use crate::logging::{self, init_with_config, log_error};
use crate::proxy::{ErrorHandler, ReqwestTransport, ReverseProxy, SingleHostDirector, Transport};
use crate::server::ProxyServer;
use crate::pool::BufferPool;

/// Errors that can occur while bootstrapping a proxy.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Proxy error
    #[error("proxy error: {0}")]
    ProxyError(#[from] ProxyError),
}

type PendingFilter = (
    String,
    Box<dyn Fn(Value) -> Result<Box<dyn Filter>, ProxyError> + Send + Sync>,
);

/// Builder for a [`ChainProxy`].
///
/// Configuration sources are layered in this order, each overriding the
/// previous: an explicit [`Config`], the config file, extra providers, then
/// environment variables.
#[derive(Default)]
pub struct ProxyLoader {
    config: Option<Config>,
    config_file_path: Option<PathBuf>,
    providers: Vec<Arc<dyn ConfigProvider>>,
    use_env_vars: bool,
    env_prefix: Option<String>,
    registry: Option<Arc<FilterRegistry>>,
    custom_filters: Vec<PendingFilter>,
    collaborators: Extensions,
    transport: Option<Arc<dyn Transport>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    shutdown: Option<CancellationToken>,
}

impl std::fmt::Debug for ProxyLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLoader")
            .field("config_file_path", &self.config_file_path)
            .field("providers", &self.providers)
            .field("use_env_vars", &self.use_env_vars)
            .field("env_prefix", &self.env_prefix)
            .field(
                "custom_filters",
                &self.custom_filters.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ProxyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already built configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Load a JSON, TOML or YAML configuration file.
    pub fn with_config_file(mut self, file_path: impl Into<PathBuf>) -> Self {
        self.config_file_path = Some(file_path.into());
        self
    }

    /// Read overrides from `CHAINPROXY_*` environment variables.
    pub fn with_env_vars(mut self) -> Self {
        self.use_env_vars = true;
        self
    }

    /// Read overrides from environment variables starting with `prefix`.
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.use_env_vars = true;
        self
    }

    /// Add a custom configuration provider.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Registry filters are looked up in.  Defaults to the global one.
    pub fn with_registry(mut self, registry: Arc<FilterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a filter constructor before the chains are validated.
    pub fn with_filter<F>(mut self, name: &str, ctor: F) -> Self
    where
        F: Fn(Value) -> Result<Box<dyn Filter>, ProxyError> + Send + Sync + 'static,
    {
        self.custom_filters.push((name.to_string(), Box::new(ctor)));
        self
    }

    /// Share a value with every filter instance.
    pub fn with_collaborator<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.collaborators.insert(value);
        self
    }

    /// Replace the reqwest transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Token whose cancellation aborts in-flight exchanges.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    fn layered_config(&mut self) -> Result<Config, ConfigError> {
        let mut builder = Config::builder();

        if let Some(config) = self.config.take() {
            builder = builder.with_provider(LayeredConfig(config));
        }
        if let Some(path) = self.config_file_path.take() {
            builder = builder.with_provider(FileConfigProvider::new(path)?);
        }
        for provider in self.providers.drain(..) {
            builder = builder.with_shared_provider(provider);
        }
        if self.use_env_vars {
            let env_provider = match self.env_prefix.as_deref() {
                Some(prefix) => EnvConfigProvider::new(prefix),
                None => EnvConfigProvider::default(),
            };
            builder = builder.with_provider(env_provider);
        }

        Ok(builder.build())
    }

    /// Build the proxy: configuration, then logging, then the filter chains,
    /// the engine and finally the server.
    pub fn build(mut self) -> Result<ChainProxy, LoaderError> {
        let config = self.layered_config()?;
        let settings = Settings::from_config(&config)?;

        let logging_config = &settings.proxy.logging;
        let level = match env::var("RUST_LOG_LEVEL").ok().as_deref() {
            Some("trace") => LevelFilter::Trace,
            Some("debug") => LevelFilter::Debug,
            Some("info") => LevelFilter::Info,
            Some("warn") => LevelFilter::Warn,
            Some("error") => LevelFilter::Error,
            _ => logging_config.level_filter(),
        };
        init_with_config(level, logging_config);

        info_fmt!("Startup", "chainproxy starting up for {}", settings.proxy.target);

        let registry = self.registry.unwrap_or_else(FilterRegistry::global);
        for (name, ctor) in self.custom_filters {
            registry
                .register(&name, move |config| ctor(config))
                .map_err(|e| log_error("Startup", e))?;
        }

        let director = SingleHostDirector::new(&settings.proxy.target)?
            .preserve_host(settings.proxy.preserve_host);
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(settings.proxy.timeout())?),
        };

        let mut builder = ReverseProxy::builder(director)
            .transport(transport)
            .registry(registry)
            .request_filters(settings.proxy.request_filters.clone())
            .response_filters(settings.proxy.response_filters.clone())
            .splitter(settings.proxy.splitter.clone())
            .flush_interval_ms(settings.proxy.flush_interval_ms)
            .buffer_pool(BufferPool::shared(settings.proxy.buffer_size()))
            .collaborators(self.collaborators)
            .logger(logging::root_logger())
            .request_id_header(logging_config.request_id_header().map(str::to_string));
        if let Some(handler) = self.error_handler {
            builder = builder.error_handler(handler);
        }
        if let Some(token) = self.shutdown {
            builder = builder.shutdown_token(token);
        }
        let proxy = builder.build().map_err(|e| log_error("Startup", e))?;

        debug_fmt!(
            "Startup",
            "{} request filter(s), {} response filter(s)",
            settings.proxy.request_filters.len(),
            settings.proxy.response_filters.len()
        );

        let server = ProxyServer::new(settings.server.clone(), Arc::new(proxy));

        Ok(ChainProxy {
            config: Arc::new(config),
            settings,
            server,
        })
    }
}

/// Exposes an explicit [`Config`] as the lowest layer.
#[derive(Debug)]
struct LayeredConfig(Config);

impl ConfigProvider for LayeredConfig {
    fn has(&self, key: &str) -> bool {
        matches!(self.0.get::<Value>(key), Ok(Some(_)))
    }

    fn provider_name(&self) -> &str {
        "config"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        self.0.get(key)
    }
}

/// An initialized proxy.
#[derive(Debug, Clone)]
pub struct ChainProxy {
    config: Arc<Config>,
    settings: Settings,
    server: ProxyServer,
}

impl ChainProxy {
    /// Create a new loader.
    pub fn loader() -> ProxyLoader {
        ProxyLoader::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn server(&self) -> &ProxyServer {
        &self.server
    }

    pub fn proxy(&self) -> &Arc<ReverseProxy> {
        self.server.proxy()
    }

    /// Serve until Ctrl-C or SIGTERM.
    pub async fn start(&self) -> Result<(), LoaderError> {
        self.server.start().await.map_err(LoaderError::ProxyError)
    }
}
