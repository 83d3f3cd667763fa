// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! chainproxy configuration subsystem
//!
//! A running proxy is created from an ordered list of [`ConfigProvider`]s;
//! later providers override earlier ones.  Typical stacking order:
//!
//! 1. `FileConfigProvider` – `chainproxy.{toml,json,yaml}`
//! 2. `EnvConfigProvider`  – `CHAINPROXY_PROXY__TARGET=https://…`
//! 3. *your* provider implementing [`ConfigProvider`]
//!
//! Object values are merged across providers, so an override of a single
//! nested key keeps its siblings from earlier providers.  Any other value is
//! taken from the last provider that has it.
//!
//! | key | type | default | description |
//! |-----|------|---------|-------------|
//! | `server.host`                 | string  | `127.0.0.1` | Address to bind               |
//! | `server.port`                 | integer | `8080`      | Port to bind                  |
//! | `server.shutdown_timeout_secs`| integer | `30`        | Drain timeout on shutdown     |
//! | `proxy.target`                | string  | –           | Upstream base URL (required)  |
//! | `proxy.timeout_secs`          | integer | `30`        | Upstream request timeout      |
//! | `proxy.flush_interval_ms`     | integer | `0`         | Write coalescing, ≤0 disables |
//! | `proxy.buffer_size`           | integer | splitter size | Pooled buffer size          |
//! | `proxy.preserve_host`         | bool    | `false`     | Forward the inbound `Host`    |
//! | `proxy.splitter`              | object  | `auto`      | Chunk splitting strategy      |
//! | `proxy.request_filters`       | array   | `[]`        | Request filter declarations   |
//! | `proxy.response_filters`      | array   | `[]`        | Response filter declarations  |
//! | `proxy.logging`               | object  | plain, info | Logging setup                 |

mod env;
pub mod error;
mod file;
mod settings;


pub use env::{DEFAULT_PREFIX, EnvConfigProvider};
pub use error::ConfigError;
pub use file::{FileConfigProvider, FileFormat};
pub use settings::{ProxySettings, Settings};

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

/// Core configuration provider trait that all configuration sources must implement.
/// This trait is object-safe since it doesn't contain generic methods.
pub trait ConfigProvider: Debug + Send + Sync {
    /// Check if the configuration provider has a value for the given key.
    fn has(&self, key: &str) -> bool;

    /// Get the name of the configuration provider for debugging purposes.
    fn provider_name(&self) -> &str;

    /// Get a raw configuration value by key.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError>;
}

/// Typed access on top of [`ConfigProvider`].
pub trait ConfigProviderExt: ConfigProvider {
    /// Get a configuration value by key and deserialize it to the specified type.
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get_raw(key)?.map(|value| deserialize(key, value)).transpose()
    }
}

impl<T: ConfigProvider> ConfigProviderExt for T {}

fn deserialize<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, ConfigError> {
    serde_json::from_value(value)
        .map_err(|e| ConfigError::ParseError(format!("failed to deserialize '{key}': {e}")))
}

/// Merge `overlay` into `base`.  Objects merge key by key; anything else
/// replaces.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Builder for the configuration system.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration provider.  It takes precedence over those added before.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Add an already shared provider.
    pub fn with_shared_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Config {
        Config {
            providers: self.providers,
        }
    }
}

/// Layered view over every provider.
#[derive(Debug, Clone)]
pub struct Config {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Names of the providers, lowest precedence first.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.provider_name()).collect()
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        let mut merged: Option<Value> = None;

        for provider in &self.providers {
            if !provider.has(key) {
                continue;
            }
            let Some(value) = provider.get_raw(key)? else {
                continue;
            };
            match merged.as_mut() {
                Some(current) => merge(current, value),
                None => merged = Some(value),
            }
        }

        Ok(merged)
    }

    /// Get a configuration value by key.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get_raw(key)?.map(|value| deserialize(key, value)).transpose()
    }

    /// Get a configuration value by key with a default fallback value.
    pub fn get_or_default<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Get a configuration value that must be present.
    pub fn get_required<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.get(key)?
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
    }

    /// Create a configuration backed by a single file.
    pub fn default_file(file_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let provider = FileConfigProvider::new(file_path)?;
        Ok(Self::builder().with_provider(provider).build())
    }
}
