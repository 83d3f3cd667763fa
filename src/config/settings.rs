// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed settings read from a layered [`Config`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Config, ConfigError};
use crate::filters::FilterConfig;
use crate::logging::config::LoggingConfig;
use crate::server::ServerConfig;
use crate::splitter::SplitterSettings;

/// The `proxy` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Upstream base URL
    pub target: String,

    /// Upstream request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Write coalescing interval; zero or negative writes every chunk immediately
    #[serde(default)]
    pub flush_interval_ms: i64,

    /// Size of pooled read buffers, defaults to the splitter window
    #[serde(default)]
    pub buffer_size: Option<usize>,

    /// Forward the inbound `Host` header instead of the target's
    #[serde(default)]
    pub preserve_host: bool,

    #[serde(default)]
    pub splitter: SplitterSettings,

    #[serde(default)]
    pub request_filters: Vec<FilterConfig>,

    #[serde(default)]
    pub response_filters: Vec<FilterConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_timeout_secs() -> u64 {
    30
}

impl ProxySettings {
    /// Settings for `target` with every other value at its default.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            timeout_secs: default_timeout_secs(),
            flush_interval_ms: 0,
            buffer_size: None,
            preserve_host: false,
            splitter: SplitterSettings::default(),
            request_filters: Vec::new(),
            response_filters: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.unwrap_or(self.splitter.size)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.trim().is_empty() {
            return Err(ConfigError::Invalid("proxy.target is empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "proxy.timeout_secs must be positive".to_string(),
            ));
        }
        if self.splitter.size == 0 || self.splitter.max_record == 0 {
            return Err(ConfigError::Invalid(
                "proxy.splitter sizes must be positive".to_string(),
            ));
        }
        if self.buffer_size == Some(0) {
            return Err(ConfigError::Invalid(
                "proxy.buffer_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to start a proxy.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub proxy: ProxySettings,
}

impl Settings {
    /// Read and validate the `server` and `proxy` sections.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let server = config.get_or_default("server", ServerConfig::default())?;

        if config.get::<serde_json::Value>("proxy.target")?.is_none() {
            return Err(ConfigError::NotFound("proxy.target".to_string()));
        }
        let proxy: ProxySettings = config.get_required("proxy")?;
        proxy.validate()?;

        Ok(Self { server, proxy })
    }
}
