// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Name-keyed filter factories.
//!
//! Filters are never configured as instances.  Configuration names a
//! factory, and the engine asks the registry for a fresh instance of every
//! declared filter on every request, so no state leaks between requests.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Filter, ProxyError};
use crate::{debug_fmt, error_fmt};

/// Constructor signature every filter factory implements.  The argument is
/// the `config` object from the filter's declaration.
pub type FilterConstructor =
    Arc<dyn Fn(Value) -> Result<Box<dyn Filter>, ProxyError> + Send + Sync>;

/// One declared filter in the request or response list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Registered factory name
    pub name: String,

    /// Factory-specific settings
    #[serde(default)]
    pub config: Value,
}

impl FilterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Value::Null,
        }
    }

    pub fn with_config(name: impl Into<String>, config: Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Process-wide registry, pre-populated with the built-in filters.
static GLOBAL: Lazy<Arc<FilterRegistry>> = Lazy::new(|| Arc::new(FilterRegistry::with_builtins()));

/// Registry of filter factories.
#[derive(Default)]
pub struct FilterRegistry {
    constructors: RwLock<HashMap<String, FilterConstructor>>,
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRegistry")
            .field("filters", &self.names())
            .finish()
    }
}

impl FilterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in filters.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        super::register_builtins(&registry);
        registry
    }

    /// The shared process-wide registry.
    pub fn global() -> Arc<FilterRegistry> {
        GLOBAL.clone()
    }

    /// Register a factory under a unique name.
    ///
    /// Registering a name twice is an error.
    pub fn register<F>(&self, name: &str, ctor: F) -> Result<(), ProxyError>
    where
        F: Fn(Value) -> Result<Box<dyn Filter>, ProxyError> + Send + Sync + 'static,
    {
        let mut constructors = self
            .constructors
            .write()
            .map_err(|_| ProxyError::Other("filter registry lock poisoned".to_string()))?;

        if constructors.contains_key(name) {
            let err = ProxyError::ConfigError(format!("filter '{name}' is already registered"));
            error_fmt!("FilterRegistry", "{}", err);
            return Err(err);
        }

        debug_fmt!("FilterRegistry", "Registered filter '{}'", name);
        constructors.insert(name.to_string(), Arc::new(ctor));
        Ok(())
    }

    /// Fetch a factory if one is registered under `name`.
    pub fn get(&self, name: &str) -> Option<FilterConstructor> {
        self.constructors.read().ok()?.get(name).cloned()
    }

    /// Fetch a factory that must exist.
    ///
    /// # Panics
    ///
    /// Panics when `name` is not registered.  Meant for startup wiring where
    /// a missing filter is a programming error.
    pub fn must_get(&self, name: &str) -> FilterConstructor {
        match self.get(name) {
            Some(ctor) => ctor,
            None => panic!("no filter registered under '{name}'"),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Build a fresh instance of the filter registered under `name`.
    pub fn create(&self, name: &str, config: Value) -> Result<Box<dyn Filter>, ProxyError> {
        let ctor = self.get(name).ok_or_else(|| {
            let err = ProxyError::ConfigError(format!("unknown filter '{name}'"));
            error_fmt!("FilterRegistry", "{}", err);
            err
        })?;
        ctor(config)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .constructors
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

/// Register a filter in the process-wide registry.
///
/// ```rust
/// use chainproxy::filters::register_filter;
/// use chainproxy::{Filter, ProxyError};
///
/// #[derive(Debug)]
/// struct Noop;
///
/// impl Filter for Noop {
///     fn name(&self) -> &str { "noop" }
/// }
///
/// register_filter("noop", |_cfg| Ok(Box::new(Noop))).unwrap();
/// ```
pub fn register_filter<F>(name: &str, ctor: F) -> Result<(), ProxyError>
where
    F: Fn(Value) -> Result<Box<dyn Filter>, ProxyError> + Send + Sync + 'static,
{
    FilterRegistry::global().register(name, ctor)
}

/// Decode a filter's `config` object, treating `null` as empty.
pub fn parse_config<T>(filter: &str, config: Value) -> Result<T, ProxyError>
where
    T: serde::de::DeserializeOwned,
{
    let config = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config
    };
    serde_json::from_value(config).map_err(|e| {
        let err = ProxyError::ConfigError(format!("invalid {filter} filter config: {e}"));
        error_fmt!("Filter", "{}", err);
        err
    })
}
