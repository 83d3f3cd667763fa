// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment variable-based configuration provider.
//!
//! `CHAINPROXY_PROXY__FLUSH_INTERVAL_MS=100` maps to the key
//! `proxy.flush_interval_ms`: the prefix is stripped, the rest is lowercased
//! and `__` separates nesting levels.  A single `_` stays part of the key.

use std::collections::BTreeMap;
use std::env;

use serde_json::{Map, Value};

use super::ConfigError;
use super::ConfigProvider;

/// Default prefix for environment variables.
pub const DEFAULT_PREFIX: &str = "CHAINPROXY_";

const SEPARATOR: &str = "__";

/// Configuration provider backed by environment variables.
#[derive(Debug)]
pub struct EnvConfigProvider {
    prefix: String,
    /// Matching variables keyed by their dotted configuration key.
    cache: BTreeMap<String, String>,
}

impl EnvConfigProvider {
    /// Create a provider for variables starting with `prefix`.
    pub fn new(prefix: &str) -> Self {
        let mut provider = Self {
            prefix: prefix.to_string(),
            cache: BTreeMap::new(),
        };
        provider.refresh_cache();
        provider
    }

    /// Re-read the process environment.
    pub fn refresh_cache(&mut self) {
        self.cache = env::vars()
            .filter_map(|(name, value)| {
                let rest = name.strip_prefix(&self.prefix)?;
                if rest.is_empty() {
                    return None;
                }
                let key = rest.to_lowercase().replace(SEPARATOR, ".");
                Some((key, value))
            })
            .collect();
    }

    fn parse_value(value: &str) -> Value {
        // JSON covers numbers, booleans, arrays and objects; anything else is a string
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
    }

    /// Assemble an object from every variable nested below `key`.
    fn collect_children(&self, key: &str) -> Option<Value> {
        let prefix = format!("{key}.");
        let mut root = Map::new();

        for (name, value) in self.cache.range(prefix.clone()..) {
            let Some(path) = name.strip_prefix(&prefix) else {
                break;
            };
            insert_path(&mut root, path, Self::parse_value(value));
        }

        (!root.is_empty()).then_some(Value::Object(root))
    }
}

fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, tail)) => {
            let entry = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, tail, value);
            }
        }
    }
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn has(&self, key: &str) -> bool {
        if self.cache.contains_key(key) {
            return true;
        }
        let prefix = format!("{key}.");
        self.cache
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(name, _)| name.starts_with(&prefix))
    }

    fn provider_name(&self) -> &str {
        "env"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        match self.cache.get(key) {
            Some(value) => Ok(Some(Self::parse_value(value))),
            None => Ok(self.collect_children(key)),
        }
    }
}
