// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;

use async_trait::async_trait;
use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::core::{
    Exchange, Filter, FilterContext, ProxyError, RequestExchange, RequestFilter, ResponseExchange,
    ResponseFilter, ResponseWriter, Signal,
};

/// Configuration for a header modification filter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeaderFilterConfig {
    /// Headers to add or replace in the request
    #[serde(default)]
    pub add_request_headers: HashMap<String, String>,

    /// Headers to remove from the request
    #[serde(default)]
    pub remove_request_headers: Vec<String>,

    /// Headers to add or replace in the response
    #[serde(default)]
    pub add_response_headers: HashMap<String, String>,

    /// Headers to remove from the response
    #[serde(default)]
    pub remove_response_headers: Vec<String>,
}

/// A filter that modifies HTTP headers.  Works in either stage; the request
/// half of the configuration applies in the request stage and the response
/// half in the response stage.
#[derive(Debug, Default)]
pub struct HeaderFilter {
    config: HeaderFilterConfig,
}

impl HeaderFilter {
    /// Create a new header filter with the given configuration.
    pub fn new(config: HeaderFilterConfig) -> Self {
        Self { config }
    }

    /// Apply header modifications to the given header map.
    fn apply_headers(headers: &mut HeaderMap, add: &HashMap<String, String>, remove: &[String]) {
        for name in remove {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.remove(&name);
            }
        }

        for (name, value) in add {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
    }
}

impl Filter for HeaderFilter {
    fn name(&self) -> &str {
        "header"
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }

    fn as_response_filter(&mut self) -> Option<&mut dyn ResponseFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for HeaderFilter {
    async fn on_request(
        &mut self,
        _ctx: &FilterContext,
        _writer: &mut ResponseWriter,
        exchange: &mut RequestExchange,
    ) -> Result<Signal, ProxyError> {
        Self::apply_headers(
            exchange.headers_mut(),
            &self.config.add_request_headers,
            &self.config.remove_request_headers,
        );
        Ok(Signal::Continue)
    }
}

#[async_trait]
impl ResponseFilter for HeaderFilter {
    async fn on_response_headers(
        &mut self,
        _ctx: &FilterContext,
        exchange: &mut ResponseExchange,
    ) -> Result<(), ProxyError> {
        Self::apply_headers(
            exchange.headers_mut(),
            &self.config.add_response_headers,
            &self.config.remove_response_headers,
        );
        Ok(())
    }
}
