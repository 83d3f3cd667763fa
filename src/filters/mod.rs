// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Built-in filters and the filter registry.
//!
//! Filters are **opt-in** – you must declare them in `proxy.request_filters`
//! or `proxy.response_filters` for them to execute.  A declaration names a
//! registered factory and carries its `config` object:
//!
//! | name         | stages            | purpose                                  |
//! |--------------|-------------------|------------------------------------------|
//! | `header`     | request, response | add or remove headers                    |
//! | `logging`    | request, response | log heads and body snippets              |
//! | `rate_limit` | request           | per-key token bucket, answers `429`      |
//! | `audit`      | request, response | build an audit record and hand it a sink |

mod audit;
mod header;
mod logging;
mod rate_limit;
pub mod registry;


pub use audit::{AuditConfig, AuditFilter, AuditRecord, AuditSink, LogAuditSink, SharedAuditSink};
pub use header::{HeaderFilter, HeaderFilterConfig};
pub use logging::{LoggingFilter, LoggingFilterConfig};
pub use rate_limit::{KeyedLimiters, RateLimitConfig, RateLimitFilter};
pub use registry::{FilterConfig, FilterConstructor, FilterRegistry, parse_config, register_filter};

use crate::core::Filter;
use crate::warn_fmt;

/// Install the built-in factories into `registry`.
pub(crate) fn register_builtins(registry: &FilterRegistry) {
    let results = [
        registry.register("header", |cfg| {
            let config: HeaderFilterConfig = parse_config("header", cfg)?;
            Ok(Box::new(HeaderFilter::new(config)) as Box<dyn Filter>)
        }),
        registry.register("logging", |cfg| {
            let config: LoggingFilterConfig = parse_config("logging", cfg)?;
            Ok(Box::new(LoggingFilter::new(config)) as Box<dyn Filter>)
        }),
        registry.register("rate_limit", |cfg| {
            let config: RateLimitConfig = parse_config("rate_limit", cfg)?;
            Ok(Box::new(RateLimitFilter::new(config)?) as Box<dyn Filter>)
        }),
        registry.register("audit", |cfg| {
            let config: AuditConfig = parse_config("audit", cfg)?;
            Ok(Box::new(AuditFilter::new(config)) as Box<dyn Filter>)
        }),
    ];

    for result in results {
        if let Err(e) = result {
            warn_fmt!("FilterRegistry", "Built-in filter not installed: {}", e);
        }
    }
}
