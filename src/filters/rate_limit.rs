// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-key request rate limiting.
//!
//! Limiters live in a process-wide map shared by every filter instance.  The
//! map lock is only held to find or lazily create a key's limiter; the
//! admission check itself runs on the limiter outside the lock.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use http::header::{AUTHORIZATION, HeaderValue, RETRY_AFTER};
use http::StatusCode;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::{
    Exchange, Filter, FilterContext, ProxyError, RequestExchange, RequestFilter, ResponseWriter,
    Signal,
};
use crate::{debug_fmt, warn_fmt};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

static SHARED: Lazy<KeyedLimiters> = Lazy::new(KeyedLimiters::new);
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Configuration for the rate limit filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained requests per second per key
    pub rate: f64,

    /// Requests admitted back to back before the rate applies
    pub burst: u32,

    /// Namespace separating limiters of differently configured routes
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Header used as the key when no bearer token is present
    #[serde(default)]
    pub key_header: Option<String>,

    /// Forget limiters idle for this long.  Unset keeps them forever.
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,
}

fn default_scope() -> String {
    "default".to_string()
}

impl RateLimitConfig {
    /// Build the governor quota: one cell every `1/rate` seconds with a
    /// bucket of `burst` cells.
    pub fn quota(&self) -> Result<Quota, ProxyError> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(ProxyError::ConfigError(format!(
                "rate limit 'rate' must be positive, got {}",
                self.rate
            )));
        }
        let burst = NonZeroU32::new(self.burst).ok_or_else(|| {
            ProxyError::ConfigError("rate limit 'burst' must be greater than 0".to_string())
        })?;
        let period = Duration::try_from_secs_f64(1.0 / self.rate).map_err(|e| {
            ProxyError::ConfigError(format!("rate limit 'rate' {} is too small: {e}", self.rate))
        })?;
        let quota = Quota::with_period(period).ok_or_else(|| {
            ProxyError::ConfigError(format!("rate limit period {period:?} is invalid"))
        })?;
        Ok(quota.allow_burst(burst))
    }
}

struct LimiterEntry {
    limiter: DirectLimiter,
    last_seen_ms: AtomicU64,
}

impl std::fmt::Debug for LimiterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterEntry")
            .field("last_seen_ms", &self.last_seen_ms)
            .finish()
    }
}

/// Lazily created limiters keyed by an opaque string.
#[derive(Debug, Default)]
pub struct KeyedLimiters {
    entries: Mutex<HashMap<String, Arc<LimiterEntry>>>,
}

impl KeyedLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// The map shared by every rate limit filter in the process.
    pub fn shared() -> &'static KeyedLimiters {
        &SHARED
    }

    /// Admit or reject one request for `key`.
    ///
    /// On rejection returns how long until the next request would be
    /// admitted.
    pub fn check(&self, key: &str, quota: Quota, idle_ttl: Option<Duration>) -> Result<(), Duration> {
        let entry = self.entry(key, quota, idle_ttl);
        entry.last_seen_ms.store(now_ms(), Ordering::Relaxed);

        entry.limiter.check().map_err(|not_until| {
            not_until.wait_time_from(DefaultClock::default().now())
        })
    }

    fn entry(&self, key: &str, quota: Quota, idle_ttl: Option<Duration>) -> Arc<LimiterEntry> {
        // A poisoned map only means another request panicked mid-insert; the
        // map itself is still consistent.
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(key) {
            return entry.clone();
        }

        if let Some(ttl) = idle_ttl {
            let cutoff = now_ms().saturating_sub(ttl.as_millis() as u64);
            let before = entries.len();
            entries.retain(|_, e| e.last_seen_ms.load(Ordering::Relaxed) >= cutoff);
            if entries.len() < before {
                debug_fmt!("RateLimit", "Evicted {} idle limiters", before - entries.len());
            }
        }

        let entry = Arc::new(LimiterEntry {
            limiter: RateLimiter::direct(quota),
            last_seen_ms: AtomicU64::new(now_ms()),
        });
        entries.insert(key.to_string(), entry.clone());
        entry
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rejects requests over a per-key rate with `429 Too Many Requests`.
///
/// The key is the bearer token from `Authorization`, else the configured
/// key header, else the client IP.
#[derive(Debug)]
pub struct RateLimitFilter {
    config: RateLimitConfig,
    quota: Quota,
    limiters: &'static KeyedLimiters,
}

impl RateLimitFilter {
    pub fn new(config: RateLimitConfig) -> Result<Self, ProxyError> {
        let quota = config.quota()?;
        Ok(Self {
            config,
            quota,
            limiters: KeyedLimiters::shared(),
        })
    }

    /// Use a dedicated limiter map instead of the process-wide one.
    pub fn with_limiters(mut self, limiters: &'static KeyedLimiters) -> Self {
        self.limiters = limiters;
        self
    }

    fn key(&self, ctx_ip: Option<String>, exchange: &RequestExchange) -> String {
        let headers = exchange.headers();
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty());
        if let Some(token) = bearer {
            return format!("token:{token}");
        }

        let from_header = self
            .config
            .key_header
            .as_deref()
            .and_then(|name| headers.get(name))
            .and_then(|v| v.to_str().ok());
        if let Some(value) = from_header {
            return format!("header:{value}");
        }

        let ip = ctx_ip.or_else(|| exchange.remote_addr().map(|a| a.ip().to_string()));
        format!("ip:{}", ip.unwrap_or_else(|| "unknown".to_string()))
    }
}

impl Filter for RateLimitFilter {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn as_request_filter(&mut self) -> Option<&mut dyn RequestFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for RateLimitFilter {
    async fn on_request(
        &mut self,
        ctx: &FilterContext,
        writer: &mut ResponseWriter,
        exchange: &mut RequestExchange,
    ) -> Result<Signal, ProxyError> {
        let client_ip = ctx.request().read().await.client_ip.clone();
        let key = format!("{}:{}", self.config.scope, self.key(client_ip, exchange));
        let ttl = self.config.idle_ttl_secs.map(Duration::from_secs);

        match self.limiters.check(&key, self.quota, ttl) {
            Ok(()) => Ok(Signal::Continue),
            Err(wait) => {
                warn_fmt!("RateLimit", "Rejected request over limit for scope {}", self.config.scope);
                writer.write_json(
                    StatusCode::TOO_MANY_REQUESTS,
                    &json!({
                        "success": false,
                        "message": "Too Many Requests",
                        "error": "rate limit exceeded",
                    }),
                )?;
                let seconds = wait.as_secs_f64().ceil().max(1.0) as u64;
                writer
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(seconds));
                Ok(Signal::Intercept)
            }
        }
    }
}
