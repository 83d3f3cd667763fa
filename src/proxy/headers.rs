// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hop-by-hop header hygiene (RFC 7230 §6.1) and request direction.

use std::fmt;
use std::net::IpAddr;

use http::header::{CONNECTION, HOST, HeaderName, HeaderValue, TE, TRAILER, UPGRADE};
use http::uri::{PathAndQuery, Uri};
use http::HeaderMap;

use crate::core::{Exchange, ProxyError, RequestExchange};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that apply to a single connection and are never forwarded.
pub const HOP_HEADERS: [HeaderName; 9] = [
    HeaderName::from_static("connection"),
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-authenticate"),
    HeaderName::from_static("proxy-authorization"),
    HeaderName::from_static("te"),
    HeaderName::from_static("trailer"),
    HeaderName::from_static("transfer-encoding"),
    HeaderName::from_static("upgrade"),
];

fn tokens<'a>(headers: &'a HeaderMap, name: &HeaderName) -> impl Iterator<Item = &'a str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Remove every header named inside `Connection`.
pub fn remove_connection_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = tokens(headers, &CONNECTION)
        .filter_map(|t| HeaderName::from_bytes(t.as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(&name);
    }
}

pub fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in &HOP_HEADERS {
        headers.remove(name);
    }
}

/// The protocol requested through `Connection: upgrade`, if any.
pub fn upgrade_type(headers: &HeaderMap) -> Option<String> {
    if !tokens(headers, &CONNECTION).any(|t| t.eq_ignore_ascii_case("upgrade")) {
        return None;
    }
    Some(
        headers
            .get(UPGRADE)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default(),
    )
}

/// Printable ASCII only, as required for protocol names.
pub fn is_printable(value: &str) -> bool {
    value.bytes().all(|b| (b' '..=b'~').contains(&b))
}

/// Make request headers fit for the upstream hop.
///
/// Returns the requested upgrade protocol so the caller can validate the
/// upstream's answer.
pub fn prepare_outbound(
    headers: &mut HeaderMap,
    client_ip: Option<IpAddr>,
) -> Result<Option<String>, ProxyError> {
    let upgrade = upgrade_type(headers);
    if let Some(proto) = &upgrade {
        if !is_printable(proto) {
            return Err(ProxyError::UpgradeError(format!(
                "client tried to switch to invalid protocol {proto:?}"
            )));
        }
    }

    let wants_trailers = tokens(headers, &TE).any(|t| t.eq_ignore_ascii_case("trailers"));

    remove_connection_headers(headers);
    remove_hop_headers(headers);

    if wants_trailers {
        headers.insert(TE, HeaderValue::from_static("trailers"));
    }

    if let Some(proto) = &upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Ok(value) = HeaderValue::from_str(proto) {
            headers.insert(UPGRADE, value);
        }
    }

    if let Some(ip) = client_ip {
        let prior: Vec<&str> = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let forwarded = if prior.is_empty() {
            ip.to_string()
        } else {
            format!("{}, {}", prior.join(", "), ip)
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    Ok(upgrade)
}

/// Make upstream response headers fit for the client hop.  Trailer names
/// the upstream announced are announced again.
pub fn prepare_inbound(headers: &mut HeaderMap) {
    let announced: Vec<String> = tokens(headers, &TRAILER).map(str::to_string).collect();

    remove_connection_headers(headers);
    remove_hop_headers(headers);

    if !announced.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&announced.join(", ")) {
            headers.insert(TRAILER, value);
        }
    }
}

/// Rewrites a request so it goes to the upstream.
pub trait Director: Send + Sync + fmt::Debug {
    fn direct(&self, exchange: &mut RequestExchange) -> Result<(), ProxyError>;
}

/// Sends every request to one upstream base URL.
///
/// The upstream path is the base path joined with the request path by a
/// single slash; query strings are concatenated with `&`.
#[derive(Debug, Clone)]
pub struct SingleHostDirector {
    target: Uri,
    preserve_host: bool,
}

impl SingleHostDirector {
    pub fn new(target: &str) -> Result<Self, ProxyError> {
        let target: Uri = target
            .parse()
            .map_err(|e| ProxyError::ConfigError(format!("invalid target URL {target:?}: {e}")))?;
        if target.scheme().is_none() || target.authority().is_none() {
            return Err(ProxyError::ConfigError(format!(
                "target URL {target} needs a scheme and a host"
            )));
        }
        Ok(Self {
            target,
            preserve_host: false,
        })
    }

    /// Forward the client's `Host` header instead of the target's.
    pub fn preserve_host(mut self, preserve: bool) -> Self {
        self.preserve_host = preserve;
        self
    }

    pub fn target(&self) -> &Uri {
        &self.target
    }
}

impl Director for SingleHostDirector {
    fn direct(&self, exchange: &mut RequestExchange) -> Result<(), ProxyError> {
        let path = single_joining_slash(self.target.path(), exchange.url().path());
        let query = match (self.target.query(), exchange.url().query()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{a}&{b}")),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
            _ => None,
        };
        let path_and_query = match query {
            Some(q) => format!("{path}?{q}"),
            None => path,
        };

        let mut parts = self.target.clone().into_parts();
        parts.path_and_query = Some(
            PathAndQuery::try_from(path_and_query.as_str())
                .map_err(|e| ProxyError::FilterError(format!("invalid upstream path: {e}")))?,
        );
        let url = Uri::from_parts(parts)
            .map_err(|e| ProxyError::FilterError(format!("invalid upstream URL: {e}")))?;
        exchange.set_url(url);

        if !self.preserve_host {
            exchange.headers_mut().remove(HOST);
        }
        Ok(())
    }
}

pub fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}
