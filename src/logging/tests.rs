// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use http::{HeaderMap, Method, Uri};
    use log::LevelFilter;
    use slog::{Discard, Logger, o};

    use crate::logging::config::LoggingConfig;
    use crate::logging::structured::{LogFormat, RequestInfo, with_request_context};
    use crate::logging::{init_with_config, is_structured_logging, log_error, root_logger};

    #[test]
    fn test_logging_config_defaults() {
        let config: LoggingConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.structured);
        assert_eq!(config.format, "terminal");
        assert_eq!(config.level, "info");
        assert_eq!(config.request_id_header(), Some("X-Request-Id"));
    }

    #[test]
    fn test_to_logger_config() {
        let mut config = LoggingConfig {
            format: "JSON".to_string(),
            level: "warn".to_string(),
            ..LoggingConfig::default()
        };
        config.static_fields.insert("service".to_string(), "edge".to_string());

        let logger_config = config.to_logger_config();
        assert_eq!(logger_config.format, LogFormat::Json);
        assert_eq!(logger_config.level, slog::Level::Warning);
        assert_eq!(
            logger_config.static_fields,
            vec![("service".to_string(), "edge".to_string())]
        );
        assert_eq!(config.level_filter(), LevelFilter::Warn);

        let unknown = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(unknown.to_logger_config().level, slog::Level::Info);
        assert_eq!(unknown.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn test_request_id_propagation_can_be_disabled() {
        let config = LoggingConfig {
            propagate_request_id: false,
            ..LoggingConfig::default()
        };
        assert_eq!(config.request_id_header(), None);
    }

    #[test]
    fn test_request_info_propagates_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "abc-123".parse().unwrap());
        headers.insert("user-agent", "curl/8".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let uri: Uri = "/v1/chat?x=1".parse().unwrap();

        let info = RequestInfo::from_parts(&Method::GET, &uri, &headers, Some(addr), Some("X-Request-Id"));
        assert_eq!(info.request_id, "abc-123");
        assert_eq!(info.path, "/v1/chat");
        assert_eq!(info.user_agent, "curl/8");
        assert_eq!(info.remote_addr, "127.0.0.1:4000");

        let generated = RequestInfo::from_parts(&Method::GET, &uri, &headers, None, None);
        assert_ne!(generated.request_id, "abc-123");
        assert_eq!(generated.request_id.len(), 36);
    }

    #[test]
    fn test_request_context_logger() {
        let logger = Logger::root(Discard, o!());
        let info = RequestInfo::new(
            "GET".to_string(),
            "/".to_string(),
            "127.0.0.1:1".to_string(),
            String::new(),
        );
        let child = with_request_context(&logger, &info);
        slog::info!(child, "request logged"; "status" => 200);
        assert!(info.elapsed_ms() < 60_000);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        init_with_config(LevelFilter::Info, &config);
        init_with_config(LevelFilter::Debug, &config);
        assert!(!is_structured_logging());

        let logger = root_logger();
        slog::debug!(logger, "routed to the log facade");
    }

    #[test]
    fn test_log_error_returns_error() {
        assert_eq!(log_error("ctx", "boom"), "boom");
    }
}
