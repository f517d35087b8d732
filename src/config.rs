//! Coordinator Configuration
//!
//! One immutable settings object built at startup (defaults, then environment,
//! then CLI flags) and shared by reference with every component. Nothing
//! mutates it after [`CoordinatorConfig::validate`] succeeds.

use crate::backend::CoordinationError;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8500";

/// Session TTL bounds enforced by the coordination service.
pub const MIN_SESSION_TTL: Duration = Duration::from_secs(10);
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(86_400);

/// Longest wait a blocking query may request.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// `host:port` of the coordination agent.
    pub address: String,
    /// `http` or `https`.
    pub scheme: String,
    /// ACL token sent with every request.
    pub token: Option<String>,

    /// How long the server may hold a blocking query open.
    #[serde(with = "duration_str")]
    pub wait_time: Duration,
    /// Pause after a failed poll before retrying with the same index.
    #[serde(with = "duration_str")]
    pub error_backoff: Duration,
    /// Minimum spacing between two consecutive polls of one watcher.
    #[serde(with = "duration_str")]
    pub min_poll_interval: Duration,

    #[serde(with = "duration_str")]
    pub session_ttl: Duration,
    #[serde(with = "duration_str")]
    pub renew_interval: Duration,

    #[serde(with = "duration_str")]
    pub service_ttl: Duration,
    #[serde(with = "duration_str")]
    pub deregister_after: Duration,
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            scheme: "http".to_string(),
            token: None,
            wait_time: Duration::from_secs(300),
            error_backoff: Duration::from_secs(1),
            min_poll_interval: Duration::from_millis(200),
            session_ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(1),
            service_ttl: Duration::from_secs(5),
            deregister_after: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

impl CoordinatorConfig {
    /// Upper bound on a single renew or heartbeat request: it has to finish
    /// before the next tick of the faster keepalive loop.
    pub fn keepalive_timeout(&self) -> Duration {
        self.renew_interval.min(self.heartbeat_interval)
    }

    /// Defaults overridden by `CONSUL_HTTP_ADDR`, `CONSUL_HTTP_TOKEN` and `CONSUL_HTTP_SSL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("CONSUL_HTTP_ADDR") {
            config.set_address(&addr);
        }

        if let Ok(token) = std::env::var("CONSUL_HTTP_TOKEN")
            && !token.is_empty()
        {
            config.token = Some(token);
        }

        if let Ok(ssl) = std::env::var("CONSUL_HTTP_SSL")
            && matches!(ssl.as_str(), "1" | "true" | "TRUE")
        {
            config.scheme = "https".to_string();
        }

        config
    }

    /// Accepts either `host:port` or `scheme://host:port`.
    pub fn set_address(&mut self, addr: &str) {
        let addr = addr.trim().trim_end_matches('/');
        match addr.split_once("://") {
            Some((scheme, rest)) => {
                self.scheme = scheme.to_string();
                self.address = rest.to_string();
            }
            None => self.address = addr.to_string(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.address)
    }

    /// Checks the settings once at startup. Errors here are never retried.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.address.is_empty() || self.address.contains(char::is_whitespace) {
            return Err(CoordinationError::configuration(format!(
                "invalid agent address '{}'",
                self.address
            )));
        }

        if self.scheme != "http" && self.scheme != "https" {
            return Err(CoordinationError::configuration(format!(
                "unsupported scheme '{}'",
                self.scheme
            )));
        }

        let non_zero = [
            ("error_backoff", self.error_backoff),
            ("renew_interval", self.renew_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("service_ttl", self.service_ttl),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(CoordinationError::configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.wait_time > MAX_WAIT_TIME {
            return Err(CoordinationError::configuration(format!(
                "wait_time {:?} exceeds the maximum of {:?}",
                self.wait_time, MAX_WAIT_TIME
            )));
        }

        validate_session_ttl(self.session_ttl)?;
        validate_keepalive(self.session_ttl, self.renew_interval)?;
        validate_keepalive(self.service_ttl, self.heartbeat_interval)?;

        Ok(())
    }
}

pub fn validate_session_ttl(ttl: Duration) -> Result<(), CoordinationError> {
    if ttl < MIN_SESSION_TTL || ttl > MAX_SESSION_TTL {
        return Err(CoordinationError::configuration(format!(
            "session TTL {:?} must be between {:?} and {:?}",
            ttl, MIN_SESSION_TTL, MAX_SESSION_TTL
        )));
    }
    Ok(())
}

/// A keepalive interval must leave at least half the TTL as margin.
pub fn validate_keepalive(ttl: Duration, interval: Duration) -> Result<(), CoordinationError> {
    if interval.is_zero() || interval * 2 > ttl {
        return Err(CoordinationError::configuration(format!(
            "interval {:?} must be non-zero and at most half of TTL {:?}",
            interval, ttl
        )));
    }
    Ok(())
}

/// Durations as human readable strings ("10s", "1m", "200ms").
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_url(), "http://127.0.0.1:8500");
    }

    #[test]
    fn test_keepalive_timeout_follows_faster_loop() {
        let config = CoordinatorConfig {
            renew_interval: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(2),
            ..CoordinatorConfig::default()
        };

        assert_eq!(config.keepalive_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_set_address_with_scheme() {
        let mut config = CoordinatorConfig::default();
        config.set_address("https://consul.internal:8501/");

        assert_eq!(config.scheme, "https");
        assert_eq!(config.address, "consul.internal:8501");
        assert_eq!(config.base_url(), "https://consul.internal:8501");
    }

    #[test]
    fn test_renew_interval_must_be_shorter_than_ttl() {
        let config = CoordinatorConfig {
            renew_interval: Duration::from_secs(6),
            ..CoordinatorConfig::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("interval"));
    }

    #[test]
    fn test_session_ttl_bounds() {
        assert!(validate_session_ttl(Duration::from_secs(5)).is_err());
        assert!(validate_session_ttl(Duration::from_secs(10)).is_ok());
        assert!(validate_session_ttl(Duration::from_secs(90_000)).is_err());
    }

    #[test]
    fn test_invalid_address_rejected() {
        let config = CoordinatorConfig {
            address: "not an address".to_string(),
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_config_deserializes_human_durations() {
        let json = r#"{"address": "10.0.0.5:8500", "session_ttl": "30s", "renew_interval": "5s"}"#;
        let config: CoordinatorConfig = serde_json::from_str(json).expect("config should parse");

        assert_eq!(config.address, "10.0.0.5:8500");
        assert_eq!(config.session_ttl, Duration::from_secs(30));
        assert_eq!(config.renew_interval, Duration::from_secs(5));
        // untouched fields keep their defaults
        assert_eq!(config.min_poll_interval, Duration::from_millis(200));
        assert!(config.validate().is_ok());
    }
}
