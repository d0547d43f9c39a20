//! Configuration for the OCPP bridge
//!
//! Covers the charge point endpoint, the HTTP command API and the backend
//! (transaction API plus Redis lists).

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::backend::channel::{DEFAULT_COMMANDS_KEY, DEFAULT_EVENTS_KEY, DEFAULT_POLL_TIMEOUT};
use crate::backend::publisher::DEFAULT_PUBLISH_TIMEOUT;
use crate::backend::transaction::DEFAULT_LOOKUP_TIMEOUT;
use crate::bridge::normalizer::DEFAULT_HEARTBEAT_INTERVAL;
use crate::ocpp::CentralSystemConfig;

pub const DEFAULT_LISTEN_ADDR: &str = ":10800";
pub const DEFAULT_COMMAND_ADDR: &str = ":10801";
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";

/// Configuration errors, reported at startup
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("BASE_URL is required")]
    MissingBaseUrl,

    #[error("Invalid base url: {0}")]
    InvalidBaseUrl(String),

    #[error("Invalid listen address: {0}")]
    InvalidAddr(String),

    #[error("Invalid setting {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Complete bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Backend HTTP API root, e.g. `http://backend:8000`
    pub base_url: String,

    /// Charge point WebSocket endpoint
    pub listen_addr: SocketAddr,

    /// HTTP command API
    pub command_addr: SocketAddr,

    pub redis_url: String,
    pub events_key: String,
    pub commands_key: String,

    /// Bound on waiting for a charge point reply
    pub request_timeout: Duration,

    /// Bound on one transaction lookup
    pub lookup_timeout: Duration,

    /// Bound on appending one event
    pub publish_timeout: Duration,

    /// How long one command queue poll blocks
    pub poll_timeout: Duration,

    /// Heartbeat interval handed to charge points at boot, in seconds
    pub heartbeat_interval: i32,

    pub max_message_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 10800)),
            command_addr: SocketAddr::from(([0, 0, 0, 0], 10801)),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            events_key: DEFAULT_EVENTS_KEY.to_string(),
            commands_key: DEFAULT_COMMANDS_KEY.to_string(),
            request_timeout: Duration::from_secs(30),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_message_size: 64 * 1024,
        }
    }
}

impl BridgeConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_command_addr(mut self, addr: SocketAddr) -> Self {
        self.command_addr = addr;
        self
    }

    /// Set the Redis address; bare `host:port` is accepted
    pub fn with_redis(mut self, addr: &str) -> Self {
        self.redis_url = normalize_redis_url(addr);
        self
    }

    pub fn with_keys(mut self, events: impl Into<String>, commands: impl Into<String>) -> Self {
        self.events_key = events.into();
        self.commands_key = commands.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, seconds: i32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    /// Check the settings that cannot be defaulted
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::MissingBaseUrl);
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(self.base_url.clone()));
        }
        if self.heartbeat_interval <= 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval",
                self.heartbeat_interval.to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("request_timeout", "0".to_string()));
        }
        if self.publish_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("publish_timeout", "0".to_string()));
        }
        if self.events_key.is_empty() || self.commands_key.is_empty() {
            return Err(ConfigError::InvalidValue("keys", "empty list key".to_string()));
        }
        Ok(())
    }

    /// Settings of the charge point endpoint
    pub fn central_system(&self) -> CentralSystemConfig {
        CentralSystemConfig {
            listen_addr: self.listen_addr,
            request_timeout: self.request_timeout,
            max_message_size: self.max_message_size,
        }
    }
}

/// Parse a listen address; `:port` binds every interface
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    let addr = addr.trim();
    let full = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    };
    full.parse()
        .map_err(|_| ConfigError::InvalidAddr(addr.to_string()))
}

/// Turn a bare `host:port` into a `redis://` url
pub fn normalize_redis_url(addr: &str) -> String {
    let addr = addr.trim();
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{}/0", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.listen_addr.port(), 10800);
        assert_eq!(config.command_addr.port(), 10801);
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.events_key, "events");
        assert_eq!(config.commands_key, "commands");
        assert_eq!(config.heartbeat_interval, 60);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.validate(), Err(ConfigError::MissingBaseUrl));
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfig::new("http://backend:8000")
            .with_listen_addr(parse_listen_addr(":9000").unwrap())
            .with_redis("cache:6380")
            .with_keys("ev", "cmd")
            .with_heartbeat_interval(120);

        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.redis_url, "redis://cache:6380/0");
        assert_eq!(config.events_key, "ev");
        assert_eq!(config.central_system().listen_addr.port(), 9000);
    }

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(parse_listen_addr(":10800").unwrap().port(), 10800);
        assert_eq!(
            parse_listen_addr("127.0.0.1:8080").unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert!(matches!(parse_listen_addr("nope"), Err(ConfigError::InvalidAddr(_))));
        assert!(parse_listen_addr(":http").is_err());
    }

    #[test]
    fn test_redis_url_passthrough() {
        assert_eq!(normalize_redis_url("redis://r:1/2"), "redis://r:1/2");
        assert_eq!(normalize_redis_url("rediss://r:1"), "rediss://r:1");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(matches!(
            BridgeConfig::new("backend:8000").validate(),
            Err(ConfigError::InvalidBaseUrl(_))
        ));
        assert!(matches!(
            BridgeConfig::new("http://b").with_heartbeat_interval(0).validate(),
            Err(ConfigError::InvalidValue("heartbeat_interval", _))
        ));
    }
}
