//! Server and connection configuration.
//!
//! Every field has a default, so a JSON document only needs to name what it
//! changes:
//!
//! ```
//! use httpconn::ServerConfig;
//!
//! let config = ServerConfig::from_json_str(r#"{
//!     "bind_addr": "0.0.0.0:9000",
//!     "connection": { "keep_alive_timeout_secs": 5 }
//! }"#).unwrap();
//!
//! assert_eq!(config.bind_addr, "0.0.0.0:9000");
//! assert_eq!(config.connection.keep_alive_timeout_secs, 5);
//! assert_eq!(config.connection.request_timeout_secs, 30);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest accepted inbound buffer. A request head must fit in it.
pub const MIN_BUFFER_SIZE: usize = 1024;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Per-connection timeouts and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Time allowed for the first request head to arrive.
    pub request_timeout_secs: u64,
    /// Time an idle kept-alive connection may wait for its next request head.
    pub keep_alive_timeout_secs: u64,
    /// Time allowed for the declared body to arrive.
    pub body_timeout_secs: u64,
    /// Time allowed to drain one whole response.
    pub write_timeout_secs: u64,
    /// Inbound buffer capacity; bounds head plus body of one request.
    pub buffer_size: usize,
    /// Requests served before the connection is closed; `0` means unlimited.
    pub max_requests_per_connection: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            keep_alive_timeout_secs: 10,
            body_timeout_secs: 120,
            write_timeout_secs: 60,
            buffer_size: 64 * 1024,
            max_requests_per_connection: 0,
        }
    }
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn body_timeout(&self) -> Duration {
        Duration::from_secs(self.body_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    #[must_use]
    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_keep_alive_timeout_secs(mut self, secs: u64) -> Self {
        self.keep_alive_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_body_timeout_secs(mut self, secs: u64) -> Self {
        self.body_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_write_timeout_secs(mut self, secs: u64) -> Self {
        self.write_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_max_requests_per_connection(mut self, max: usize) -> Self {
        self.max_requests_per_connection = max;
        self
    }

    /// Checks that every timeout is non-zero and the buffer can hold a head.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("request_timeout_secs", self.request_timeout_secs),
            ("keep_alive_timeout_secs", self.keep_alive_timeout_secs),
            ("body_timeout_secs", self.body_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
        ];
        for (field, secs) in timeouts {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "timeout must be at least one second",
                });
            }
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                reason: "buffer must hold at least 1024 bytes",
            });
        }
        Ok(())
    }
}

/// Listener-level settings plus the [`ConnectionConfig`] applied to every
/// accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Live connections allowed at once; `0` means unlimited.
    pub max_connections: usize,
    pub tcp_nodelay: bool,
    /// How long shutdown waits for stopped connections to finish tearing down.
    pub drain_timeout_secs: u64,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_owned(),
            max_connections: 0,
            tcp_nodelay: true,
            drain_timeout_secs: 5,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a default configuration bound to `bind_addr`.
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    #[must_use]
    pub fn with_drain_timeout_secs(mut self, secs: u64) -> Self {
        self.drain_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.is_empty() {
            return Err(ConfigError::Invalid {
                field: "bind_addr",
                reason: "address must not be empty",
            });
        }
        self.connection.validate()
    }
}
