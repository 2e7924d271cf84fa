//! Configuration module for Postbox.
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Both binaries read the same file; each uses the sections it needs.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! data_file = "storage/data.json"
//!
//! [publisher]
//! hub_addr = "${POSTBOX_HUB_ADDR}"
//! timeout_ms = 1000
//!
//! [hub]
//! event_addr = "127.0.0.1:6000"
//! port = 6001
//! ```

use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::publisher::{NoopPublisher, Publisher, TcpPublisher};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PostboxConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub hub: HubConfig,
}

/// Ingestion server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the JSON message document
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_file: default_data_file(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_data_file() -> PathBuf {
    PathBuf::from("storage/data.json")
}

/// Event publisher configuration (ingestion side)
#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Where the hub accepts events
    #[serde(default = "default_event_addr")]
    pub hub_addr: String,

    #[serde(default = "default_publish_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            hub_addr: default_event_addr(),
            timeout_ms: default_publish_timeout_ms(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_event_addr() -> String {
    crate::DEFAULT_EVENT_ADDR.to_string()
}

fn default_publish_timeout_ms() -> u64 {
    1000
}

/// Notification hub configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    /// Loopback address of the inbound event channel
    #[serde(default = "default_event_addr")]
    pub event_addr: String,

    /// Port for subscriber WebSocket connections
    #[serde(default = "default_hub_port")]
    pub port: u16,

    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Events queued per subscriber before it is considered stalled
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_addr: default_event_addr(),
            port: default_hub_port(),
            send_timeout_ms: default_send_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

fn default_hub_port() -> u16 {
    6001
}

fn default_send_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    2000
}

fn default_subscriber_buffer() -> usize {
    64
}

impl HubConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Parsed event channel address.
    pub fn event_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.event_addr.parse().map_err(|_| {
            ConfigError::ValidationError(format!(
                "hub.event_addr '{}' is not a socket address",
                self.event_addr
            ))
        })
    }
}

impl PostboxConfig {
    /// Build the event publisher for the ingestion service.
    pub fn build_publisher(&self) -> Arc<dyn Publisher> {
        if !self.publisher.enabled {
            info!("Event publishing disabled");
            return Arc::new(NoopPublisher);
        }

        info!(
            hub_addr = %self.publisher.hub_addr,
            timeout_ms = self.publisher.timeout_ms,
            "Publishing events to hub"
        );

        Arc::new(
            TcpPublisher::new(&self.publisher.hub_addr)
                .with_timeout(Duration::from_millis(self.publisher.timeout_ms)),
        )
    }

    /// Load configuration from the default path or POSTBOX_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("POSTBOX_CONFIG").unwrap_or_else(|_| "config/postbox.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: PostboxConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            port = config.server.port,
            data_file = %config.server.data_file.display(),
            hub_port = config.hub.port,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.data_file.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "server.data_file must not be empty".to_string(),
            ));
        }

        if self.publisher.enabled {
            if self.publisher.hub_addr.contains("${") {
                warn!(
                    hub_addr = %self.publisher.hub_addr,
                    "Publisher address contains unsubstituted environment variable"
                );
            }

            if self.publisher.hub_addr.is_empty() {
                return Err(ConfigError::ValidationError(
                    "publisher.hub_addr must not be empty".to_string(),
                ));
            }

            if self.publisher.timeout_ms == 0 {
                return Err(ConfigError::ValidationError(
                    "publisher.timeout_ms must be greater than zero".to_string(),
                ));
            }
        }

        self.hub.event_socket_addr()?;

        if self.hub.send_timeout_ms == 0 || self.hub.read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "hub timeouts must be greater than zero".to_string(),
            ));
        }

        if self.hub.subscriber_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "hub.subscriber_buffer must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") else {
        return content.to_string();
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("POSTBOX_TEST_VAR", "substituted_value");
        let input = "hub_addr = \"${POSTBOX_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "hub_addr = \"substituted_value\"");
        env::remove_var("POSTBOX_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "hub_addr = \"${POSTBOX_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "hub_addr = \"${POSTBOX_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            port = 4000
        "#;

        let config: PostboxConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.data_file, PathBuf::from("storage/data.json"));
        assert_eq!(config.publisher.hub_addr, "127.0.0.1:6000");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            port = 8080
            data_file = "/var/lib/postbox/messages.json"

            [publisher]
            enabled = false
            hub_addr = "10.0.0.5:7000"
            timeout_ms = 250

            [hub]
            event_addr = "127.0.0.1:7000"
            port = 7001
            send_timeout_ms = 100
            read_timeout_ms = 200
            subscriber_buffer = 8
        "#;

        let config: PostboxConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.data_file, PathBuf::from("/var/lib/postbox/messages.json"));
        assert!(!config.publisher.enabled);
        assert_eq!(config.publisher.timeout_ms, 250);
        assert_eq!(config.hub.port, 7001);
        assert_eq!(config.hub.send_timeout(), Duration::from_millis(100));
        assert_eq!(config.hub.read_timeout(), Duration::from_millis(200));
        assert_eq!(config.hub.subscriber_buffer, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config() {
        let config = PostboxConfig::default();
        assert_eq!(config.server.port, 3000);
        assert!(config.publisher.enabled);
        assert_eq!(config.hub.port, 6001);
        assert_eq!(
            config.hub.event_socket_addr().unwrap(),
            "127.0.0.1:6000".parse::<SocketAddr>().unwrap()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_event_addr() {
        let toml = r#"
            [hub]
            event_addr = "not-an-address"
        "#;

        let config: PostboxConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_buffer() {
        let toml = r#"
            [hub]
            subscriber_buffer = 0
        "#;

        let config: PostboxConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_publish_timeout() {
        let toml = r#"
            [publisher]
            timeout_ms = 0
        "#;

        let config: PostboxConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = PostboxConfig::load_from("/nonexistent/postbox.toml").unwrap();
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 3100\n\n[hub]\nport = 6100").unwrap();

        let config = PostboxConfig::load_from(file.path()).unwrap();
        assert_eq!(config.server.port, 3100);
        assert_eq!(config.hub.port, 6100);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();

        let result = PostboxConfig::load_from(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_build_publisher() {
        let mut config = PostboxConfig::default();
        assert_eq!(config.build_publisher().name(), "tcp");

        config.publisher.enabled = false;
        assert_eq!(config.build_publisher().name(), "noop");
    }
}
