//! Configuration
//!
//! TOML-based configuration with `DYNAMQ_*` environment overrides and
//! `${VAR}` / `${VAR:-default}` substitution inside the file. CLI arguments
//! override both.

use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::auth::AclRule;
use crate::sink::DataRoute;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub node: NodeConfig,
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub session: SessionConfig,
    pub limits: LimitsConfig,
    pub retry: RetryConfig,
    pub auth: AuthConfig,
    pub acl: AclConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub routes: Vec<DataRoute>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Node identity
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id; generated when absent
    pub id: Option<String>,
}

impl NodeConfig {
    /// The configured id, or a generated `node-<hex>` one
    pub fn resolve_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
        })
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// MQTT/TCP bind address
    pub bind: SocketAddr,
    /// MQTT/TLS bind address (optional)
    pub tls_bind: Option<SocketAddr>,
    /// TLS certificate configuration
    pub tls: Option<TlsFileConfig>,
    /// MQTT/WebSocket bind address (optional)
    pub ws_bind: Option<SocketAddr>,
    /// WebSocket upgrade path
    pub ws_path: String,
    /// Worker threads (0 = CPU count)
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".parse().unwrap(),
            tls_bind: None,
            tls: None,
            ws_bind: None,
            ws_path: "/mqtt".to_string(),
            workers: 0,
        }
    }
}

/// TLS file locations
#[derive(Debug, Clone, Deserialize)]
pub struct TlsFileConfig {
    pub cert: String,
    pub key: String,
    #[serde(default)]
    pub ca_cert: Option<String>,
    #[serde(default)]
    pub require_client_cert: bool,
}

/// Shared store connection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Session behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Persistent-session expiry in seconds
    pub expiry: u64,
    /// Keep-alive applied when the client sends 0
    pub default_keep_alive: u16,
    /// Upper bound on the negotiated keep-alive
    pub max_keep_alive: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry: 3600,
            default_keep_alive: 60,
            max_keep_alive: 600,
        }
    }
}

/// Connection limits and admission control
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_connections: usize,
    pub max_packet_size: usize,
    pub rate_limit_enabled: bool,
    pub max_connections_per_ip: u32,
    pub connect_rate_per_second: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            rate_limit_enabled: true,
            max_connections_per_ip: 100,
            connect_rate_per_second: 50,
        }
    }
}

/// QoS retry behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Sweep interval in seconds
    pub interval: u64,
    /// Retransmissions before the message is dropped
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: 10,
            max_retries: 3,
        }
    }
}

/// Authentication table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub allow_anonymous: bool,
    pub users: Vec<UserEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_anonymous: true,
            users: Vec::new(),
        }
    }
}

/// One username/password pair
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
}

/// Access-control rules
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AclConfig {
    pub enabled: bool,
    pub rules: Vec<AclRule>,
}

/// Metrics endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:9090".parse().unwrap(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with env substitution and
    /// `DYNAMQ_*` overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let cfg = config::Config::builder()
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            .add_source(Environment::with_prefix("DYNAMQ").separator("__"))
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "limits.max_packet_size must be positive".to_string(),
            ));
        }

        if self.session.max_keep_alive == 0 {
            return Err(ConfigError::Validation(
                "session.max_keep_alive must be positive".to_string(),
            ));
        }

        if self.retry.interval == 0 {
            return Err(ConfigError::Validation(
                "retry.interval must be positive".to_string(),
            ));
        }

        if let Some(tls_bind) = self.server.tls_bind {
            if self.server.tls.is_none() {
                return Err(ConfigError::Validation(format!(
                    "server.tls is required when tls_bind ({}) is set",
                    tls_bind
                )));
            }
        }

        if self.auth.enabled && self.auth.users.is_empty() && !self.auth.allow_anonymous {
            return Err(ConfigError::Validation(
                "auth.enabled without users or allow_anonymous locks everyone out".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind.port(), 1883);
        assert_eq!(config.session.default_keep_alive, 60);
        assert_eq!(config.retry.interval, 10);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.limits.max_connections_per_ip, 100);
        assert_eq!(config.limits.connect_rate_per_second, 50);
        assert!(!config.redis.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("DYNAMQ_TEST_SUB_PORT", "2883");
        let out = substitute_env_vars("bind = \"0.0.0.0:${DYNAMQ_TEST_SUB_PORT}\"");
        assert_eq!(out, "bind = \"0.0.0.0:2883\"");

        let out = substitute_env_vars("url = \"${DYNAMQ_TEST_MISSING:-redis://fallback}\"");
        assert_eq!(out, "url = \"redis://fallback\"");
    }

    #[test]
    fn test_node_id_generation() {
        let node = NodeConfig { id: None };
        let id = node.resolve_id();
        assert!(id.starts_with("node-"));
        assert_eq!(id.len(), "node-".len() + 8);

        let node = NodeConfig {
            id: Some("broker-1".to_string()),
        };
        assert_eq!(node.resolve_id(), "broker-1");
    }

    #[test]
    fn test_tls_bind_requires_tls_section() {
        let mut config = Config::default();
        config.server.tls_bind = Some("0.0.0.0:8883".parse().unwrap());
        assert!(config.validate().is_err());

        config.server.tls = Some(TlsFileConfig {
            cert: "server.pem".to_string(),
            key: "server.key".to_string(),
            ca_cert: None,
            require_client_cert: false,
        });
        assert!(config.validate().is_ok());
    }
}
