//! # Configuration Management
//!
//! Settings for one connection to the hardware daemon plus the logging
//! setup used by applications and demos.
//!
//! ## Sources
//! - TOML files or strings (`from_file()`, `from_toml()`); missing keys fall
//!   back to their defaults
//! - `IPCON_*` environment variables (`from_env()`)
//! - Plain struct literals or `default_with_overrides()`
//!
//! ## Timing
//! The response timeout and the disconnect probe interval are independent.
//! The prober only watches the outbound path, so a long response timeout
//! never delays or suppresses a probe, and a probe never ends a pending call.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Size of the fixed packet header
pub const HEADER_SIZE: usize = 8;

/// Largest packet the one-byte length field can describe
pub const MAX_PACKET_SIZE: usize = u8::MAX as usize;

/// Largest payload that fits one packet
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Port the daemon listens on by default
pub const DEFAULT_PORT: u16 = 4223;

/// Top-level configuration: connection plus logging.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Read a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid configuration: {e}")))
    }

    /// Defaults overridden by `IPCON_*` variables. A variable that is set but
    /// does not parse is an error rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        let client = &mut config.client;

        if let Some(host) = env_value::<String>("IPCON_HOST")? {
            client.host = host;
        }
        if let Some(port) = env_value("IPCON_PORT")? {
            client.port = port;
        }
        if let Some(ms) = env_value("IPCON_CONNECT_TIMEOUT_MS")? {
            client.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("IPCON_RESPONSE_TIMEOUT_MS")? {
            client.response_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("IPCON_PROBE_INTERVAL_MS")? {
            client.disconnect_probe_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("IPCON_RECONNECT_INTERVAL_MS")? {
            client.reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(flag) = env_value("IPCON_AUTO_RECONNECT")? {
            client.auto_reconnect = flag;
        }
        if let Some(level) = env_value("IPCON_LOG_LEVEL")? {
            config.logging.log_level = level;
        }
        if let Some(json) = env_value("IPCON_LOG_JSON")? {
            config.logging.json_format = json;
        }

        Ok(config)
    }

    /// Defaults with `mutator` applied on top.
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The default configuration rendered as TOML, for use as a template.
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|e| format!("# could not render defaults: {e}\n"))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to render config: {e}")))?;
        std::fs::write(path, content).map_err(|e| {
            ProtocolError::ConfigError(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Every problem found, one message each. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.client.validate();
        errors.extend(self.logging.validate());
        errors
    }

    /// `validate()` folded into a single `ConfigError`.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid {name}={raw:?}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ProtocolError::ConfigError(format!("Invalid {name}: {e}"))),
    }
}

/// Where and how to reach the daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,

    pub port: u16,

    /// Limit for establishing the TCP connection
    #[serde(with = "millis")]
    pub connect_timeout: Duration,

    /// How long a call waits for its response
    #[serde(with = "millis")]
    pub response_timeout: Duration,

    /// Idle time on the send path before a disconnect probe goes out
    #[serde(with = "millis")]
    pub disconnect_probe_interval: Duration,

    /// Re-establish the connection after the peer drops it
    pub auto_reconnect: bool,

    /// Pause between failed reconnect attempts
    #[serde(with = "millis")]
    pub reconnect_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: DEFAULT_PORT,
            connect_timeout: timeout::CONNECT_TIMEOUT,
            response_timeout: timeout::DEFAULT_RESPONSE_TIMEOUT,
            disconnect_probe_interval: timeout::DISCONNECT_PROBE_INTERVAL,
            auto_reconnect: true,
            reconnect_interval: timeout::RECONNECT_INTERVAL,
        }
    }
}

/// Inclusive bounds for one duration setting.
struct Bounds {
    name: &'static str,
    min: Duration,
    max: Option<Duration>,
}

impl Bounds {
    fn check(&self, value: Duration, errors: &mut Vec<String>) {
        if value < self.min {
            errors.push(format!(
                "{} too short (minimum: {})",
                self.name,
                human(self.min)
            ));
        } else if let Some(max) = self.max.filter(|max| value > *max) {
            errors.push(format!("{} too long (maximum: {})", self.name, human(max)));
        }
    }
}

fn human(d: Duration) -> String {
    match d.as_millis() {
        ms if ms < 1000 => format!("{ms}ms"),
        _ if d.as_secs() % 3600 == 0 => format!("{}h", d.as_secs() / 3600),
        _ => format!("{}s", d.as_secs()),
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.host.trim().is_empty() {
            errors.push("Client host cannot be empty".to_string());
        }
        if self.port == 0 {
            errors.push("Client port must be greater than 0".to_string());
        }

        let checks = [
            (
                Bounds {
                    name: "Connect timeout",
                    min: Duration::from_millis(100),
                    max: Some(Duration::from_secs(300)),
                },
                self.connect_timeout,
            ),
            (
                Bounds {
                    name: "Response timeout",
                    min: Duration::from_millis(10),
                    max: None,
                },
                self.response_timeout,
            ),
            (
                Bounds {
                    name: "Disconnect probe interval",
                    min: Duration::from_millis(100),
                    max: Some(Duration::from_secs(3600)),
                },
                self.disconnect_probe_interval,
            ),
            (
                Bounds {
                    name: "Reconnect interval",
                    min: Duration::from_millis(10),
                    max: Some(Duration::from_secs(60)),
                },
                self.reconnect_interval,
            ),
        ];
        for (bounds, value) in &checks {
            bounds.check(*value, &mut errors);
        }

        errors
    }
}

/// Subscriber settings consumed by `utils::logging::init_logging`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Name reported in the startup log line
    pub app_name: String,

    #[serde(with = "level")]
    pub log_level: Level,

    /// Emit JSON lines instead of human readable output
    pub json_format: bool,

    /// Let `RUST_LOG` override `log_level`
    pub env_filter: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("ipcon-protocol"),
            log_level: Level::INFO,
            json_format: false,
            env_filter: true,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        match self.app_name.len() {
            0 => vec!["Application name cannot be empty".to_string()],
            len if len > 64 => vec![format!(
                "Application name too long: {len} characters (maximum: 64)"
            )],
            _ => Vec::new(),
        }
    }
}

/// `Duration` as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `tracing::Level` as a lowercase name.
mod level {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(value: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| de::Error::custom(format!("unknown log level '{name}'")))
    }
}
