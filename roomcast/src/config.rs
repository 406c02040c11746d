use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use roomcast_sfu::SfuConfig;
use roomcast_signaling::SignalingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Used when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file
    /// 3. Defaults (lowest priority)
    ///
    /// An explicit `config_file` must exist; the implicit `config.yaml` is
    /// optional. Nested keys use a double underscore:
    /// `ROOMCAST_SFU__MAX_ROOMS=10`. `ROOMCAST_SFU__ICE_SERVERS` takes a
    /// comma-separated list.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_from(config_file, None)
    }

    /// `env` replaces the process environment when set
    fn load_from(config_file: Option<&str>, env: Option<config::Map<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        match config_file {
            Some(path) => builder = builder.add_source(File::with_name(path)),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("ROOMCAST")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sfu.ice_servers")
                .try_parsing(true)
                .source(env),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Collect every configuration problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if EnvFilter::try_new(&self.logging.level).is_err() {
            errors.push(format!("logging.level \"{}\" is not a valid filter", self.logging.level));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if self.sfu.ice_servers.iter().any(|url| url.trim().is_empty()) {
            errors.push("sfu.ice_servers contains an empty URL".to_string());
        }
        if self.sfu.event_queue_capacity == 0 {
            errors.push("sfu.event_queue_capacity must be non-zero".to_string());
        }
        if self.sfu.relay_buffer_size == 0 {
            errors.push("sfu.relay_buffer_size must be non-zero".to_string());
        }

        let signaling = &self.signaling;
        if signaling.outbound_queue_capacity == 0 {
            errors.push("signaling.outbound_queue_capacity must be non-zero".to_string());
        }
        if signaling.hub_queue_capacity == 0 {
            errors.push("signaling.hub_queue_capacity must be non-zero".to_string());
        }
        if signaling.max_message_size == 0 {
            errors.push("signaling.max_message_size must be non-zero".to_string());
        }
        if signaling.pong_wait_secs == 0 {
            errors.push("signaling.pong_wait_secs must be non-zero".to_string());
        }
        if signaling.ping_period().is_zero() || signaling.ping_period() >= signaling.pong_wait() {
            errors.push("signaling ping period must be positive and shorter than the pong wait".to_string());
        }
        if signaling.write_wait_secs == 0 {
            errors.push("signaling.write_wait_secs must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:8080");
        assert_eq!(config.sfu.ice_servers, vec!["stun:stun.l.google.com:19302".to_string()]);
        assert_eq!(config.signaling.outbound_queue_capacity, 256);
        assert_eq!(config.signaling.max_message_size, 512 * 1024);
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = Config::default();
        config.sfu.ice_servers.push(" ".to_string());
        config.signaling.outbound_queue_capacity = 0;
        config.signaling.ping_period_secs = Some(60);
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("ice_servers")));
        assert!(errors.iter().any(|e| e.contains("ping period")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 9000\nsfu:\n  max_rooms: 3\n  ice_servers:\n    - stun:stun.example.org:3478\nsignaling:\n  pong_wait_secs: 30"
        )
        .unwrap();

        let config = Config::load_from(file.path().to_str(), Some(config::Map::new())).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.sfu.max_rooms, 3);
        assert_eq!(config.sfu.ice_servers, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(config.signaling.pong_wait_secs, 30);
        assert_eq!(config.signaling.write_wait_secs, 10);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 9000\nsfu:\n  max_rooms: 3\n  ice_servers:\n    - stun:stun.example.org:3478"
        )
        .unwrap();

        let env = config::Map::from_iter([
            ("ROOMCAST_SFU__MAX_ROOMS".to_string(), "7".to_string()),
            ("ROOMCAST_SFU__ICE_SERVERS".to_string(), "stun:a.example.org,stun:b.example.org".to_string()),
            ("ROOMCAST_SERVER__PORT".to_string(), "9100".to_string()),
            ("OTHER_SERVER__PORT".to_string(), "1".to_string()),
        ]);

        let config = Config::load_from(file.path().to_str(), Some(env)).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.sfu.max_rooms, 7);
        assert_eq!(
            config.sfu.ice_servers,
            vec!["stun:a.example.org".to_string(), "stun:b.example.org".to_string()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::load_from(Some("/nonexistent/roomcast.yaml"), Some(config::Map::new())).is_err());
    }

    #[test]
    fn test_implicit_default_file_is_optional() {
        let config = Config::load_from(None, Some(config::Map::new())).unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_bad_log_filter() {
        let mut config = Config::default();
        config.logging.level = "roomcast=loud".to_string();
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("logging.level"), "{errors:?}");

        config.logging.level = "warn,roomcast_sfu=debug".to_string();
        assert!(config.validate().is_ok());
    }
}
