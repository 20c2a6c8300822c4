use serde::{Deserialize, Serialize};

use super::errors::ConfigError;
use super::logging::LoggingConfig;
use super::stub::StubConfig;
use super::upstream::UpstreamConfig;

/// Main configuration structure for loopdns.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Stub listener configuration (primary mode, extra endpoints).
    #[serde(default)]
    pub stub: StubConfig,

    /// Upstream forwarding configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file or use defaults.
    ///
    /// Priority order:
    /// 1. Explicitly provided path
    /// 2. loopdns.toml in current directory
    /// 3. /etc/loopdns/config.toml
    /// 4. Default configuration
    pub fn load(path: Option<&str>, cli_overrides: CliOverrides) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else if std::path::Path::new("loopdns.toml").exists() {
            Self::from_file("loopdns.toml")?
        } else if std::path::Path::new("/etc/loopdns/config.toml").exists() {
            Self::from_file("/etc/loopdns/config.toml")?
        } else {
            Self::default()
        };

        config.apply_cli_overrides(cli_overrides);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_cli_overrides(&mut self, overrides: CliOverrides) {
        if let Some(mode) = overrides.listener_mode {
            self.stub.listener = mode;
        }
        if let Some(extra) = overrides.extra_listeners {
            self.stub.extra = extra;
        }
        if let Some(servers) = overrides.upstream_servers {
            self.upstream.servers = servers;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stub.extra_listeners()?;
        for server in &self.upstream.servers {
            server
                .parse::<std::net::SocketAddr>()
                .map_err(|e| ConfigError::Validation(format!("upstream '{}': {}", server, e)))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CliOverrides {
    pub listener_mode: Option<super::stub::ListenerMode>,
    pub extra_listeners: Option<Vec<String>>,
    pub upstream_servers: Option<Vec<String>>,
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [stub]
            listener = "udp"
            extra = ["udp:192.0.2.1:5353"]

            [upstream]
            servers = ["198.51.100.1:53"]

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert!(config.stub.listener.has_udp());
        assert!(!config.stub.listener.has_tcp());
        assert_eq!(config.stub.extra_listeners().unwrap().len(), 1);
        assert_eq!(config.logging.level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_upstream() {
        let mut config = Config::default();
        config.upstream.servers = vec!["not-an-address".to_string()];
        assert!(config.validate().is_err());
    }
}
