//! Recognized configuration options for the collector daemon.
//!
//! Only the option set is specified here; how the values arrive (flags,
//! files, an embedding collector) is the caller's concern.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Configuration validation or parse failure.
#[derive(Debug)]
pub enum ConfigError {
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// MySQL collection period: a fixed number of seconds, or adaptive polling
/// driven by the governor.
///
/// Parsed from an integer or a string: integer seconds must be at least 1;
/// the exact string `"adaptive"` (case-sensitive) selects the governor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalSpec {
    Fixed(u64),
    Adaptive,
}

impl IntervalSpec {
    fn fixed_checked(seconds: u64) -> Result<Self, ConfigError> {
        if seconds == 0 {
            return Err(ConfigError::Invalid(
                "collection_interval must be at least 1 second".to_string(),
            ));
        }
        Ok(IntervalSpec::Fixed(seconds))
    }
}

impl FromStr for IntervalSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "adaptive" {
            return Ok(IntervalSpec::Adaptive);
        }
        match s.parse::<u64>() {
            Ok(seconds) => Self::fixed_checked(seconds),
            Err(_) => Err(ConfigError::Invalid(format!(
                "collection_interval must be whole seconds or \"adaptive\", got {:?}",
                s
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for IntervalSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(n) => Self::fixed_checked(n).map_err(serde::de::Error::custom),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Adaptive polling settings (MySQL only).
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveConfig {
    /// Forces adaptive mode regardless of `collection_interval`.
    pub enabled: bool,
    /// Governor base interval in seconds.
    pub base_interval: u64,
    /// Directory for governor state persistence; unset disables it.
    pub state_directory: Option<PathBuf>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_interval: 1,
            state_directory: None,
        }
    }
}

impl AdaptiveConfig {
    /// State directory with empty paths treated as "persistence off".
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_directory
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .cloned()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MysqlConfig {
    pub enabled: bool,
    /// Target in `host:port` form.
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Database used for the connection.
    pub database: String,
    pub collection_interval: IntervalSpec,
    pub adaptive: AdaptiveConfig,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "127.0.0.1:3306".to_string(),
            username: "root".to_string(),
            password: String::new(),
            database: "information_schema".to_string(),
            collection_interval: IntervalSpec::Fixed(10),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl MysqlConfig {
    /// Adaptive mode is selected by the interval spec or forced by the
    /// adaptive block.
    pub fn adaptive_mode(&self) -> bool {
        self.collection_interval == IntervalSpec::Adaptive || self.adaptive.enabled
    }

    /// Governor base interval, floored at one second.
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.adaptive.base_interval.max(1))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostgresConfig {
    pub enabled: bool,
    /// Target in `host:port` form.
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Fixed period in seconds; PostgreSQL has no adaptive mode.
    pub collection_interval: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "127.0.0.1:5432".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            collection_interval: 10,
        }
    }
}

/// Full option set consumed by the daemon.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mysql: MysqlConfig,
    pub postgresql: PostgresConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mysql.enabled {
            if self.mysql.endpoint.is_empty() {
                return Err(ConfigError::Invalid("mysql.endpoint is required".to_string()));
            }
            if self.mysql.adaptive.base_interval == 0 {
                return Err(ConfigError::Invalid(
                    "mysql.adaptive.base_interval must be at least 1 second".to_string(),
                ));
            }
        }
        if self.postgresql.enabled {
            if self.postgresql.endpoint.is_empty() {
                return Err(ConfigError::Invalid(
                    "postgresql.endpoint is required".to_string(),
                ));
            }
            if self.postgresql.collection_interval == 0 {
                return Err(ConfigError::Invalid(
                    "postgresql.collection_interval must be at least 1 second".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_spec_from_str() {
        assert_eq!("adaptive".parse::<IntervalSpec>().unwrap(), IntervalSpec::Adaptive);
        assert_eq!("30".parse::<IntervalSpec>().unwrap(), IntervalSpec::Fixed(30));
        assert!("0".parse::<IntervalSpec>().is_err());
        assert!("1.5".parse::<IntervalSpec>().is_err());
        // Case-sensitive on purpose.
        assert!("Adaptive".parse::<IntervalSpec>().is_err());
        assert!("ADAPTIVE".parse::<IntervalSpec>().is_err());
    }

    #[test]
    fn interval_spec_deserializes_from_int_and_string() {
        let spec: IntervalSpec = serde_json::from_str("15").unwrap();
        assert_eq!(spec, IntervalSpec::Fixed(15));

        let spec: IntervalSpec = serde_json::from_str("\"15\"").unwrap();
        assert_eq!(spec, IntervalSpec::Fixed(15));

        let spec: IntervalSpec = serde_json::from_str("\"adaptive\"").unwrap();
        assert_eq!(spec, IntervalSpec::Adaptive);

        assert!(serde_json::from_str::<IntervalSpec>("0").is_err());
        assert!(serde_json::from_str::<IntervalSpec>("\"fast\"").is_err());
    }

    #[test]
    fn config_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(!config.mysql.enabled);
        assert_eq!(config.mysql.database, "information_schema");
        assert_eq!(config.mysql.collection_interval, IntervalSpec::Fixed(10));
        assert_eq!(config.postgresql.collection_interval, 10);
        config.validate().unwrap();
    }

    #[test]
    fn adaptive_mode_selection() {
        let config: Config = serde_json::from_str(
            r#"{"mysql": {"enabled": true, "collection_interval": "adaptive"}}"#,
        )
        .unwrap();
        assert!(config.mysql.adaptive_mode());

        let config: Config = serde_json::from_str(
            r#"{"mysql": {"enabled": true, "collection_interval": 5, "adaptive": {"enabled": true}}}"#,
        )
        .unwrap();
        assert!(config.mysql.adaptive_mode());

        let config: Config =
            serde_json::from_str(r#"{"mysql": {"enabled": true, "collection_interval": 5}}"#)
                .unwrap();
        assert!(!config.mysql.adaptive_mode());
    }

    #[test]
    fn empty_state_directory_disables_persistence() {
        let config: Config = serde_json::from_str(
            r#"{"mysql": {"adaptive": {"state_directory": ""}}}"#,
        )
        .unwrap();
        assert!(config.mysql.adaptive.state_dir().is_none());

        let config: Config = serde_json::from_str(
            r#"{"mysql": {"adaptive": {"state_directory": "/var/lib/qan"}}}"#,
        )
        .unwrap();
        assert_eq!(
            config.mysql.adaptive.state_dir(),
            Some(PathBuf::from("/var/lib/qan"))
        );
    }

    #[test]
    fn validate_rejects_zero_postgres_interval() {
        let config: Config = serde_json::from_str(
            r#"{"postgresql": {"enabled": true, "collection_interval": 0}}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_endpoint() {
        let config: Config =
            serde_json::from_str(r#"{"mysql": {"enabled": true, "endpoint": ""}}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
