//! Runtime configuration.
//!
//! Configuration is read from YAML and may be overlaid with environment
//! variables:
//!
//! | variable | field |
//! |---|---|
//! | `EDDY_WORKERS` | `workers` |
//! | `EDDY_PERSISTENT_STORAGE` | `persistence.path` |
//! | `EDDY_SNAPSHOT_INTERVAL` | `persistence.snapshot_interval` |
//! | `EDDY_STRICT_INGRESS` | `strict_ingress` |

use crate::async_transform::RetryStrategy;
use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker threads used to evaluate independent graph branches
    pub workers: usize,

    /// Abort on rejected ingress changes instead of logging and dropping them
    pub strict_ingress: bool,

    /// Checkpointing, disabled when absent
    pub persistence: Option<PersistenceConfig>,

    /// Defaults for async transformers
    pub async_defaults: AsyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            strict_ingress: false,
            persistence: None,
            async_defaults: AsyncConfig::default(),
        }
    }
}

/// Where and how often to checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding `metadata.json` and `batches.jsonl`
    pub path: PathBuf,

    /// Number of batches between metadata snapshots
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: usize,
}

impl PersistenceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot_interval: default_snapshot_interval(),
        }
    }

    pub fn with_snapshot_interval(mut self, batches: usize) -> Self {
        self.snapshot_interval = batches;
        self
    }
}

/// Defaults applied to async transformers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncConfig {
    /// Per-attempt timeout
    #[serde(with = "millis::option")]
    pub timeout: Option<Duration>,

    pub retry: RetryStrategy,

    /// Maximum number of calls in flight
    pub capacity: usize,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: RetryStrategy::None,
            capacity: default_capacity(),
        }
    }
}

fn default_snapshot_interval() -> usize {
    16
}

fn default_capacity() -> usize {
    64
}

impl Config {
    /// Parses a YAML document. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Default configuration overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Overlays the process environment on this configuration.
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|name| std::env::var(name).ok())
    }

    /// Overlays variables obtained from `lookup`.
    pub fn with_vars<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = lookup("EDDY_WORKERS") {
            self.workers = parse_var("EDDY_WORKERS", &workers)?;
        }
        if let Some(strict) = lookup("EDDY_STRICT_INGRESS") {
            self.strict_ingress = parse_bool("EDDY_STRICT_INGRESS", &strict)?;
        }
        if let Some(path) = lookup("EDDY_PERSISTENT_STORAGE") {
            match self.persistence.as_mut() {
                Some(persistence) => persistence.path = PathBuf::from(path),
                None => self.persistence = Some(PersistenceConfig::new(path)),
            }
        }
        if let Some(interval) = lookup("EDDY_SNAPSHOT_INTERVAL") {
            let interval = parse_var("EDDY_SNAPSHOT_INTERVAL", &interval)?;
            match self.persistence.as_mut() {
                Some(persistence) => persistence.snapshot_interval = interval,
                None => {
                    return Err(RuntimeError::config(
                        "EDDY_SNAPSHOT_INTERVAL set without persistent storage",
                    ))
                }
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(RuntimeError::config("workers must be greater than 0"));
        }
        if let Some(persistence) = &self.persistence {
            if persistence.snapshot_interval == 0 {
                return Err(RuntimeError::config(
                    "snapshot_interval must be greater than 0",
                ));
            }
            if persistence.path.as_os_str().is_empty() {
                return Err(RuntimeError::config("persistence path is empty"));
            }
        }
        if self.async_defaults.capacity == 0 {
            return Err(RuntimeError::config("async capacity must be greater than 0"));
        }
        if self.async_defaults.timeout == Some(Duration::ZERO) {
            return Err(RuntimeError::config("async timeout must be greater than 0"));
        }
        self.async_defaults.retry.validate()
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RuntimeError::config(format!("{name}: invalid value {value:?}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RuntimeError::config(format!(
            "{name}: invalid value {value:?}"
        ))),
    }
}

/// Durations as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 1);
        assert!(config.persistence.is_none());
    }

    #[test]
    fn test_from_yaml() {
        let config = Config::from_yaml_str(
            r#"
workers: 4
strict_ingress: true
persistence:
  path: /var/lib/eddy
  snapshot_interval: 8
async_defaults:
  timeout: 1500
  capacity: 10
  retry:
    type: exponential_backoff
    initial: 100
    multiplier: 2.0
    max_delay: 1000
    max_retries: 3
"#,
        )
        .unwrap();
        assert_eq!(config.workers, 4);
        assert!(config.strict_ingress);
        let persistence = config.persistence.unwrap();
        assert_eq!(persistence.path, PathBuf::from("/var/lib/eddy"));
        assert_eq!(persistence.snapshot_interval, 8);
        assert_eq!(config.async_defaults.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.async_defaults.retry.max_retries(), 3);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = Config::from_yaml_str("workers: 2\npersistence:\n  path: ./state\n").unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.persistence.unwrap().snapshot_interval, 16);
        assert_eq!(config.async_defaults.capacity, 64);
    }

    #[test]
    fn test_invalid_yaml_values() {
        assert!(Config::from_yaml_str("workers: 0").is_err());
        assert!(Config::from_yaml_str("workers: many").is_err());
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("EDDY_WORKERS", "3"),
            ("EDDY_PERSISTENT_STORAGE", "/tmp/eddy"),
            ("EDDY_SNAPSHOT_INTERVAL", "5"),
            ("EDDY_STRICT_INGRESS", "yes"),
        ]
        .into_iter()
        .collect();
        let config = Config::default()
            .with_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.workers, 3);
        assert!(config.strict_ingress);
        assert_eq!(
            config.persistence,
            Some(PersistenceConfig::new("/tmp/eddy").with_snapshot_interval(5))
        );
    }

    #[test]
    fn test_env_overlay_rejects_garbage() {
        let result = Config::default().with_vars(|name| {
            (name == "EDDY_STRICT_INGRESS").then(|| "maybe".to_string())
        });
        assert!(result.is_err());

        let result = Config::default()
            .with_vars(|name| (name == "EDDY_SNAPSHOT_INTERVAL").then(|| "4".to_string()));
        assert!(result.is_err());
    }
}
