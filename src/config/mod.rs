//! Engine settings
//!
//! Settings are read from a TOML or YAML file, then overridden by
//! `GRIDREDUCE_*` environment variables, then validated once.

use crate::error::{MapReduceError, MapReduceResult};
use crate::mapreduce::DEFAULT_INTERMEDIATE_STORE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default size of a migrated chunk, in values
pub const DEFAULT_MAX_COLLECTOR_SIZE: usize = 1024;

/// Default number of processed entries between two cancellation checks
pub const DEFAULT_CHECK_FREQUENCY: usize = 32;

const ENV_MAX_COLLECTOR_SIZE: &str = "GRIDREDUCE_MAX_COLLECTOR_SIZE";
const ENV_CHECK_FREQUENCY: &str = "GRIDREDUCE_CANCELLATION_CHECK_FREQUENCY";
const ENV_TIMEOUT: &str = "GRIDREDUCE_TIMEOUT";
const ENV_INTERMEDIATE_STORE: &str = "GRIDREDUCE_INTERMEDIATE_STORE";

/// Tunables shared by every task an engine runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of values per chunk merged into the intermediate store
    pub max_collector_size: usize,

    /// Entries processed between two cancellation checks, a power of two
    pub cancellation_check_frequency: usize,

    /// Timeout for each remote invocation; zero waits forever
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Name of the intermediate store shared across tasks
    pub intermediate_store_name: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_collector_size: DEFAULT_MAX_COLLECTOR_SIZE,
            cancellation_check_frequency: DEFAULT_CHECK_FREQUENCY,
            timeout: Duration::ZERO,
            intermediate_store_name: DEFAULT_INTERMEDIATE_STORE.to_string(),
        }
    }
}

impl EngineSettings {
    pub fn from_toml_str(content: &str) -> MapReduceResult<Self> {
        toml::from_str(content).map_err(|e| MapReduceError::SettingsLoadFailed {
            path: "<toml>".into(),
            reason: e.to_string(),
            source: Some(Box::new(e)),
        })
    }

    pub fn from_yaml_str(content: &str) -> MapReduceResult<Self> {
        serde_yaml::from_str(content).map_err(|e| MapReduceError::SettingsLoadFailed {
            path: "<yaml>".into(),
            reason: e.to_string(),
            source: Some(Box::new(e)),
        })
    }

    /// Load settings from `path`, apply environment overrides and validate
    pub fn load(path: &Path) -> MapReduceResult<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| MapReduceError::SettingsLoadFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
                source: Some(Box::new(e)),
            })?;

        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(MapReduceError::SettingsLoadFailed {
                path: path.to_path_buf(),
                reason: format!("unsupported settings format {:?}", other.unwrap_or("")),
                source: None,
            }),
        };
        let mut settings = parsed.map_err(|e| match e {
            MapReduceError::SettingsLoadFailed { reason, source, .. } => {
                MapReduceError::SettingsLoadFailed {
                    path: path.to_path_buf(),
                    reason,
                    source,
                }
            }
            other => other,
        })?;

        settings.merge_env_vars()?;
        settings.validate()?;
        debug!("Loaded engine settings from {}", path.display());
        Ok(settings)
    }

    /// Apply `GRIDREDUCE_*` overrides from the process environment
    pub fn merge_env_vars(&mut self) -> MapReduceResult<()> {
        self.merge_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides looked up through `lookup`
    pub fn merge_env_from<F>(&mut self, lookup: F) -> MapReduceResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_COLLECTOR_SIZE) {
            self.max_collector_size = parse_count(ENV_MAX_COLLECTOR_SIZE, &value)?;
        }

        if let Some(value) = lookup(ENV_CHECK_FREQUENCY) {
            self.cancellation_check_frequency = parse_count(ENV_CHECK_FREQUENCY, &value)?;
        }

        if let Some(value) = lookup(ENV_TIMEOUT) {
            self.timeout =
                humantime_serde::re::humantime::parse_duration(&value).map_err(|e| MapReduceError::InvalidSetting {
                    field: ENV_TIMEOUT.to_string(),
                    value: value.clone(),
                    reason: e.to_string(),
                })?;
        }

        if let Some(value) = lookup(ENV_INTERMEDIATE_STORE) {
            self.intermediate_store_name = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> MapReduceResult<()> {
        if self.max_collector_size == 0 {
            return Err(invalid(
                "max_collector_size",
                self.max_collector_size,
                "must be at least 1",
            ));
        }
        if !self.cancellation_check_frequency.is_power_of_two() {
            return Err(invalid(
                "cancellation_check_frequency",
                self.cancellation_check_frequency,
                "must be a power of two",
            ));
        }
        if self.intermediate_store_name.trim().is_empty() {
            return Err(invalid(
                "intermediate_store_name",
                &self.intermediate_store_name,
                "must not be empty",
            ));
        }
        Ok(())
    }

    /// The timeout, or `None` when unbounded
    pub fn timeout_opt(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

fn parse_count(field: &str, value: &str) -> MapReduceResult<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| MapReduceError::InvalidSetting {
            field: field.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> MapReduceError {
    MapReduceError::InvalidSetting {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = EngineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_collector_size, 1024);
        assert_eq!(settings.cancellation_check_frequency, 32);
        assert_eq!(settings.timeout_opt(), None);
        assert_eq!(settings.intermediate_store_name, "__tmpMapReduce");
    }

    #[test]
    fn test_parse_toml_with_humantime_timeout() {
        let settings = EngineSettings::from_toml_str(
            r#"
            max_collector_size = 16
            timeout = "1m 30s"
            "#,
        )
        .unwrap();
        assert_eq!(settings.max_collector_size, 16);
        assert_eq!(settings.timeout_opt(), Some(Duration::from_secs(90)));
        assert_eq!(settings.cancellation_check_frequency, DEFAULT_CHECK_FREQUENCY);
    }

    #[test]
    fn test_parse_yaml() {
        let settings = EngineSettings::from_yaml_str(
            "cancellation_check_frequency: 64\nintermediate_store_name: scratch\n",
        )
        .unwrap();
        assert_eq!(settings.cancellation_check_frequency, 64);
        assert_eq!(settings.intermediate_store_name, "scratch");
    }

    #[test]
    fn test_validate_rejects_non_power_of_two_frequency() {
        let settings = EngineSettings {
            cancellation_check_frequency: 48,
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(matches!(
            err,
            MapReduceError::InvalidSetting { ref field, .. } if field == "cancellation_check_frequency"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_chunks() {
        let settings = EngineSettings {
            max_collector_size: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_merge_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GRIDREDUCE_MAX_COLLECTOR_SIZE", "8"),
            ("GRIDREDUCE_TIMEOUT", "250ms"),
            ("GRIDREDUCE_INTERMEDIATE_STORE", "__scratch"),
        ]
        .into_iter()
        .collect();

        let mut settings = EngineSettings::default();
        settings
            .merge_env_from(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.max_collector_size, 8);
        assert_eq!(settings.timeout, Duration::from_millis(250));
        assert_eq!(settings.intermediate_store_name, "__scratch");
        assert_eq!(settings.cancellation_check_frequency, DEFAULT_CHECK_FREQUENCY);
    }

    #[test]
    fn test_merge_env_rejects_garbage() {
        let mut settings = EngineSettings::default();
        let err = settings
            .merge_env_from(|name| {
                (name == "GRIDREDUCE_CANCELLATION_CHECK_FREQUENCY").then(|| "often".to_string())
            })
            .unwrap_err();
        assert!(err.to_string().contains("often"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_collector_size = 4").unwrap();

        let settings = EngineSettings::load(file.path()).unwrap();
        assert_eq!(settings.max_collector_size, 4);
    }

    #[test]
    fn test_load_rejects_unknown_format() {
        let file = NamedTempFile::new().unwrap();
        let err = EngineSettings::load(file.path()).unwrap_err();
        assert!(matches!(err, MapReduceError::SettingsLoadFailed { .. }));
    }
}
