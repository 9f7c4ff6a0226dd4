use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct HostConfig {
    #[serde(default)]
    pub units: UnitsConfig,
    #[serde(default)]
    pub reclamation: ReclamationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitsConfig {
    /// Directory holding `<name>.<platform extension>` units
    #[serde(default = "default_units_dir")]
    pub directory: PathBuf,

    /// Units loaded at startup, in order
    #[serde(default)]
    pub autoload: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReclamationConfig {
    /// Period of the background reclamation sweep
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// How long `reload` waits for the previous incarnation to be reclaimed
    #[serde(default = "default_reload_wait_ms")]
    pub reload_wait_ms: u64,

    /// How long shutdown waits for module finalizers
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `tracing` filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Buffered registry log entries per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

// Default value functions
fn default_units_dir() -> PathBuf {
    PathBuf::from("units")
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

fn default_reload_wait_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_capacity() -> usize {
    crate::registry::DEFAULT_EVENT_CAPACITY
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            directory: default_units_dir(),
            autoload: Vec::new(),
        }
    }
}

impl Default for ReclamationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            reload_wait_ms: default_reload_wait_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl ReclamationConfig {
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    #[must_use]
    pub fn reload_wait(&self) -> Duration {
        Duration::from_millis(self.reload_wait_ms)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl HostConfig {
    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: HostConfig =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;

        Ok(home.join(".cogworks").join("config.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.units.directory, PathBuf::from("units"));
        assert!(config.units.autoload.is_empty());
        assert_eq!(config.reclamation.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
units:
  directory: /srv/bot/units
  autoload: [alpha, beta]
reclamation:
  sweep_interval_ms: 250
"#;
        let config: HostConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.units.directory, PathBuf::from("/srv/bot/units"));
        assert_eq!(config.units.autoload, vec!["alpha", "beta"]);
        assert_eq!(config.reclamation.sweep_interval_ms, 250);
        assert_eq!(config.reclamation.shutdown_grace_ms, 10_000);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_zero_sweep_interval_is_clamped() {
        let config = ReclamationConfig {
            sweep_interval_ms: 0,
            ..ReclamationConfig::default()
        };
        assert_eq!(config.sweep_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = HostConfig::default();
        config.units.autoload.push("alpha".to_string());
        config.logging.level = "debug".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = HostConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
