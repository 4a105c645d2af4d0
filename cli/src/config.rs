// Configuration management for the gattlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/gattlink/config.json
// - Linux: ~/.config/gattlink/config.json
// - Windows: %APPDATA%\gattlink\config.json

use anyhow::{Context, Result};
use gattlink_core::SessionSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session behaviour shared with the core
    pub session: SessionSettings,

    /// Which local Bluetooth adapter to use
    pub adapter_index: usize,

    /// Upper bound for a single radio request, in seconds
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            adapter_index: 0,
            request_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("gattlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.session
            .validate()
            .context("Invalid session settings")?;
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Set a config value in memory; call `save` to persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut next = self.clone();
        match key {
            "scan_duration_secs" => {
                next.session.scan_duration_secs = value.parse().context("Invalid number")?;
            }
            "allow_duplicates" => {
                next.session.allow_duplicates = value.parse().context("Invalid boolean value")?;
            }
            "service_filters" => {
                next.session.service_filters = value
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "frame_outgoing" => {
                next.session.frame_outgoing = value.parse().context("Invalid boolean value")?;
            }
            "auto_scan_on_power_on" => {
                next.session.auto_scan_on_power_on =
                    value.parse().context("Invalid boolean value")?;
            }
            "event_buffer" => {
                next.session.event_buffer = value.parse().context("Invalid number")?;
            }
            "adapter_index" => {
                next.adapter_index = value.parse().context("Invalid number")?;
            }
            "request_timeout_secs" => {
                next.request_timeout_secs = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let filters = if self.session.service_filters.is_empty() {
            "(none)".to_string()
        } else {
            self.session.service_filters.join(",")
        };
        vec![
            ("scan_duration_secs".to_string(), self.session.scan_duration_secs.to_string()),
            ("allow_duplicates".to_string(), self.session.allow_duplicates.to_string()),
            ("service_filters".to_string(), filters),
            ("frame_outgoing".to_string(), self.session.frame_outgoing.to_string()),
            (
                "auto_scan_on_power_on".to_string(),
                self.session.auto_scan_on_power_on.to_string(),
            ),
            ("event_buffer".to_string(), self.session.event_buffer.to_string()),
            ("adapter_index".to_string(), self.adapter_index.to_string()),
            ("request_timeout_secs".to_string(), self.request_timeout_secs.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.adapter_index, 0);
        assert_eq!(config.session.scan_duration_secs, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_set_and_get() {
        let mut config = Config::default();
        config.set("service_filters", "fff0, 180d").unwrap();
        config.set("frame_outgoing", "true").unwrap();

        assert_eq!(config.session.service_filters, vec!["fff0", "180d"]);
        assert_eq!(config.get("frame_outgoing").as_deref(), Some("true"));
        assert_eq!(config.get("service_filters").as_deref(), Some("fff0,180d"));
        assert!(config.get("nope").is_none());
    }

    #[test]
    fn test_invalid_values_leave_config_untouched() {
        let mut config = Config::default();
        assert!(config.set("scan_duration_secs", "0").is_err());
        assert!(config.set("request_timeout_secs", "soon").is_err());
        assert!(config.set("listen_port", "1").is_err());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_creates_default_then_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, Config::default());

        let mut config = created;
        config.set("adapter_index", "1").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.adapter_index, 1);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"session": {"frame_outgoing": true}}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.session.frame_outgoing);
        assert_eq!(config.request_timeout_secs, 10);
    }
}
