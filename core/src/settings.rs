//! Session settings
//!
//! JSON-serialisable configuration for a [`crate::BleSession`], validated
//! on every load and save.

use crate::codec::normalize_uuid;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Session behaviour knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Scan length; the radio stops the scan on its own afterwards
    pub scan_duration_secs: u64,

    /// Report repeated advertisements from the same device
    pub allow_duplicates: bool,

    /// Service UUIDs to filter scans on (short forms allowed)
    pub service_filters: Vec<String>,

    /// Treat outgoing text as hex and wrap it in the FEFD..FCFB frame
    pub frame_outgoing: bool,

    /// Start scanning as soon as the radio reports power on
    pub auto_scan_on_power_on: bool,

    /// Capacity of the session event channel
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scan_duration_secs: 5,
            allow_duplicates: true,
            service_filters: Vec::new(),
            frame_outgoing: false,
            auto_scan_on_power_on: true,
            event_buffer: 64,
        }
    }
}

impl SessionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.scan_duration_secs == 0 {
            return Err(SettingsError::ConfigError(
                "scan_duration_secs must be at least 1".to_string(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(SettingsError::ConfigError(
                "event_buffer must be at least 1".to_string(),
            ));
        }

        if let Some(bad) = self.service_filters.iter().find(|f| f.trim().is_empty()) {
            return Err(SettingsError::ConfigError(format!(
                "service filter {:?} is empty",
                bad
            )));
        }

        Ok(())
    }

    /// Scan filters expanded to full 128-bit form
    pub fn normalized_filters(&self) -> Vec<String> {
        self.service_filters
            .iter()
            .map(|f| normalize_uuid(f.trim()))
            .collect()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_string(&content)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        let json = self.to_json_string()?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String, SettingsError> {
        self.validate()?;
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_string(json: &str) -> Result<Self, SettingsError> {
        let settings: SessionSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = SessionSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scan_duration_secs, 5);
        assert!(settings.allow_duplicates);
        assert!(settings.auto_scan_on_power_on);
    }

    #[test]
    fn test_zero_scan_duration_rejected() {
        let settings = SessionSettings {
            scan_duration_secs: 0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(SettingsError::ConfigError(_))));
    }

    #[test]
    fn test_blank_filter_rejected() {
        let settings = SessionSettings {
            service_filters: vec!["  ".to_string()],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_filters_normalised() {
        let settings = SessionSettings {
            service_filters: vec!["fff0".to_string()],
            ..Default::default()
        };
        assert_eq!(
            settings.normalized_filters(),
            vec!["0000FFF0-0000-1000-8000-00805F9B34FB".to_string()]
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = SessionSettings::from_json_string(r#"{"frame_outgoing": true}"#).unwrap();
        assert!(settings.frame_outgoing);
        assert_eq!(settings.scan_duration_secs, 5);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(matches!(
            SessionSettings::from_json_string(r#"{"scan_duration_secs": 0}"#),
            Err(SettingsError::ConfigError(_))
        ));
        assert!(matches!(
            SessionSettings::from_json_string("not json"),
            Err(SettingsError::JsonError(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let settings = SessionSettings {
            scan_duration_secs: 10,
            service_filters: vec!["ffe0".to_string()],
            ..Default::default()
        };
        settings.save(&path).unwrap();

        let loaded = SessionSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }
}
