/// Service configuration
///
/// JSON config file plus environment overrides, read once at startup.

use crate::audio_source::CaptureConfig;
use crate::monitor::DispatchConfig;
use crate::recognition::RecognizerConfig;
use crate::vad::VadConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_PATH_VAR: &str = "DISTRESS_MONITOR_CONFIG";
pub const RECOGNIZER_URL_VAR: &str = "DISTRESS_RECOGNIZER_URL";
pub const VOICE_THRESHOLD_VAR: &str = "DISTRESS_VOICE_THRESHOLD";
pub const SILENCE_MS_VAR: &str = "DISTRESS_SILENCE_MS";
pub const MAX_SEGMENT_MS_VAR: &str = "DISTRESS_MAX_SEGMENT_MS";
pub const USER_ID_VAR: &str = "DISTRESS_USER_ID";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

/// Full service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub vad: VadConfig,
    pub capture: CaptureConfig,
    pub dispatch: DispatchConfig,
    pub recognizer: RecognizerConfig,
}

impl MonitorConfig {
    /// Load a JSON config file; missing sections take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;

        debug!("Loaded configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Config file named by `DISTRESS_MONITOR_CONFIG`, then env overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => {
                info!("{} not set, using default configuration", CONFIG_PATH_VAR);
                Self::default()
            }
        };

        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (environment variable name -> value)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(RECOGNIZER_URL_VAR) {
            self.recognizer.base_url = url;
        }
        if let Some(threshold) = parse_var(&lookup, VOICE_THRESHOLD_VAR)? {
            self.vad.amplitude_threshold = threshold;
        }
        if let Some(silence) = parse_var(&lookup, SILENCE_MS_VAR)? {
            self.vad.silence_duration_ms = silence;
        }
        if let Some(max_segment) = parse_var(&lookup, MAX_SEGMENT_MS_VAR)? {
            self.vad.max_segment_duration_ms = max_segment;
        }
        if let Some(user_id) = parse_var(&lookup, USER_ID_VAR)? {
            self.recognizer.user_id = Some(user_id);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.vad
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.capture.validate().map_err(ConfigError::Invalid)?;
        self.dispatch.validate().map_err(ConfigError::Invalid)?;
        self.recognizer.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.max_in_flight, 3);
        assert_eq!(config.vad.max_segment_duration_ms, 15000);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "vad": {{ "silence_duration_ms": 1500 }}, "recognizer": {{ "base_url": "https://api.example.org" }} }}"#
        )
        .unwrap();

        let config = MonitorConfig::from_file(file.path()).unwrap();
        assert_eq!(config.vad.silence_duration_ms, 1500);
        assert_eq!(config.vad.amplitude_threshold, 500.0);
        assert_eq!(config.recognizer.base_url, "https://api.example.org");
        assert_eq!(config.capture, CaptureConfig::default());
    }

    #[test]
    fn test_invalid_file_contents() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(MonitorConfig::from_file(file.path()), Err(ConfigError::Parse(_))));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "dispatch": {{ "queue_capacity": 0 }} }}"#).unwrap();
        assert!(matches!(MonitorConfig::from_file(file.path()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = MonitorConfig::from_file(dir.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MonitorConfig::default();
        config
            .apply_overrides(lookup(&[
                (RECOGNIZER_URL_VAR, "https://recognizer.local"),
                (VOICE_THRESHOLD_VAR, "750.5"),
                (SILENCE_MS_VAR, " 2500 "),
                (USER_ID_VAR, "42"),
            ]))
            .unwrap();

        assert_eq!(config.recognizer.base_url, "https://recognizer.local");
        assert_eq!(config.vad.amplitude_threshold, 750.5);
        assert_eq!(config.vad.silence_duration_ms, 2500);
        assert_eq!(config.vad.max_segment_duration_ms, 15000);
        assert_eq!(config.recognizer.user_id, Some(42));
    }

    #[test]
    fn test_bad_override_names_variable() {
        let mut config = MonitorConfig::default();
        let err = config
            .apply_overrides(lookup(&[(MAX_SEGMENT_MS_VAR, "fifteen")]))
            .unwrap_err();

        match err {
            ConfigError::Env { var, value } => {
                assert_eq!(var, MAX_SEGMENT_MS_VAR);
                assert_eq!(value, "fifteen");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
