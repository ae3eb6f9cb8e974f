// THEORY:
// A `RigConfig` describes one rig: where it sits, which detector profile it
// uses and how its session paces itself. It loads from a JSON file in which
// every field is optional, so a file only needs to name what differs from the
// defaults. The runner layers its command-line flags on top, and `validate`
// runs once before a session starts so a bad value fails at start-up rather
// than mid-cycle.

use crate::core_modules::visual_detector::{DetectorProfile, DEFAULT_RIG_TYPE};
use crate::protocol::RigId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown rig type {0}")]
    UnknownRigType(usize),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a rig session needs to know about its rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub namespace: String,
    pub rig_id: String,
    /// Index into the built-in detector profiles.
    pub rig_type: usize,
    pub site: String,
    pub location: String,
    /// Replaces the built-in profile for `rig_type` when present.
    pub detector: Option<DetectorProfile>,
    pub tick_interval_ms: u64,
    pub status_period_secs: u64,
    pub auto_restart: bool,
    pub restart_delay_ms: u64,
    /// Paces recorded sources to roughly real time. Live sources pace themselves.
    pub frame_interval_ms: Option<u64>,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            namespace: "tester".into(),
            rig_id: "vid1".into(),
            rig_type: DEFAULT_RIG_TYPE,
            site: String::new(),
            location: String::new(),
            detector: None,
            tick_interval_ms: 1000,
            status_period_secs: 300,
            auto_restart: true,
            restart_delay_ms: 2000,
            frame_interval_ms: None,
        }
    }
}

impl RigConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn rig(&self) -> Result<RigId, ConfigError> {
        RigId::new(self.rig_id.as_str()).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// The override if one is set, otherwise the built-in profile for the rig type.
    pub fn profile(&self) -> Result<DetectorProfile, ConfigError> {
        match &self.detector {
            Some(profile) => Ok(profile.clone()),
            None => DetectorProfile::for_rig_type(self.rig_type).ok_or(ConfigError::UnknownRigType(self.rig_type)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() || self.namespace.contains(['.', '*']) {
            return Err(ConfigError::Invalid(format!("namespace `{}`", self.namespace)));
        }
        self.rig()?;
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick interval must be positive".into()));
        }
        if self.status_period_secs == 0 {
            return Err(ConfigError::Invalid("status period must be positive".into()));
        }
        let profile = self.profile()?;
        if profile.minor_ratio >= profile.pointer_ratio {
            return Err(ConfigError::Invalid(format!(
                "interaction band {}..{} is empty",
                profile.minor_ratio, profile.pointer_ratio
            )));
        }
        if !(profile.dwell_window_secs.is_finite() && profile.dwell_window_secs >= 0.0) {
            return Err(ConfigError::Invalid("dwell window must be a non-negative number".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn status_period(&self) -> Duration {
        Duration::from_secs(self.status_period_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn frame_interval(&self) -> Option<Duration> {
        self.frame_interval_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RigConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.profile().expect("known type").threshold, 100);
        assert_eq!(config.status_period(), Duration::from_secs(300));
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: RigConfig =
            serde_json::from_str(r#"{"rig_id": "vid7", "rig_type": 0, "detector": null}"#).expect("valid json");

        assert_eq!(config.rig_id, "vid7");
        assert_eq!(config.namespace, "tester");
        assert_eq!(config.profile().expect("known type").threshold, 150);
    }

    #[test]
    fn detector_override_replaces_builtin_profile() {
        let config: RigConfig =
            serde_json::from_str(r#"{"detector": {"threshold": 42, "dwell_window_secs": 1.5}}"#).expect("valid json");

        let profile = config.profile().expect("override present");
        assert_eq!(profile.threshold, 42);
        assert_eq!(profile.dwell_window(), Duration::from_millis(1500));
        assert_eq!(profile.min_region_area, 1000);
    }

    #[test]
    fn impossible_values_are_rejected() {
        let bad_id = RigConfig {
            rig_id: "a.b".into(),
            ..RigConfig::default()
        };
        let bad_type = RigConfig {
            rig_type: 9,
            ..RigConfig::default()
        };
        let zero_tick = RigConfig {
            tick_interval_ms: 0,
            ..RigConfig::default()
        };
        let inverted_band = RigConfig {
            detector: Some(DetectorProfile {
                minor_ratio: 0.01,
                pointer_ratio: 0.001,
                ..DetectorProfile::default()
            }),
            ..RigConfig::default()
        };

        assert!(matches!(bad_id.validate(), Err(ConfigError::Invalid(_))));
        assert!(matches!(bad_type.validate(), Err(ConfigError::UnknownRigType(9))));
        assert!(zero_tick.validate().is_err());
        assert!(inverted_band.validate().is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let error = RigConfig::load("/definitely/not/here.json").expect_err("missing file");

        assert!(error.to_string().contains("/definitely/not/here.json"));
    }
}
