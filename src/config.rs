use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// How often the harvester drains the active delta. Default: 5s,
    /// minimum 1ms.
    #[serde(default = "default_harvest_interval", with = "humantime_serde")]
    pub harvest_interval: Duration,

    /// Route records through the buffered delta pipeline. When false,
    /// records dispatch synchronously into the view store with per-event
    /// timestamps. Default: true.
    #[serde(default = "default_true")]
    pub enable_delta_path: bool,
}

// --- Default value functions ---

fn default_harvest_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            harvest_interval: default_harvest_interval(),
            enable_delta_path: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: EngineConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.harvest_interval < Duration::from_millis(1) {
            return Err(Error::InvalidConfig(format!(
                "harvest_interval must be at least 1ms, got {:?}",
                self.harvest_interval
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.harvest_interval, Duration::from_secs(5));
        assert!(cfg.enable_delta_path);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_sub_millisecond_interval() {
        let cfg = EngineConfig {
            harvest_interval: Duration::from_micros(500),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("harvest_interval"));
    }

    #[test]
    fn test_load_from_yaml() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "harvest_interval: 250ms").expect("write");
        writeln!(file, "enable_delta_path: false").expect("write");

        let cfg = EngineConfig::load(file.path()).expect("load");
        assert_eq!(cfg.harvest_interval, Duration::from_millis(250));
        assert!(!cfg.enable_delta_path);
    }

    #[test]
    fn test_load_applies_defaults_for_missing_fields() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "{{}}").expect("write");

        let cfg = EngineConfig::load(file.path()).expect("load");
        assert_eq!(cfg.harvest_interval, Duration::from_secs(5));
        assert!(cfg.enable_delta_path);
    }

    #[test]
    fn test_load_rejects_invalid_interval() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "harvest_interval: 10us").expect("write");

        assert!(EngineConfig::load(file.path()).is_err());
    }
}
