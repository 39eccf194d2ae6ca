//! Configuration loading for markscan services
//!
//! Resolution priority per setting: environment variable (`MARKSCAN_*`) →
//! TOML config file → compiled default. The config file path itself comes
//! from `MARKSCAN_CONFIG`, falling back to `markscan.toml` in the working
//! directory when present.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP/WebSocket listen port
    pub port: u16,
    /// Root directory for checkpoint records, staged payloads and results
    pub data_dir: PathBuf,
    /// Base URL of the external detector service
    pub detector_url: String,
    /// Per-call deadline for the detector, in seconds
    pub detector_timeout_secs: u64,
    /// Items per chunk when the caller does not choose one
    pub default_chunk_size: usize,
    /// Seconds of subscriber silence before a connection is pruned
    pub heartbeat_timeout_secs: u64,
    /// Hours a recovery record survives after a subscriber is pruned
    pub recovery_max_age_hours: u64,
    /// Seconds a batch may sit idle before its ledger entry auto-expires
    pub batch_idle_expiry_secs: u64,
    /// Hours before a completed batch directory is swept from disk
    pub sweep_max_age_hours: u64,
    /// Hours before an abandoned checkpointed batch directory is swept
    pub sweep_pending_max_age_hours: u64,
    /// Seconds between background sweep passes
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5810,
            data_dir: PathBuf::from("markscan_data"),
            detector_url: "http://localhost:8001".to_string(),
            detector_timeout_secs: 60,
            default_chunk_size: 10,
            heartbeat_timeout_secs: 90,
            recovery_max_age_hours: 24,
            batch_idle_expiry_secs: 3600,
            sweep_max_age_hours: 24,
            sweep_pending_max_age_hours: 72,
            sweep_interval_secs: 3600,
        }
    }
}

impl Config {
    /// Load configuration with env → TOML → default resolution
    pub fn load() -> Result<Self> {
        let mut config = match config_file_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
    }

    /// Apply `MARKSCAN_*` environment overrides on top of file/default values
    fn apply_env(&mut self) {
        env_override("MARKSCAN_PORT", &mut self.port);
        env_override("MARKSCAN_DATA_DIR", &mut self.data_dir);
        env_override("MARKSCAN_DETECTOR_URL", &mut self.detector_url);
        env_override(
            "MARKSCAN_DETECTOR_TIMEOUT_SECS",
            &mut self.detector_timeout_secs,
        );
        env_override("MARKSCAN_DEFAULT_CHUNK_SIZE", &mut self.default_chunk_size);
        env_override(
            "MARKSCAN_HEARTBEAT_TIMEOUT_SECS",
            &mut self.heartbeat_timeout_secs,
        );
        env_override(
            "MARKSCAN_RECOVERY_MAX_AGE_HOURS",
            &mut self.recovery_max_age_hours,
        );
        env_override(
            "MARKSCAN_BATCH_IDLE_EXPIRY_SECS",
            &mut self.batch_idle_expiry_secs,
        );
        env_override("MARKSCAN_SWEEP_MAX_AGE_HOURS", &mut self.sweep_max_age_hours);
        env_override(
            "MARKSCAN_SWEEP_PENDING_MAX_AGE_HOURS",
            &mut self.sweep_pending_max_age_hours,
        );
        env_override("MARKSCAN_SWEEP_INTERVAL_SECS", &mut self.sweep_interval_secs);
    }

    fn validate(&self) -> Result<()> {
        if self.detector_url.trim().is_empty() {
            return Err(Error::Config("detector_url must not be empty".to_string()));
        }
        if self.default_chunk_size == 0 {
            return Err(Error::Config(
                "default_chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Overwrite `field` when the variable is set and parses; malformed values
/// keep the configured one
fn env_override<T: std::str::FromStr>(var: &str, field: &mut T) {
    if let Ok(value) = std::env::var(var) {
        if let Ok(value) = value.parse() {
            *field = value;
        }
    }
}

/// Resolve the config file path: `MARKSCAN_CONFIG` env var, else
/// `markscan.toml` in the working directory when it exists.
fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MARKSCAN_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from("markscan.toml");
    local.exists().then_some(local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_chunk_size, 10);
        assert_eq!(config.heartbeat_timeout_secs, 90);
        assert!(config.recovery_max_age_hours > config.heartbeat_timeout_secs / 3600);
    }

    #[test]
    fn test_from_file_partial_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("markscan.toml");
        std::fs::write(
            &path,
            "port = 9000\ndetector_url = \"http://detector:8001\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.detector_url, "http://detector:8001");
        // Unspecified fields keep their defaults
        assert_eq!(config.default_chunk_size, 10);
        assert_eq!(config.batch_idle_expiry_secs, 3600);
    }

    #[test]
    fn test_env_overrides_cover_tuning_settings() {
        std::env::set_var("MARKSCAN_DETECTOR_TIMEOUT_SECS", "15");
        std::env::set_var("MARKSCAN_DEFAULT_CHUNK_SIZE", "25");
        std::env::set_var("MARKSCAN_SWEEP_INTERVAL_SECS", "600");
        std::env::set_var("MARKSCAN_HEARTBEAT_TIMEOUT_SECS", "not-a-number");

        let mut config = Config::default();
        config.apply_env();

        std::env::remove_var("MARKSCAN_DETECTOR_TIMEOUT_SECS");
        std::env::remove_var("MARKSCAN_DEFAULT_CHUNK_SIZE");
        std::env::remove_var("MARKSCAN_SWEEP_INTERVAL_SECS");
        std::env::remove_var("MARKSCAN_HEARTBEAT_TIMEOUT_SECS");

        assert_eq!(config.detector_timeout_secs, 15);
        assert_eq!(config.default_chunk_size, 25);
        assert_eq!(config.sweep_interval_secs, 600);
        // Malformed values keep the configured value
        assert_eq!(config.heartbeat_timeout_secs, 90);
    }

    #[test]
    fn test_invalid_chunk_size_rejected() {
        let config = Config {
            default_chunk_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
