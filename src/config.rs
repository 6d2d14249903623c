// =============================================================================
// Global Settings — hot-reloadable engine-wide defaults with atomic save
// =============================================================================
//
// Same shape as the teacher's `runtime_config.rs`: every field carries a
// `#[serde(default = "...")]` so older settings files deserialize forward
// compatibly, and persistence uses the tmp-then-rename atomic write pattern.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::record::{
    BID_BUFFER_MAX, BID_BUFFER_MIN, RETRY_ATTEMPTS_MAX, RETRY_ATTEMPTS_MIN, SNIPE_TIMING_MAX,
    SNIPE_TIMING_MIN,
};

fn default_snipe_timing() -> u64 {
    30
}

fn default_bid_buffer() -> u64 {
    0
}

fn default_retry_attempts() -> u32 {
    3
}

/// Engine-wide defaults (§3 "Global settings").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Seconds-remaining threshold under which a `sniping` strategy may bid.
    #[serde(default = "default_snipe_timing")]
    pub snipe_timing: u64,

    /// Flat amount added on top of the computed candidate bid.
    #[serde(default = "default_bid_buffer")]
    pub bid_buffer: u64,

    /// Maximum bounded retries for a transport/infra failure (§4.6).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            snipe_timing: default_snipe_timing(),
            bid_buffer: default_bid_buffer(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

impl GlobalSettings {
    pub fn validate(&self) -> Result<()> {
        if self.snipe_timing < SNIPE_TIMING_MIN || self.snipe_timing > SNIPE_TIMING_MAX {
            anyhow::bail!(
                "snipe_timing {} out of range [{}, {}]",
                self.snipe_timing,
                SNIPE_TIMING_MIN,
                SNIPE_TIMING_MAX
            );
        }
        if self.bid_buffer < BID_BUFFER_MIN || self.bid_buffer > BID_BUFFER_MAX {
            anyhow::bail!(
                "bid_buffer {} out of range [{}, {}]",
                self.bid_buffer,
                BID_BUFFER_MIN,
                BID_BUFFER_MAX
            );
        }
        if self.retry_attempts < RETRY_ATTEMPTS_MIN || self.retry_attempts > RETRY_ATTEMPTS_MAX {
            anyhow::bail!(
                "retry_attempts {} out of range [{}, {}]",
                self.retry_attempts,
                RETRY_ATTEMPTS_MIN,
                RETRY_ATTEMPTS_MAX
            );
        }
        Ok(())
    }

    /// Load settings from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning, matching the teacher's convention.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        settings.validate()?;

        info!(
            path = %path.display(),
            snipe_timing = settings.snipe_timing,
            bid_buffer = settings.bid_buffer,
            retry_attempts = settings.retry_attempts,
            "global settings loaded"
        );

        Ok(settings)
    }

    /// Persist settings using an atomic write (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.validate()?;

        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize global settings")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "global settings saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_match_spec() {
        let settings = GlobalSettings::default();
        assert_eq!(settings.snipe_timing, 30);
        assert_eq!(settings.bid_buffer, 0);
        assert_eq!(settings.retry_attempts, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_snipe_timing() {
        let settings = GlobalSettings {
            snipe_timing: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn round_trips_through_disk_atomically() {
        let dir = std::env::temp_dir().join(format!("auction-sentinel-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");

        let settings = GlobalSettings {
            snipe_timing: 15,
            bid_buffer: 10,
            retry_attempts: 5,
        };
        settings.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = GlobalSettings::load(&path).unwrap();
        assert_eq!(loaded.snipe_timing, 15);
        assert_eq!(loaded.bid_buffer, 10);
        assert_eq!(loaded.retry_attempts, 5);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("auction-sentinel-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        fs::write(&path, "{}").unwrap();

        let loaded = GlobalSettings::load(&path).unwrap();
        assert_eq!(loaded.snipe_timing, 30);
        assert_eq!(loaded.retry_attempts, 3);

        fs::remove_dir_all(&dir).ok();
    }
}
