use serde::{Deserialize, Serialize};

use dupvault_types::error::{DupError, Result};

use super::defaults::*;

/// Highest `cpu_intensity`; disables CPU self-throttling.
pub const CPU_INTENSITY_UNLIMITED: u8 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Packer CPU budget in tenths of a second per second (1-10, 10 = off).
    #[serde(default = "default_cpu_intensity")]
    pub cpu_intensity: u8,
    /// Upload rate limit in MiB/s (0 = unlimited). Live-tunable at runtime.
    #[serde(default)]
    pub max_upload_mib_per_sec: u64,
    /// Read rate limit in MiB/s for upload sources (0 = unlimited).
    #[serde(default)]
    pub max_download_mib_per_sec: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cpu_intensity: default_cpu_intensity(),
            max_upload_mib_per_sec: 0,
            max_download_mib_per_sec: 0,
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=CPU_INTENSITY_UNLIMITED).contains(&self.cpu_intensity) {
            return Err(DupError::Config(format!(
                "limits.cpu_intensity must be in [1, {CPU_INTENSITY_UNLIMITED}], got {}",
                self.cpu_intensity
            )));
        }
        Ok(())
    }

    pub fn upload_bytes_per_sec(&self) -> u64 {
        self.max_upload_mib_per_sec.saturating_mul(1024 * 1024)
    }

    pub fn download_bytes_per_sec(&self) -> u64 {
        self.max_download_mib_per_sec.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Threads feeding source entries into the chunkers.
    #[serde(default = "default_workers")]
    pub file_processors: usize,
    /// Chunker/hasher worker threads.
    #[serde(default = "default_workers")]
    pub block_hashers: usize,
    /// Packer worker threads; each holds at most one open volume.
    #[serde(default = "default_workers")]
    pub compressors: usize,
    /// Capacity of every bounded channel between stages.
    #[serde(default = "default_channel_depth")]
    pub channel_depth: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            file_processors: default_workers(),
            block_hashers: default_workers(),
            compressors: default_workers(),
            channel_depth: default_channel_depth(),
        }
    }
}

impl ConcurrencyConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("file_processors", self.file_processors),
            ("block_hashers", self.block_hashers),
            ("compressors", self.compressors),
        ] {
            if !(1..=64).contains(&value) {
                return Err(DupError::Config(format!(
                    "concurrency.{name} must be in [1, 64], got {value}"
                )));
            }
        }
        if !(1..=1024).contains(&self.channel_depth) {
            return Err(DupError::Config(format!(
                "concurrency.channel_depth must be in [1, 1024], got {}",
                self.channel_depth
            )));
        }
        Ok(())
    }
}
