use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dupvault_types::block_hash::{HashAlgorithm, HASH_SIZE};
use dupvault_types::error::{DupError, Result};

use super::defaults::*;
use super::limits::{ConcurrencyConfig, LimitsConfig};

/// Immutable settings for one backup run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub blocks: BlocksConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Directory for volume temp files. Default: the system temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Skip uploading a synthetic fileset for an interrupted previous run.
    #[serde(default)]
    pub disable_synthetic_filelist: bool,
}

impl BackupConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: BackupConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.blocks.validate()?;
        self.upload.validate()?;
        self.concurrency.validate()?;
        self.limits.validate()?;
        self.encryption.validate()
    }

    /// Temp directory for volume files.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Compression module name embedded in remote filenames.
    pub fn compression_module(&self) -> &'static str {
        self.blocks.compression.algorithm.as_str()
    }

    /// Encryption module name embedded in remote filenames, if any.
    pub fn encryption_module(&self) -> Option<&'static str> {
        self.encryption.mode.module_name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexPolicy {
    /// No index volumes.
    None,
    /// Index volumes list (hash, size) of every block.
    Lookup,
    /// Index volumes also carry the blocklist blocks.
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksConfig {
    #[serde(default = "default_blocksize")]
    pub blocksize: usize,
    #[serde(default = "default_volume_size")]
    pub volume_size: u64,
    #[serde(default = "default_hash")]
    pub block_hash: HashAlgorithm,
    #[serde(default = "default_hash")]
    pub file_hash: HashAlgorithm,
    #[serde(default = "default_index_policy")]
    pub index_policy: IndexPolicy,
    #[serde(default)]
    pub compression: CompressionConfig,
    /// File extensions (without dot, case-insensitive) stored uncompressed.
    #[serde(default = "default_noncompressible_extensions")]
    pub noncompressible_extensions: Vec<String>,
}

impl Default for BlocksConfig {
    fn default() -> Self {
        Self {
            blocksize: default_blocksize(),
            volume_size: default_volume_size(),
            block_hash: default_hash(),
            file_hash: default_hash(),
            index_policy: default_index_policy(),
            compression: CompressionConfig::default(),
            noncompressible_extensions: default_noncompressible_extensions(),
        }
    }
}

impl BlocksConfig {
    fn validate(&self) -> Result<()> {
        if self.blocksize < 2 * HASH_SIZE {
            return Err(DupError::Config(format!(
                "blocks.blocksize must be at least {}, got {}",
                2 * HASH_SIZE,
                self.blocksize
            )));
        }
        if self.volume_size <= self.blocksize as u64 {
            return Err(DupError::Config(format!(
                "blocks.volume_size ({}) must exceed blocks.blocksize ({})",
                self.volume_size, self.blocksize
            )));
        }
        if !(1..=22).contains(&self.compression.zstd_level) {
            return Err(DupError::Config(format!(
                "blocks.compression.zstd_level must be in [1, 22], got {}",
                self.compression.zstd_level
            )));
        }
        Ok(())
    }

    /// Number of block hashes one blocklist block holds.
    pub fn hashes_per_blocklist(&self) -> usize {
        self.blocksize / self.block_hash.hash_size()
    }

    /// Largest metadata blob addressable through a single blocklist.
    pub fn max_metadata_size(&self) -> usize {
        self.hashes_per_blocklist() * self.blocksize
    }

    /// Volumes close once their size exceeds this.
    pub fn volume_close_threshold(&self) -> u64 {
        self.volume_size - self.blocksize as u64
    }

    pub fn is_noncompressible(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.noncompressible_extensions
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_compression")]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_compression(),
            zstd_level: default_zstd_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Retries after the first failed attempt (attempts = retries + 1).
    #[serde(default = "default_number_of_retries")]
    pub number_of_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub autocreate_folders: bool,
    /// Drop the backend connection after every attempt.
    #[serde(default)]
    pub no_connection_reuse: bool,
    /// Re-list the target after each upload and check name and size.
    #[serde(default)]
    pub list_verify_uploads: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Max in-flight upload weight (0 = unbounded).
    #[serde(default = "default_async_upload_limit")]
    pub async_upload_limit: usize,
    #[serde(default)]
    pub disable_streaming_transfers: bool,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            number_of_retries: default_number_of_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            autocreate_folders: default_true(),
            no_connection_reuse: false,
            list_verify_uploads: false,
            dry_run: false,
            async_upload_limit: default_async_upload_limit(),
            disable_streaming_transfers: false,
            prefix: default_prefix(),
        }
    }
}

impl UploadConfig {
    fn validate(&self) -> Result<()> {
        let prefix_ok = !self.prefix.is_empty()
            && self
                .prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !prefix_ok {
            return Err(DupError::Config(format!(
                "upload.prefix must be non-empty [A-Za-z0-9_-], got '{}'",
                self.prefix
            )));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    None,
    Aes,
}

impl EncryptionMode {
    pub fn module_name(self) -> Option<&'static str> {
        match self {
            EncryptionMode::None => None,
            EncryptionMode::Aes => Some("aes"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default = "default_encryption_mode")]
    pub mode: EncryptionMode,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            mode: default_encryption_mode(),
            passphrase: None,
        }
    }
}

impl EncryptionConfig {
    fn validate(&self) -> Result<()> {
        if self.mode == EncryptionMode::Aes
            && self.passphrase.as_deref().map_or(true, str::is_empty)
        {
            return Err(DupError::Config(
                "encryption.passphrase is required when encryption.mode is 'aes'".into(),
            ));
        }
        Ok(())
    }
}
