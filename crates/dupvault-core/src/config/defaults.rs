use dupvault_types::block_hash::HashAlgorithm;

use super::types::{CompressionAlgorithm, EncryptionMode, IndexPolicy};

pub(super) fn default_blocksize() -> usize {
    100 * 1024 // 100 KiB
}

pub(super) fn default_volume_size() -> u64 {
    50 * 1024 * 1024 // 50 MiB
}

pub(super) fn default_hash() -> HashAlgorithm {
    HashAlgorithm::Sha256
}

pub(super) fn default_index_policy() -> IndexPolicy {
    IndexPolicy::Full
}

pub(super) fn default_compression() -> CompressionAlgorithm {
    CompressionAlgorithm::Zstd
}

pub(super) fn default_zstd_level() -> i32 {
    3
}

pub(super) fn default_noncompressible_extensions() -> Vec<String> {
    [
        "7z", "zip", "gz", "bz2", "xz", "zst", "lz4", "rar", "jpg", "jpeg", "png", "gif", "webp",
        "mp3", "mp4", "mkv", "avi", "mov", "flac", "ogg", "docx", "xlsx", "pptx",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub(super) fn default_number_of_retries() -> usize {
    5
}

pub(super) fn default_retry_delay_ms() -> u64 {
    10_000
}

pub(super) fn default_true() -> bool {
    true
}

pub(super) fn default_async_upload_limit() -> usize {
    4
}

pub(super) fn default_prefix() -> String {
    "dupvault".to_string()
}

pub(super) fn default_workers() -> usize {
    2
}

pub(super) fn default_channel_depth() -> usize {
    4
}

pub(super) fn default_cpu_intensity() -> u8 {
    10
}

pub(super) fn default_encryption_mode() -> EncryptionMode {
    EncryptionMode::None
}
