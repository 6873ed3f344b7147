use std::path::Path;

use serde::{Deserialize, Serialize};

use dupvault_types::block_hash::BlockHash;
use dupvault_types::error::Result;

use super::{read_manifest, write_manifest, ClosedManifestVolume};

pub const FILESET_VOLUME_MAGIC: &[u8; 8] = b"DVLIST\0\0";

/// How to find one stream's content: a single block, or blocklist hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    pub hash: BlockHash,
    pub size: u64,
    /// Set when the stream is exactly one block.
    pub block_hash: Option<BlockHash>,
    pub blocklist_hashes: Vec<BlockHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetEntry {
    pub path: String,
    pub content: ContentRef,
    pub metadata: Option<ContentRef>,
}

/// The per-run file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetManifest {
    /// Unix seconds of the run this fileset describes.
    pub timestamp: i64,
    pub blocksize: u64,
    pub entries: Vec<FilesetEntry>,
}

impl FilesetManifest {
    pub fn write(&self, dir: &Path, name: String) -> Result<ClosedManifestVolume> {
        let (path, size) = write_manifest(dir, "dupvault-dlist-", FILESET_VOLUME_MAGIC, self)?;
        Ok(ClosedManifestVolume { name, path, size })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        read_manifest(FILESET_VOLUME_MAGIC, data)
    }
}
