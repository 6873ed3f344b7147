use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use dupvault_types::block_hash::BlockHash;
use dupvault_types::error::Result;
use dupvault_types::ids::VolumeId;

use super::{read_manifest, write_manifest, ClosedManifestVolume};

pub const INDEX_VOLUME_MAGIC: &[u8; 8] = b"DVINDEX\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexedBlock {
    pub hash: BlockHash,
    pub size: u64,
}

/// A blocklist block carried verbatim so block lists can be rebuilt from
/// index volumes alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocklistBlock {
    pub hash: BlockHash,
    pub data: Vec<u8>,
}

/// Contents of an uploaded index volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub volume_name: String,
    pub volume_hash: BlockHash,
    pub volume_size: u64,
    pub blocks: Vec<IndexedBlock>,
    pub blocklists: Vec<BlocklistBlock>,
}

impl IndexManifest {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        read_manifest(INDEX_VOLUME_MAGIC, data)
    }
}

/// Index volume under construction, paired with one open block volume.
///
/// The manifest is only written once the block volume's final name, hash and
/// size are known, just before the index upload.
#[derive(Debug)]
pub struct PendingIndex {
    pub name: String,
    pub id: VolumeId,
    blocks: Vec<IndexedBlock>,
    blocklists: Vec<BlocklistBlock>,
    blocklist_hashes: HashSet<BlockHash>,
}

impl PendingIndex {
    pub fn new(name: String, id: VolumeId) -> Self {
        Self {
            name,
            id,
            blocks: Vec::new(),
            blocklists: Vec::new(),
            blocklist_hashes: HashSet::new(),
        }
    }

    pub fn add_block(&mut self, hash: BlockHash, size: u64) {
        self.blocks.push(IndexedBlock { hash, size });
    }

    /// Record a blocklist block; repeats within this index are ignored.
    pub fn add_blocklist(&mut self, hash: BlockHash, data: &[u8]) {
        if self.blocklist_hashes.insert(hash) {
            self.blocklists.push(BlocklistBlock {
                hash,
                data: data.to_vec(),
            });
        }
    }

    /// Carry over every blocklist entry of `other`.
    pub fn copy_blocklists_from(&mut self, other: &PendingIndex) {
        for bl in &other.blocklists {
            self.add_blocklist(bl.hash, &bl.data);
        }
    }

    pub fn blocks(&self) -> &[IndexedBlock] {
        &self.blocks
    }

    pub fn blocklists(&self) -> &[BlocklistBlock] {
        &self.blocklists
    }

    pub fn has_blocklists(&self) -> bool {
        !self.blocklists.is_empty()
    }

    /// Write the manifest for the block volume it describes.
    pub fn materialize(
        &self,
        dir: &Path,
        volume_name: &str,
        volume_hash: BlockHash,
        volume_size: u64,
    ) -> Result<ClosedManifestVolume> {
        let manifest = IndexManifest {
            volume_name: volume_name.to_string(),
            volume_hash,
            volume_size,
            blocks: self.blocks.clone(),
            blocklists: self.blocklists.clone(),
        };
        let (path, size) = write_manifest(dir, "dupvault-dindex-", INDEX_VOLUME_MAGIC, &manifest)?;
        Ok(ClosedManifestVolume {
            name: self.name.clone(),
            path,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dupvault_types::block_hash::HashAlgorithm;

    fn h(data: &[u8]) -> BlockHash {
        BlockHash::compute(HashAlgorithm::Sha256, data)
    }

    #[test]
    fn blocklists_are_unique_per_index() {
        let mut idx = PendingIndex::new("i".into(), VolumeId(1));
        idx.add_blocklist(h(b"bl"), b"bl");
        idx.add_blocklist(h(b"bl"), b"bl");
        assert_eq!(idx.blocklists().len(), 1);

        let mut other = PendingIndex::new("j".into(), VolumeId(2));
        other.add_blocklist(h(b"bl"), b"bl");
        other.add_blocklist(h(b"bl2"), b"bl2");
        idx.copy_blocklists_from(&other);
        assert_eq!(idx.blocklists().len(), 2);
    }

    #[test]
    fn materialized_manifest_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = PendingIndex::new("dupvault-x.dindex.zstd".into(), VolumeId(7));
        idx.add_block(h(b"a"), 1);
        idx.add_blocklist(h(b"list"), b"list");

        let closed = idx
            .materialize(dir.path(), "dupvault-y.dblock.zstd", h(b"vol"), 123)
            .unwrap();
        assert_eq!(closed.name, "dupvault-x.dindex.zstd");
        let bytes = std::fs::read(&closed.path).unwrap();
        assert_eq!(bytes.len() as u64, closed.size);

        let manifest = IndexManifest::from_bytes(&bytes).unwrap();
        assert_eq!(manifest.volume_name, "dupvault-y.dblock.zstd");
        assert_eq!(manifest.volume_size, 123);
        assert_eq!(manifest.blocks, vec![IndexedBlock { hash: h(b"a"), size: 1 }]);
        assert_eq!(manifest.blocklists[0].data, b"list");
    }
}
