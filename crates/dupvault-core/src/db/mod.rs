//! Local database contract and its serialized actor.
//!
//! Every pipeline stage talks to the database through a [`DatabaseHandle`];
//! the actor thread applies operations one at a time.

pub mod actor;
pub mod memory;

use serde::{Deserialize, Serialize};

use dupvault_types::block_hash::BlockHash;
use dupvault_types::error::Result;
use dupvault_types::ids::{BlockId, BlocksetId, FilesetId, VolumeId};
use dupvault_types::volume_name::RemoteVolumeType;

use crate::volume::{BlocklistBlock, IndexedBlock};

pub use self::actor::{DatabaseActor, DatabaseHandle};
pub use self::memory::MemoryDatabase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteVolumeState {
    /// Being filled locally; not yet handed to the uploader.
    Temporary,
    /// Closed; an upload is in progress or was interrupted.
    Uploading,
    Uploaded,
    /// Registered remotely but scheduled for removal.
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVolumeRow {
    pub id: VolumeId,
    pub name: String,
    pub file_type: RemoteVolumeType,
    pub state: RemoteVolumeState,
    /// `-1` until the volume is closed.
    pub size: i64,
    pub hash: Option<BlockHash>,
}

/// Content of one file or metadata stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksetRecord {
    pub id: BlocksetId,
    pub hash: BlockHash,
    pub size: u64,
    pub blocks: Vec<IndexedBlock>,
    pub blocklist_hashes: Vec<BlockHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlockset {
    pub hash: BlockHash,
    pub size: u64,
    pub blocks: Vec<IndexedBlock>,
    pub blocklist_hashes: Vec<BlockHash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetRecord {
    pub id: FilesetId,
    pub volume: VolumeId,
    /// Unix seconds.
    pub timestamp: i64,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub blockset: BlocksetId,
    pub metadata: Option<BlocksetId>,
}

/// Single-writer local state store. All methods are called from the actor
/// thread only.
pub trait LocalDatabase: Send {
    fn find_block(&mut self, hash: BlockHash, size: u64) -> Result<Option<BlockId>>;

    /// Register a block in `volume` unless (hash, size) is already known.
    /// Returns `true` exactly once per identity.
    fn insert_block_if_absent(&mut self, hash: BlockHash, size: u64, volume: VolumeId)
        -> Result<bool>;

    fn register_volume(
        &mut self,
        name: &str,
        file_type: RemoteVolumeType,
        state: RemoteVolumeState,
    ) -> Result<VolumeId>;

    fn update_volume(
        &mut self,
        name: &str,
        state: RemoteVolumeState,
        size: i64,
        hash: Option<BlockHash>,
    ) -> Result<()>;

    fn move_block(&mut self, hash: BlockHash, size: u64, from: VolumeId, to: VolumeId)
        -> Result<()>;

    fn link_index_to_volume(&mut self, index: VolumeId, block_volume: VolumeId) -> Result<()>;

    /// Drop a never-uploaded volume with its block rows, or mark an uploaded
    /// one `Deleting`.
    fn delete_or_deregister_volume(&mut self, name: &str) -> Result<()>;

    fn is_blocklist_hash_known(&mut self, hash: BlockHash) -> Result<bool>;

    fn commit(&mut self, label: &str) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn rename_remote_file(&mut self, old: &str, new: &str) -> Result<()>;

    fn register_blockset(&mut self, blockset: NewBlockset) -> Result<BlocksetId>;

    fn blockset(&mut self, id: BlocksetId) -> Result<BlocksetRecord>;

    fn create_fileset(&mut self, volume: VolumeId, timestamp: i64) -> Result<FilesetId>;

    fn add_file(
        &mut self,
        fileset: FilesetId,
        path: &str,
        blockset: BlocksetId,
        metadata: Option<BlocksetId>,
    ) -> Result<()>;

    fn mark_fileset_complete(&mut self, fileset: FilesetId) -> Result<()>;

    /// Filesets whose run never completed, oldest first.
    fn incomplete_filesets(&mut self) -> Result<Vec<FilesetRecord>>;

    fn last_complete_fileset(&mut self) -> Result<Option<FilesetRecord>>;

    fn fileset_entries(&mut self, fileset: FilesetId) -> Result<Vec<FileRecord>>;

    fn volume(&mut self, name: &str) -> Result<Option<RemoteVolumeRow>>;

    fn volumes(&mut self) -> Result<Vec<RemoteVolumeRow>>;

    fn blocks_in_volume(&mut self, id: VolumeId) -> Result<Vec<IndexedBlock>>;

    /// Block volume an index volume was linked to.
    fn linked_block_volume(&mut self, index: VolumeId) -> Result<Option<VolumeId>>;

    /// Blocklist blocks stored in `volume`, rebuilt from the blocksets that
    /// reference them. Each blocklist covers `hashes_per_blocklist` hashes.
    fn blocklists_in_volume(
        &mut self,
        volume: VolumeId,
        hashes_per_blocklist: usize,
    ) -> Result<Vec<BlocklistBlock>>;
}
