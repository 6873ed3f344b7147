use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use dupvault_types::block_hash::BlockHash;
use dupvault_types::error::{DupError, Result};
use dupvault_types::ids::{BlockId, BlocksetId, FilesetId, VolumeId};
use dupvault_types::volume_name::RemoteVolumeType;

use super::{
    BlocksetRecord, FileRecord, FilesetRecord, LocalDatabase, NewBlockset, RemoteVolumeRow,
    RemoteVolumeState,
};
use crate::volume::{BlocklistBlock, IndexedBlock};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BlockRow {
    id: BlockId,
    volume: VolumeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FilesetRow {
    record: FilesetRecord,
    files: Vec<FileRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    next_id: u64,
    volumes: BTreeMap<VolumeId, RemoteVolumeRow>,
    volume_names: HashMap<String, VolumeId>,
    blocks: HashMap<(BlockHash, u64), BlockRow>,
    blocksets: BTreeMap<BlocksetId, BlocksetRecord>,
    blockset_ids: HashMap<(BlockHash, u64), BlocksetId>,
    blocklist_hashes: HashSet<BlockHash>,
    filesets: BTreeMap<FilesetId, FilesetRow>,
    index_links: BTreeMap<VolumeId, VolumeId>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn volume_id(&self, name: &str) -> Result<VolumeId> {
        self.volume_names
            .get(name)
            .copied()
            .ok_or_else(|| DupError::VolumeNotFound(name.to_string()))
    }

    fn volume_mut(&mut self, name: &str) -> Result<&mut RemoteVolumeRow> {
        let id = self.volume_id(name)?;
        self.volumes
            .get_mut(&id)
            .ok_or_else(|| DupError::VolumeNotFound(name.to_string()))
    }
}

/// In-memory [`LocalDatabase`] with transactional commit/rollback.
///
/// `commit` snapshots the working state; `rollback` restores the last
/// snapshot. With a backing file, each commit also persists the snapshot.
#[derive(Default)]
pub struct MemoryDatabase {
    working: State,
    committed: State,
    path: Option<PathBuf>,
    commit_log: Vec<String>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or create) a database persisted at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let state = match std::fs::read(path) {
            Ok(bytes) => rmp_serde::from_slice::<State>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            working: state.clone(),
            committed: state,
            path: Some(path.to_path_buf()),
            commit_log: Vec::new(),
        })
    }

    /// Labels of every commit since this instance was created.
    pub fn commit_log(&self) -> &[String] {
        &self.commit_log
    }

    fn persist(&self, path: &Path) -> Result<()> {
        let bytes = rmp_serde::to_vec(&self.committed)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl LocalDatabase for MemoryDatabase {
    fn find_block(&mut self, hash: BlockHash, size: u64) -> Result<Option<BlockId>> {
        Ok(self.working.blocks.get(&(hash, size)).map(|row| row.id))
    }

    fn insert_block_if_absent(
        &mut self,
        hash: BlockHash,
        size: u64,
        volume: VolumeId,
    ) -> Result<bool> {
        if self.working.blocks.contains_key(&(hash, size)) {
            return Ok(false);
        }
        if !self.working.volumes.contains_key(&volume) {
            return Err(DupError::VolumeNotFound(format!("id {volume}")));
        }
        let id = BlockId(self.working.next_id());
        self.working.blocks.insert((hash, size), BlockRow { id, volume });
        Ok(true)
    }

    fn register_volume(
        &mut self,
        name: &str,
        file_type: RemoteVolumeType,
        state: RemoteVolumeState,
    ) -> Result<VolumeId> {
        if self.working.volume_names.contains_key(name) {
            return Err(DupError::Database(format!("volume already registered: {name}")));
        }
        let id = VolumeId(self.working.next_id());
        self.working.volumes.insert(
            id,
            RemoteVolumeRow {
                id,
                name: name.to_string(),
                file_type,
                state,
                size: -1,
                hash: None,
            },
        );
        self.working.volume_names.insert(name.to_string(), id);
        Ok(id)
    }

    fn update_volume(
        &mut self,
        name: &str,
        state: RemoteVolumeState,
        size: i64,
        hash: Option<BlockHash>,
    ) -> Result<()> {
        let row = self.working.volume_mut(name)?;
        row.state = state;
        row.size = size;
        row.hash = hash;
        Ok(())
    }

    fn move_block(&mut self, hash: BlockHash, size: u64, from: VolumeId, to: VolumeId) -> Result<()> {
        if !self.working.volumes.contains_key(&to) {
            return Err(DupError::VolumeNotFound(format!("id {to}")));
        }
        match self.working.blocks.get_mut(&(hash, size)) {
            Some(row) if row.volume == from => {
                row.volume = to;
                Ok(())
            }
            Some(row) => Err(DupError::Database(format!(
                "block {hash} is in volume {}, not {from}",
                row.volume
            ))),
            None => Err(DupError::Database(format!("unknown block {hash}/{size}"))),
        }
    }

    fn link_index_to_volume(&mut self, index: VolumeId, block_volume: VolumeId) -> Result<()> {
        for id in [index, block_volume] {
            if !self.working.volumes.contains_key(&id) {
                return Err(DupError::VolumeNotFound(format!("id {id}")));
            }
        }
        self.working.index_links.insert(index, block_volume);
        Ok(())
    }

    fn delete_or_deregister_volume(&mut self, name: &str) -> Result<()> {
        let id = self.working.volume_id(name)?;
        let Some(row) = self.working.volumes.get_mut(&id) else {
            return Err(DupError::VolumeNotFound(name.to_string()));
        };
        if matches!(row.state, RemoteVolumeState::Temporary) {
            self.working.volumes.remove(&id);
            self.working.volume_names.remove(name);
            self.working.index_links.retain(|i, b| *i != id && *b != id);
            debug!(volume = name, "deregistered volume");
        } else {
            row.state = RemoteVolumeState::Deleting;
            debug!(volume = name, "marked volume for deletion");
        }
        self.working.blocks.retain(|_, b| b.volume != id);
        Ok(())
    }

    fn is_blocklist_hash_known(&mut self, hash: BlockHash) -> Result<bool> {
        Ok(self.working.blocklist_hashes.contains(&hash))
    }

    fn commit(&mut self, label: &str) -> Result<()> {
        self.committed = self.working.clone();
        if let Some(path) = &self.path {
            self.persist(path)?;
        }
        self.commit_log.push(label.to_string());
        debug!(label, "database commit");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.working = self.committed.clone();
        debug!("database rollback");
        Ok(())
    }

    fn rename_remote_file(&mut self, old: &str, new: &str) -> Result<()> {
        if self.working.volume_names.contains_key(new) {
            return Err(DupError::Database(format!("volume already registered: {new}")));
        }
        let id = self.working.volume_id(old)?;
        let row = self
            .working
            .volumes
            .get_mut(&id)
            .ok_or_else(|| DupError::VolumeNotFound(old.to_string()))?;
        row.name = new.to_string();
        let file_type = row.file_type;
        self.working.volume_names.remove(old);
        self.working.volume_names.insert(new.to_string(), id);
        // An attempt under the old name may have landed remotely anyway.
        self.register_volume(old, file_type, RemoteVolumeState::Deleting)?;
        debug!(old, new, "renamed volume, old name kept for deletion");
        Ok(())
    }

    fn register_blockset(&mut self, blockset: NewBlockset) -> Result<BlocksetId> {
        let key = (blockset.hash, blockset.size);
        if let Some(id) = self.working.blockset_ids.get(&key) {
            return Ok(*id);
        }
        let id = BlocksetId(self.working.next_id());
        self.working
            .blocklist_hashes
            .extend(blockset.blocklist_hashes.iter().copied());
        self.working.blocksets.insert(
            id,
            BlocksetRecord {
                id,
                hash: blockset.hash,
                size: blockset.size,
                blocks: blockset.blocks,
                blocklist_hashes: blockset.blocklist_hashes,
            },
        );
        self.working.blockset_ids.insert(key, id);
        Ok(id)
    }

    fn blockset(&mut self, id: BlocksetId) -> Result<BlocksetRecord> {
        self.working
            .blocksets
            .get(&id)
            .cloned()
            .ok_or_else(|| DupError::Database(format!("unknown blockset {id}")))
    }

    fn create_fileset(&mut self, volume: VolumeId, timestamp: i64) -> Result<FilesetId> {
        if !self.working.volumes.contains_key(&volume) {
            return Err(DupError::VolumeNotFound(format!("id {volume}")));
        }
        let id = FilesetId(self.working.next_id());
        self.working.filesets.insert(
            id,
            FilesetRow {
                record: FilesetRecord {
                    id,
                    volume,
                    timestamp,
                    complete: false,
                },
                files: Vec::new(),
            },
        );
        Ok(id)
    }

    fn add_file(
        &mut self,
        fileset: FilesetId,
        path: &str,
        blockset: BlocksetId,
        metadata: Option<BlocksetId>,
    ) -> Result<()> {
        let row = self
            .working
            .filesets
            .get_mut(&fileset)
            .ok_or_else(|| DupError::Database(format!("unknown fileset {fileset}")))?;
        row.files.push(FileRecord {
            path: path.to_string(),
            blockset,
            metadata,
        });
        Ok(())
    }

    fn mark_fileset_complete(&mut self, fileset: FilesetId) -> Result<()> {
        let row = self
            .working
            .filesets
            .get_mut(&fileset)
            .ok_or_else(|| DupError::Database(format!("unknown fileset {fileset}")))?;
        row.record.complete = true;
        Ok(())
    }

    fn incomplete_filesets(&mut self) -> Result<Vec<FilesetRecord>> {
        let mut out: Vec<_> = self
            .working
            .filesets
            .values()
            .filter(|f| !f.record.complete)
            .map(|f| f.record)
            .collect();
        out.sort_by_key(|f| (f.timestamp, f.id));
        Ok(out)
    }

    fn last_complete_fileset(&mut self) -> Result<Option<FilesetRecord>> {
        Ok(self
            .working
            .filesets
            .values()
            .filter(|f| f.record.complete)
            .map(|f| f.record)
            .max_by_key(|f| (f.timestamp, f.id)))
    }

    fn fileset_entries(&mut self, fileset: FilesetId) -> Result<Vec<FileRecord>> {
        self.working
            .filesets
            .get(&fileset)
            .map(|f| f.files.clone())
            .ok_or_else(|| DupError::Database(format!("unknown fileset {fileset}")))
    }

    fn volume(&mut self, name: &str) -> Result<Option<RemoteVolumeRow>> {
        Ok(self
            .working
            .volume_names
            .get(name)
            .and_then(|id| self.working.volumes.get(id))
            .cloned())
    }

    fn volumes(&mut self) -> Result<Vec<RemoteVolumeRow>> {
        Ok(self.working.volumes.values().cloned().collect())
    }

    fn blocks_in_volume(&mut self, id: VolumeId) -> Result<Vec<IndexedBlock>> {
        let mut blocks: Vec<_> = self
            .working
            .blocks
            .iter()
            .filter(|(_, row)| row.volume == id)
            .map(|((hash, size), row)| (row.id, IndexedBlock { hash: *hash, size: *size }))
            .collect();
        blocks.sort_by_key(|(id, _)| *id);
        Ok(blocks.into_iter().map(|(_, b)| b).collect())
    }

    fn linked_block_volume(&mut self, index: VolumeId) -> Result<Option<VolumeId>> {
        Ok(self.working.index_links.get(&index).copied())
    }

    fn blocklists_in_volume(
        &mut self,
        volume: VolumeId,
        hashes_per_blocklist: usize,
    ) -> Result<Vec<BlocklistBlock>> {
        if hashes_per_blocklist == 0 {
            return Err(DupError::Config("blocklists must hold at least one hash".into()));
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for set in self.working.blocksets.values() {
            let chunks = set.blocks.chunks(hashes_per_blocklist);
            for (hash, chunk) in set.blocklist_hashes.iter().zip(chunks) {
                let data: Vec<u8> = chunk.iter().flat_map(|b| b.hash.as_bytes().iter().copied()).collect();
                let here = self
                    .working
                    .blocks
                    .get(&(*hash, data.len() as u64))
                    .is_some_and(|row| row.volume == volume);
                if here && seen.insert(*hash) {
                    out.push(BlocklistBlock { hash: *hash, data });
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dupvault_types::block_hash::HashAlgorithm;

    fn h(data: &[u8]) -> BlockHash {
        BlockHash::compute(HashAlgorithm::Sha256, data)
    }

    fn with_volume(db: &mut MemoryDatabase, name: &str) -> VolumeId {
        db.register_volume(name, RemoteVolumeType::Blocks, RemoteVolumeState::Temporary)
            .unwrap()
    }

    #[test]
    fn insert_if_absent_is_novel_exactly_once() {
        let mut db = MemoryDatabase::new();
        let v1 = with_volume(&mut db, "v1");
        let v2 = with_volume(&mut db, "v2");
        assert!(db.insert_block_if_absent(h(b"a"), 1, v1).unwrap());
        assert!(!db.insert_block_if_absent(h(b"a"), 1, v2).unwrap());
        assert!(!db.insert_block_if_absent(h(b"a"), 1, v1).unwrap());
        // Same hash, different size is a different identity.
        assert!(db.insert_block_if_absent(h(b"a"), 2, v2).unwrap());
        assert!(db.find_block(h(b"a"), 1).unwrap().is_some());
        assert_eq!(db.blocks_in_volume(v1).unwrap().len(), 1);
    }

    #[test]
    fn rollback_restores_last_commit() {
        let mut db = MemoryDatabase::new();
        let v = with_volume(&mut db, "v");
        db.commit("registered").unwrap();
        db.insert_block_if_absent(h(b"a"), 1, v).unwrap();
        db.rollback().unwrap();
        assert!(db.find_block(h(b"a"), 1).unwrap().is_none());
        assert!(db.volume("v").unwrap().is_some());
        assert_eq!(db.commit_log(), ["registered"]);
    }

    #[test]
    fn move_block_checks_source_volume() {
        let mut db = MemoryDatabase::new();
        let a = with_volume(&mut db, "a");
        let b = with_volume(&mut db, "b");
        db.insert_block_if_absent(h(b"x"), 1, a).unwrap();
        assert!(db.move_block(h(b"x"), 1, b, a).is_err());
        db.move_block(h(b"x"), 1, a, b).unwrap();
        assert!(db.blocks_in_volume(a).unwrap().is_empty());
        assert_eq!(db.blocks_in_volume(b).unwrap()[0].hash, h(b"x"));
    }

    #[test]
    fn deregister_temporary_drops_row_and_blocks() {
        let mut db = MemoryDatabase::new();
        let v = with_volume(&mut db, "tmp");
        db.insert_block_if_absent(h(b"x"), 1, v).unwrap();
        db.delete_or_deregister_volume("tmp").unwrap();
        assert!(db.volume("tmp").unwrap().is_none());
        assert!(db.find_block(h(b"x"), 1).unwrap().is_none());
    }

    #[test]
    fn deregister_uploaded_marks_deleting() {
        let mut db = MemoryDatabase::new();
        with_volume(&mut db, "up");
        db.update_volume("up", RemoteVolumeState::Uploaded, 10, None)
            .unwrap();
        db.delete_or_deregister_volume("up").unwrap();
        assert_eq!(
            db.volume("up").unwrap().unwrap().state,
            RemoteVolumeState::Deleting
        );
    }

    #[test]
    fn rename_keeps_id() {
        let mut db = MemoryDatabase::new();
        let id = with_volume(&mut db, "old");
        with_volume(&mut db, "taken");
        assert!(db.rename_remote_file("old", "taken").is_err());
        db.rename_remote_file("old", "new").unwrap();
        assert_eq!(db.volume("new").unwrap().unwrap().id, id);
        let renamed = db.volumes().unwrap().into_iter().find(|v| v.id == id).unwrap();
        assert_eq!(renamed.name, "new");

        let placeholder = db.volume("old").unwrap().unwrap();
        assert_ne!(placeholder.id, id);
        assert_eq!(placeholder.state, RemoteVolumeState::Deleting);
        assert_eq!(placeholder.file_type, RemoteVolumeType::Blocks);
    }

    #[test]
    fn blocksets_dedupe_and_record_blocklists() {
        let mut db = MemoryDatabase::new();
        let set = NewBlockset {
            hash: h(b"file"),
            size: 300,
            blocks: vec![],
            blocklist_hashes: vec![h(b"bl")],
        };
        let a = db.register_blockset(set.clone()).unwrap();
        let b = db.register_blockset(set).unwrap();
        assert_eq!(a, b);
        assert!(db.is_blocklist_hash_known(h(b"bl")).unwrap());
        assert_eq!(db.blockset(a).unwrap().blocklist_hashes, vec![h(b"bl")]);
    }

    #[test]
    fn fileset_lifecycle() {
        let mut db = MemoryDatabase::new();
        let v1 = db
            .register_volume("l1", RemoteVolumeType::Files, RemoteVolumeState::Temporary)
            .unwrap();
        let v2 = db
            .register_volume("l2", RemoteVolumeType::Files, RemoteVolumeState::Temporary)
            .unwrap();
        let f1 = db.create_fileset(v1, 100).unwrap();
        let f2 = db.create_fileset(v2, 200).unwrap();
        let bs = db
            .register_blockset(NewBlockset {
                hash: h(b""),
                size: 0,
                blocks: vec![],
                blocklist_hashes: vec![],
            })
            .unwrap();
        db.add_file(f2, "/a", bs, None).unwrap();
        db.mark_fileset_complete(f1).unwrap();

        assert_eq!(db.last_complete_fileset().unwrap().unwrap().id, f1);
        let incomplete = db.incomplete_filesets().unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, f2);
        assert_eq!(db.fileset_entries(f2).unwrap()[0].path, "/a");
    }

    #[test]
    fn persisted_commit_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        {
            let mut db = MemoryDatabase::open(&path).unwrap();
            let v = with_volume(&mut db, "v");
            db.insert_block_if_absent(h(b"a"), 1, v).unwrap();
            db.commit("first").unwrap();
            db.insert_block_if_absent(h(b"b"), 1, v).unwrap();
        }
        let mut db = MemoryDatabase::open(&path).unwrap();
        assert!(db.find_block(h(b"a"), 1).unwrap().is_some());
        assert!(db.find_block(h(b"b"), 1).unwrap().is_none());
    }
}
