use std::thread::{self, JoinHandle};

use tracing::debug;

use dupvault_types::block_hash::BlockHash;
use dupvault_types::error::{DupError, Result};
use dupvault_types::ids::{BlockId, BlocksetId, FilesetId, VolumeId};
use dupvault_types::volume_name::RemoteVolumeType;

use super::{
    BlocksetRecord, FileRecord, FilesetRecord, LocalDatabase, NewBlockset, RemoteVolumeRow,
    RemoteVolumeState,
};
use crate::channel::{self, Receiver, Sender};
use crate::volume::{BlocklistBlock, IndexedBlock};

type Job = Box<dyn FnOnce(&mut dyn LocalDatabase) + Send>;

const JOB_QUEUE_DEPTH: usize = 64;

/// Cloneable client of the database actor. Every call is applied in order on
/// the actor thread and blocks until it completes.
#[derive(Clone)]
pub struct DatabaseHandle {
    jobs: Sender<Job>,
}

/// Receiving end of the actor's job queue.
pub struct DatabaseActor {
    jobs: Receiver<Job>,
}

impl DatabaseActor {
    pub fn channel() -> (DatabaseHandle, DatabaseActor) {
        let (tx, rx) = channel::bounded(JOB_QUEUE_DEPTH);
        (DatabaseHandle { jobs: tx }, DatabaseActor { jobs: rx })
    }

    /// Apply jobs until every handle is dropped.
    pub fn serve(self, db: &mut dyn LocalDatabase) {
        let mut served = 0u64;
        while let Ok(job) = self.jobs.recv() {
            job(&mut *db);
            served += 1;
        }
        debug!(jobs = served, "database actor retired");
    }

    /// Run the actor on its own thread, returning the database once every
    /// handle is dropped.
    pub fn spawn<D: LocalDatabase + 'static>(mut db: D) -> Result<(DatabaseHandle, JoinHandle<D>)> {
        let (handle, actor) = Self::channel();
        let join = thread::Builder::new()
            .name("dupvault-db".into())
            .spawn(move || {
                actor.serve(&mut db);
                db
            })?;
        Ok((handle, join))
    }
}

impl DatabaseHandle {
    /// Run `f` on the actor thread and wait for its result. A retired actor
    /// reads as `Canceled`.
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn LocalDatabase) -> Result<R> + Send + 'static,
    {
        let (reply, pending) = channel::reply();
        let job: Job = Box::new(move |db| reply.send(f(db)));
        self.jobs.send(job).map_err(|_| DupError::Canceled)?;
        pending.wait()
    }

    pub fn find_block(&self, hash: BlockHash, size: u64) -> Result<Option<BlockId>> {
        self.call(move |db| db.find_block(hash, size))
    }

    pub fn insert_block_if_absent(&self, hash: BlockHash, size: u64, volume: VolumeId) -> Result<bool> {
        self.call(move |db| db.insert_block_if_absent(hash, size, volume))
    }

    pub fn register_volume(
        &self,
        name: &str,
        file_type: RemoteVolumeType,
        state: RemoteVolumeState,
    ) -> Result<VolumeId> {
        let name = name.to_string();
        self.call(move |db| db.register_volume(&name, file_type, state))
    }

    pub fn update_volume(
        &self,
        name: &str,
        state: RemoteVolumeState,
        size: i64,
        hash: Option<BlockHash>,
    ) -> Result<()> {
        let name = name.to_string();
        self.call(move |db| db.update_volume(&name, state, size, hash))
    }

    pub fn move_block(&self, hash: BlockHash, size: u64, from: VolumeId, to: VolumeId) -> Result<()> {
        self.call(move |db| db.move_block(hash, size, from, to))
    }

    pub fn link_index_to_volume(&self, index: VolumeId, block_volume: VolumeId) -> Result<()> {
        self.call(move |db| db.link_index_to_volume(index, block_volume))
    }

    pub fn delete_or_deregister_volume(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.call(move |db| db.delete_or_deregister_volume(&name))
    }

    pub fn is_blocklist_hash_known(&self, hash: BlockHash) -> Result<bool> {
        self.call(move |db| db.is_blocklist_hash_known(hash))
    }

    pub fn commit(&self, label: &str) -> Result<()> {
        let label = label.to_string();
        self.call(move |db| db.commit(&label))
    }

    pub fn rollback(&self) -> Result<()> {
        self.call(|db| db.rollback())
    }

    pub fn rename_remote_file(&self, old: &str, new: &str) -> Result<()> {
        let (old, new) = (old.to_string(), new.to_string());
        self.call(move |db| db.rename_remote_file(&old, &new))
    }

    pub fn register_blockset(&self, blockset: NewBlockset) -> Result<BlocksetId> {
        self.call(move |db| db.register_blockset(blockset))
    }

    pub fn blockset(&self, id: BlocksetId) -> Result<BlocksetRecord> {
        self.call(move |db| db.blockset(id))
    }

    pub fn create_fileset(&self, volume: VolumeId, timestamp: i64) -> Result<FilesetId> {
        self.call(move |db| db.create_fileset(volume, timestamp))
    }

    pub fn add_file(
        &self,
        fileset: FilesetId,
        path: &str,
        blockset: BlocksetId,
        metadata: Option<BlocksetId>,
    ) -> Result<()> {
        let path = path.to_string();
        self.call(move |db| db.add_file(fileset, &path, blockset, metadata))
    }

    pub fn mark_fileset_complete(&self, fileset: FilesetId) -> Result<()> {
        self.call(move |db| db.mark_fileset_complete(fileset))
    }

    pub fn incomplete_filesets(&self) -> Result<Vec<FilesetRecord>> {
        self.call(|db| db.incomplete_filesets())
    }

    pub fn last_complete_fileset(&self) -> Result<Option<FilesetRecord>> {
        self.call(|db| db.last_complete_fileset())
    }

    pub fn fileset_entries(&self, fileset: FilesetId) -> Result<Vec<FileRecord>> {
        self.call(move |db| db.fileset_entries(fileset))
    }

    pub fn volume(&self, name: &str) -> Result<Option<RemoteVolumeRow>> {
        let name = name.to_string();
        self.call(move |db| db.volume(&name))
    }

    pub fn volumes(&self) -> Result<Vec<RemoteVolumeRow>> {
        self.call(|db| db.volumes())
    }

    pub fn blocks_in_volume(&self, id: VolumeId) -> Result<Vec<IndexedBlock>> {
        self.call(move |db| db.blocks_in_volume(id))
    }

    pub fn blocklists_in_volume(&self, id: VolumeId, hashes_per_blocklist: usize) -> Result<Vec<BlocklistBlock>> {
        self.call(move |db| db.blocklists_in_volume(id, hashes_per_blocklist))
    }

    pub fn linked_block_volume(&self, index: VolumeId) -> Result<Option<VolumeId>> {
        self.call(move |db| db.linked_block_volume(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use dupvault_types::block_hash::HashAlgorithm;

    #[test]
    fn concurrent_inserts_are_novel_once() {
        let (db, join) = DatabaseActor::spawn(MemoryDatabase::new()).unwrap();
        let vol = db
            .register_volume("v", RemoteVolumeType::Blocks, RemoteVolumeState::Temporary)
            .unwrap();
        let hash = BlockHash::compute(HashAlgorithm::Sha256, b"shared");

        let novel: usize = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let db = db.clone();
                    s.spawn(move || db.insert_block_if_absent(hash, 6, vol).unwrap())
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(novel, 1);

        drop(db);
        let mut inner = join.join().unwrap();
        assert!(inner.find_block(hash, 6).unwrap().is_some());
    }

    #[test]
    fn retired_actor_reads_as_canceled() {
        let (handle, actor) = DatabaseActor::channel();
        drop(actor);
        assert!(handle.volumes().unwrap_err().is_cancellation());
    }

    #[test]
    fn serve_on_borrowed_database() {
        let mut mem = MemoryDatabase::new();
        let (handle, actor) = DatabaseActor::channel();
        std::thread::scope(|s| {
            s.spawn(|| actor.serve(&mut mem));
            handle
                .register_volume("b", RemoteVolumeType::Blocks, RemoteVolumeState::Temporary)
                .unwrap();
            handle.commit("done").unwrap();
            drop(handle);
        });
        assert_eq!(mem.commit_log(), ["done"]);
    }
}
