use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::Duration as ChronoDuration;
use tempfile::TempPath;
use tracing::{debug, info};

use dupvault_types::block_hash::{BlockHash, HashAlgorithm, StreamHasher};
use dupvault_types::error::Result;
use dupvault_types::ids::VolumeId;
use dupvault_types::volume_name::{generate_filename, generate_uid, parse_filename, RemoteVolumeType};

use crate::channel::Reply;
use crate::codec::VolumeCodec;
use crate::db::DatabaseHandle;
use crate::volume::{ClosedBlockVolume, ClosedManifestVolume, PendingIndex};

const HASH_READ_BUF: usize = 64 * 1024;

/// Work handed to the uploader.
pub enum UploadRequest {
    /// A closed block volume and, unless the index policy is `None`, its
    /// pending index.
    Volume {
        block: BlockVolumeUpload,
        index: Option<PendingIndex>,
    },
    /// A standalone, already written index volume, linked to `block_volume`
    /// once uploaded.
    Index {
        index: ManifestUpload,
        block_volume: Option<VolumeId>,
    },
    /// A fileset volume; held back until the next flush.
    Fileset { fileset: ManifestUpload },
    /// Drain all work; resolves with the size of the last block volume queued.
    Flush { reply: Reply<u64> },
}

pub struct BlockVolumeUpload {
    pub id: VolumeId,
    pub volume: ClosedBlockVolume,
}

pub struct ManifestUpload {
    pub id: VolumeId,
    pub volume: ClosedManifestVolume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Created,
    Encrypting,
    Uploading,
    Retrying,
    Completed,
    Failed,
}

/// One remote file on its way through encrypt, retry and put.
pub struct UploadItem {
    pub id: VolumeId,
    pub name: String,
    pub file_type: RemoteVolumeType,
    path: Option<TempPath>,
    pub size: u64,
    pub hash: Option<BlockHash>,
    pub state: UploadState,
    encrypted: bool,
}

impl UploadItem {
    pub fn new(id: VolumeId, name: String, file_type: RemoteVolumeType, path: TempPath, size: u64) -> Self {
        Self {
            id,
            name,
            file_type,
            path: Some(path),
            size,
            hash: None,
            state: UploadState::Created,
            encrypted: false,
        }
    }

    pub fn from_block(upload: BlockVolumeUpload) -> Self {
        let v = upload.volume;
        Self::new(upload.id, v.name, RemoteVolumeType::Blocks, v.path, v.size)
    }

    pub fn from_manifest(upload: ManifestUpload, file_type: RemoteVolumeType) -> Self {
        let v = upload.volume;
        Self::new(upload.id, v.name, file_type, v.path, v.size)
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Encrypt the local file in place. Runs once per item, whatever the
    /// number of attempts.
    pub fn encrypt(&mut self, codec: &dyn VolumeCodec) -> Result<()> {
        if self.encrypted {
            return Ok(());
        }
        self.state = UploadState::Encrypting;
        if let Some(path) = self.local_path() {
            codec.encrypt_file(path)?;
        }
        self.encrypted = true;
        Ok(())
    }

    /// Recompute size and hash from the local file. Returns `true` if either
    /// changed.
    pub fn update_hash_and_size(&mut self, algorithm: HashAlgorithm) -> Result<bool> {
        let Some(path) = self.local_path() else {
            return Ok(false);
        };
        let mut file = File::open(path)?;
        let mut hasher = StreamHasher::new(algorithm);
        let mut buf = vec![0u8; HASH_READ_BUF];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        let hash = hasher.finalize();
        let changed = self.size != size || self.hash != Some(hash);
        self.size = size;
        self.hash = Some(hash);
        Ok(changed)
    }

    /// Move the remote target to a fresh name with a later timestamp, and
    /// record the rename in the registry. The old name stays registered as
    /// `Deleting`.
    pub fn rename_for_retry(&mut self, db: &DatabaseHandle) -> Result<()> {
        let parsed = parse_filename(&self.name)?;
        let new_name = generate_filename(
            parsed.file_type,
            &parsed.prefix,
            &generate_uid(),
            parsed.time + ChronoDuration::seconds(1),
            &parsed.compression,
            parsed.encryption.as_deref(),
        );
        info!(old = %self.name, new = %new_name, "renaming remote target before retry");
        db.rename_remote_file(&self.name, &new_name)?;
        self.name = new_name;
        Ok(())
    }

    /// Remove the local temp file.
    pub fn delete_local(&mut self) -> Result<()> {
        if let Some(path) = self.path.take() {
            debug!(volume = %self.name, "deleting local volume file");
            path.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseActor, MemoryDatabase, RemoteVolumeState};
    use chrono::{TimeZone, Utc};
    use std::io::Write;

    fn temp_item(dir: &Path, name: &str, data: &[u8]) -> UploadItem {
        let mut f = tempfile::NamedTempFile::new_in(dir).unwrap();
        f.write_all(data).unwrap();
        UploadItem::new(
            VolumeId(1),
            name.to_string(),
            RemoteVolumeType::Blocks,
            f.into_temp_path(),
            0,
        )
    }

    #[test]
    fn update_hash_and_size_reports_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut item = temp_item(dir.path(), "x", b"hello");
        assert!(item.update_hash_and_size(HashAlgorithm::Sha256).unwrap());
        assert_eq!(item.size, 5);
        assert_eq!(
            item.hash,
            Some(BlockHash::compute(HashAlgorithm::Sha256, b"hello"))
        );
        assert!(!item.update_hash_and_size(HashAlgorithm::Sha256).unwrap());
    }

    #[test]
    fn rename_bumps_timestamp_and_uid() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let name = generate_filename(RemoteVolumeType::Blocks, "dupvault", "aa", t0, "zstd", None);
        let (db, _join) = DatabaseActor::spawn(MemoryDatabase::new()).unwrap();
        db.register_volume(&name, RemoteVolumeType::Blocks, RemoteVolumeState::Temporary)
            .unwrap();

        let mut item = temp_item(dir.path(), &name, b"x");
        item.rename_for_retry(&db).unwrap();

        let parsed = parse_filename(&item.name).unwrap();
        assert_eq!(parsed.time, t0 + ChronoDuration::seconds(1));
        assert_ne!(parsed.uid, "aa");
        assert_eq!(db.volume(&item.name).unwrap().unwrap().id, VolumeId(1));
        let old = db.volume(&name).unwrap().unwrap();
        assert_eq!(old.state, RemoteVolumeState::Deleting);
        assert_eq!(old.file_type, RemoteVolumeType::Blocks);
    }

    #[test]
    fn delete_local_removes_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut item = temp_item(dir.path(), "x", b"data");
        let path = item.local_path().unwrap().to_path_buf();
        item.delete_local().unwrap();
        assert!(!path.exists());
        item.delete_local().unwrap();
        assert!(item.local_path().is_none());
    }
}
