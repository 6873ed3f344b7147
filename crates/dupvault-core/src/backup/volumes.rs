use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use dupvault_types::error::{DupError, Result};
use dupvault_types::ids::VolumeId;
use dupvault_types::volume_name::{generate_filename, generate_uid, RemoteVolumeType};

use crate::channel::Sender;
use crate::compress::Compression;
use crate::config::{BackupConfig, IndexPolicy};
use crate::db::{DatabaseHandle, RemoteVolumeState};
use crate::volume::{BlockVolumeWriter, PendingIndex};

use super::upload_request::{BlockVolumeUpload, UploadRequest};

/// A block volume being filled by one worker, with its pending index.
#[derive(Debug)]
pub struct OpenVolume {
    pub id: VolumeId,
    pub writer: BlockVolumeWriter,
    pub index: Option<PendingIndex>,
}

impl OpenVolume {
    pub fn name(&self) -> &str {
        self.writer.name()
    }

    /// Nothing to upload: no data blocks and no pending blocklist entries.
    pub fn is_empty(&self) -> bool {
        self.writer.is_empty()
            && !self
                .index
                .as_ref()
                .map(PendingIndex::has_blocklists)
                .unwrap_or(false)
    }
}

/// Registers, names and hands off block volumes. Shared by the packers and
/// the spill collector.
#[derive(Clone)]
pub struct VolumeOpener {
    config: Arc<BackupConfig>,
    db: DatabaseHandle,
    uploads: Sender<UploadRequest>,
}

impl VolumeOpener {
    pub fn new(config: Arc<BackupConfig>, db: DatabaseHandle, uploads: Sender<UploadRequest>) -> Self {
        Self {
            config,
            db,
            uploads,
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn db(&self) -> &DatabaseHandle {
        &self.db
    }

    pub fn uploads(&self) -> &Sender<UploadRequest> {
        &self.uploads
    }

    /// Remote filename for a new volume of `file_type` stamped at `time`.
    pub fn volume_name(&self, file_type: RemoteVolumeType, time: DateTime<Utc>) -> String {
        generate_filename(
            file_type,
            &self.config.upload.prefix,
            &generate_uid(),
            time,
            self.config.compression_module(),
            self.config.encryption_module(),
        )
    }

    /// Register a fresh block volume (and index, unless the policy is `None`)
    /// as `Temporary` and create its temp file.
    pub fn open(&self) -> Result<OpenVolume> {
        let now = Utc::now();
        let name = self.volume_name(RemoteVolumeType::Blocks, now);
        let id = self
            .db
            .register_volume(&name, RemoteVolumeType::Blocks, RemoteVolumeState::Temporary)?;
        let blocks = &self.config.blocks;
        let compression = Compression::from_algorithm(blocks.compression.algorithm, blocks.compression.zstd_level);
        let writer = BlockVolumeWriter::create(&self.config.temp_dir(), name, compression)?;

        let index = match blocks.index_policy {
            IndexPolicy::None => None,
            IndexPolicy::Lookup | IndexPolicy::Full => {
                let index_name = self.volume_name(RemoteVolumeType::Index, now);
                let index_id = self.db.register_volume(
                    &index_name,
                    RemoteVolumeType::Index,
                    RemoteVolumeState::Temporary,
                )?;
                Some(PendingIndex::new(index_name, index_id))
            }
        };
        debug!(volume = %writer.name(), "opened block volume");
        Ok(OpenVolume { id, writer, index })
    }

    /// Deregister the volume and its index, and remove the temp file.
    pub fn discard(&self, volume: OpenVolume) -> Result<()> {
        debug!(volume = %volume.name(), "discarding block volume");
        self.db.delete_or_deregister_volume(volume.writer.name())?;
        if let Some(index) = &volume.index {
            self.db.delete_or_deregister_volume(&index.name)?;
        }
        volume.writer.discard()
    }

    /// Mark `Uploading`, commit, close and queue the volume for upload.
    pub fn submit(&self, volume: OpenVolume) -> Result<()> {
        let OpenVolume { id, writer, index } = volume;
        self.db.update_volume(
            writer.name(),
            RemoteVolumeState::Uploading,
            writer.size() as i64,
            None,
        )?;
        self.db.commit("volume-close")?;
        let closed = writer.close()?;
        debug!(
            volume = %closed.name,
            size = closed.size,
            blocks = closed.entries.len(),
            "closed block volume"
        );
        self.uploads
            .send(UploadRequest::Volume {
                block: BlockVolumeUpload { id, volume: closed },
                index,
            })
            .map_err(|_| DupError::Canceled)
    }
}
