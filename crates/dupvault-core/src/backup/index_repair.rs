//! Rebuilds index volumes for uploaded block volumes that have none.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info, warn};

use dupvault_types::block_hash::BlockHash;
use dupvault_types::error::{DupError, Result};
use dupvault_types::volume_name::RemoteVolumeType;

use crate::config::IndexPolicy;
use crate::db::{RemoteVolumeRow, RemoteVolumeState};
use crate::volume::PendingIndex;

use super::upload_request::{ManifestUpload, UploadRequest};
use super::volumes::VolumeOpener;

/// Queue a standalone index upload for every uploaded block volume that no
/// index volume links to. Returns the number of indexes queued.
pub fn queue_missing_indexes(opener: &VolumeOpener) -> Result<usize> {
    if opener.config().blocks.index_policy == IndexPolicy::None {
        return Ok(0);
    }
    let db = opener.db();
    let volumes = db.volumes()?;

    let mut indexed = HashSet::new();
    for index in volumes
        .iter()
        .filter(|v| v.file_type == RemoteVolumeType::Index && v.state != RemoteVolumeState::Deleting)
    {
        if let Some(block_volume) = db.linked_block_volume(index.id)? {
            indexed.insert(block_volume);
        }
    }

    let mut queued = 0;
    for volume in volumes.iter().filter(|v| {
        v.file_type == RemoteVolumeType::Blocks
            && v.state == RemoteVolumeState::Uploaded
            && !indexed.contains(&v.id)
    }) {
        let (Some(hash), Ok(size)) = (volume.hash, u64::try_from(volume.size)) else {
            warn!(volume = %volume.name, "no recorded hash or size, cannot rebuild its index");
            continue;
        };
        queue_index(opener, volume, hash, size)?;
        queued += 1;
    }
    if queued > 0 {
        info!(count = queued, "recreating missing index volumes");
    }
    Ok(queued)
}

fn queue_index(opener: &VolumeOpener, volume: &RemoteVolumeRow, hash: BlockHash, size: u64) -> Result<()> {
    let config = opener.config();
    let db = opener.db();
    let name = opener.volume_name(RemoteVolumeType::Index, Utc::now());
    let id = db.register_volume(&name, RemoteVolumeType::Index, RemoteVolumeState::Uploading)?;

    let mut index = PendingIndex::new(name, id);
    for block in db.blocks_in_volume(volume.id)? {
        index.add_block(block.hash, block.size);
    }
    if config.blocks.index_policy == IndexPolicy::Full {
        for list in db.blocklists_in_volume(volume.id, config.blocks.hashes_per_blocklist())? {
            index.add_blocklist(list.hash, &list.data);
        }
    }
    let manifest = index.materialize(&config.temp_dir(), &volume.name, hash, size)?;
    debug!(
        index = %manifest.name,
        volume = %volume.name,
        blocks = index.blocks().len(),
        blocklists = index.blocklists().len(),
        "rebuilt index volume"
    );
    opener
        .uploads()
        .send(UploadRequest::Index {
            index: ManifestUpload { id, volume: manifest },
            block_volume: Some(volume.id),
        })
        .map_err(|_| DupError::Canceled)
}
