//! Fileset volumes: the current run's file list and the synthetic list that
//! stands in for an interrupted earlier run.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};

use dupvault_types::error::{DupError, Result};
use dupvault_types::ids::{BlocksetId, FilesetId, VolumeId};
use dupvault_types::volume_name::{parse_filename, RemoteVolumeType};

use crate::db::{DatabaseHandle, FileRecord, FilesetRecord, RemoteVolumeState};
use crate::volume::{ContentRef, FilesetEntry, FilesetManifest};

use super::upload_request::{ManifestUpload, UploadRequest};
use super::volumes::VolumeOpener;

/// How far past the interrupted run's timestamp a free synthetic name is
/// searched for.
const SYNTHETIC_PROBE_SECS: i64 = 60;

/// A registered fileset and the remote volume that will carry it.
#[derive(Debug, Clone)]
pub struct RunFileset {
    pub id: FilesetId,
    pub volume: VolumeId,
    pub name: String,
    pub timestamp: i64,
}

/// Register a fileset stamped `time` with a `Temporary` fileset volume.
pub fn begin_fileset(opener: &VolumeOpener, time: DateTime<Utc>) -> Result<RunFileset> {
    let db = opener.db();
    let name = opener.volume_name(RemoteVolumeType::Files, time);
    let volume = db.register_volume(&name, RemoteVolumeType::Files, RemoteVolumeState::Temporary)?;
    let timestamp = time.timestamp();
    let id = db.create_fileset(volume, timestamp)?;
    db.commit("fileset-begin")?;
    debug!(fileset = %id, volume = %name, "registered fileset");
    Ok(RunFileset {
        id,
        volume,
        name,
        timestamp,
    })
}

/// Write the fileset manifest and queue it for upload. The uploader holds it
/// back until the next flush.
pub fn queue_fileset(opener: &VolumeOpener, fileset: &RunFileset) -> Result<()> {
    let db = opener.db();
    let records = db.fileset_entries(fileset.id)?;
    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        entries.push(FilesetEntry {
            content: content_ref(db, record.blockset)?,
            metadata: record
                .metadata
                .map(|m| content_ref(db, m))
                .transpose()?,
            path: record.path,
        });
    }
    let manifest = FilesetManifest {
        timestamp: fileset.timestamp,
        blocksize: opener.config().blocks.blocksize as u64,
        entries,
    };
    let volume = manifest.write(&opener.config().temp_dir(), fileset.name.clone())?;
    db.update_volume(
        &fileset.name,
        RemoteVolumeState::Uploading,
        volume.size as i64,
        None,
    )?;
    db.commit("fileset-close")?;
    debug!(fileset = %fileset.id, files = manifest.entries.len(), "queueing fileset volume");
    opener
        .uploads()
        .send(UploadRequest::Fileset {
            fileset: ManifestUpload {
                id: fileset.volume,
                volume,
            },
        })
        .map_err(|_| DupError::Canceled)
}

/// Where a blockset's content lives, as recorded in a fileset manifest.
pub fn content_ref(db: &DatabaseHandle, blockset: BlocksetId) -> Result<ContentRef> {
    let record = db.blockset(blockset)?;
    let block_hash = match record.blocks.as_slice() {
        [only] => Some(only.hash),
        _ => None,
    };
    Ok(ContentRef {
        hash: record.hash,
        size: record.size,
        block_hash,
        blocklist_hashes: record.blocklist_hashes,
    })
}

/// If the newest fileset was left incomplete by an interrupted run, register
/// and queue a fileset one second later that combines the last complete
/// fileset with whatever the interrupted run recorded.
pub fn queue_synthetic_fileset(opener: &VolumeOpener) -> Result<Option<RunFileset>> {
    let db = opener.db();
    let Some(interrupted) = db.incomplete_filesets()?.into_iter().max_by_key(|f| f.timestamp) else {
        return Ok(None);
    };
    let previous = db.last_complete_fileset()?;
    if previous.is_some_and(|p| p.timestamp >= interrupted.timestamp) {
        return Ok(None);
    }

    let Some(time) = free_fileset_time(db, &interrupted)? else {
        warn!(
            timestamp = interrupted.timestamp,
            "no free timestamp for a synthetic fileset, skipping"
        );
        return Ok(None);
    };

    let mut files: BTreeMap<String, FileRecord> = BTreeMap::new();
    if let Some(previous) = previous {
        for record in db.fileset_entries(previous.id)? {
            files.insert(record.path.clone(), record);
        }
    }
    for record in db.fileset_entries(interrupted.id)? {
        files.insert(record.path.clone(), record);
    }

    let synthetic = begin_fileset(opener, time)?;
    for record in files.values() {
        db.add_file(synthetic.id, &record.path, record.blockset, record.metadata)?;
    }
    info!(
        interrupted = interrupted.timestamp,
        synthetic = synthetic.timestamp,
        files = files.len(),
        "uploading synthetic fileset for interrupted run"
    );
    queue_fileset(opener, &synthetic)?;
    Ok(Some(synthetic))
}

/// First second after `interrupted` that no fileset volume uses yet.
fn free_fileset_time(db: &DatabaseHandle, interrupted: &FilesetRecord) -> Result<Option<DateTime<Utc>>> {
    let used: HashSet<i64> = db
        .volumes()?
        .iter()
        .filter(|v| v.file_type == RemoteVolumeType::Files)
        .filter_map(|v| parse_filename(&v.name).ok())
        .map(|p| p.time.timestamp())
        .collect();
    for offset in 1..=SYNTHETIC_PROBE_SECS {
        let candidate = interrupted.timestamp + offset;
        if used.contains(&candidate) {
            continue;
        }
        if let Some(time) = Utc.timestamp_opt(candidate, 0).single() {
            return Ok(Some(time));
        }
    }
    Ok(None)
}
