use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use dupvault_types::block_hash::{BlockHash, HashAlgorithm};
use dupvault_types::ids::BlocksetId;
use dupvault_types::volume_name::{parse_filename, RemoteVolumeType};

use crate::backup::filelist::{begin_fileset, queue_fileset, queue_synthetic_fileset};
use crate::backup::upload_request::UploadRequest;
use crate::backup::volumes::VolumeOpener;
use crate::channel::{self, Receiver};
use crate::db::{DatabaseHandle, NewBlockset, RemoteVolumeState};
use crate::testutil::{spawn_db, test_config};
use crate::volume::{FilesetManifest, IndexedBlock};

struct Harness {
    _dir: TempDir,
    db: DatabaseHandle,
    opener: VolumeOpener,
    uploads: Receiver<UploadRequest>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let db = spawn_db();
        let (tx, uploads) = channel::bounded(16);
        let opener = VolumeOpener::new(config, db.clone(), tx);
        Self {
            _dir: dir,
            db,
            opener,
            uploads,
        }
    }

    /// Register a blockset of `blocks` blocks whose hashes derive from `tag`.
    fn blockset(&self, tag: &str, blocks: usize) -> BlocksetId {
        let hash = |s: String| BlockHash::compute(HashAlgorithm::Sha256, s.as_bytes());
        let blocks: Vec<IndexedBlock> = (0..blocks)
            .map(|i| IndexedBlock {
                hash: hash(format!("{tag}/{i}")),
                size: 100,
            })
            .collect();
        let blocklist_hashes = if blocks.len() > 1 {
            vec![hash(format!("{tag}/list"))]
        } else {
            Vec::new()
        };
        self.db
            .register_blockset(NewBlockset {
                hash: hash(tag.to_string()),
                size: blocks.len() as u64 * 100,
                blocks,
                blocklist_hashes,
            })
            .unwrap()
    }

    /// The next queued fileset manifest and its remote name.
    fn next_manifest(&self) -> (String, FilesetManifest) {
        match self.uploads.recv().unwrap() {
            UploadRequest::Fileset { fileset } => {
                let bytes = std::fs::read(&fileset.volume.path).unwrap();
                (fileset.volume.name, FilesetManifest::from_bytes(&bytes).unwrap())
            }
            _ => panic!("expected a fileset upload"),
        }
    }
}

#[test]
fn fileset_manifest_lists_every_file() {
    let h = Harness::new();
    let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let fileset = begin_fileset(&h.opener, time).unwrap();
    let small = h.blockset("small", 1);
    let large = h.blockset("large", 3);
    let meta = h.blockset("meta", 1);
    h.db.add_file(fileset.id, "a/small", small, Some(meta)).unwrap();
    h.db.add_file(fileset.id, "a/large", large, None).unwrap();

    queue_fileset(&h.opener, &fileset).unwrap();
    let (name, manifest) = h.next_manifest();
    assert_eq!(name, fileset.name);
    assert_eq!(manifest.timestamp, 1_700_000_000);
    assert_eq!(manifest.blocksize, 100);
    assert_eq!(manifest.entries.len(), 2);

    let small_entry = manifest.entries.iter().find(|e| e.path == "a/small").unwrap();
    assert!(small_entry.content.block_hash.is_some());
    assert!(small_entry.content.blocklist_hashes.is_empty());
    assert_eq!(small_entry.metadata.as_ref().unwrap().size, 100);

    let large_entry = manifest.entries.iter().find(|e| e.path == "a/large").unwrap();
    assert!(large_entry.content.block_hash.is_none());
    assert_eq!(large_entry.content.size, 300);
    assert_eq!(large_entry.content.blocklist_hashes.len(), 1);
    assert!(large_entry.metadata.is_none());

    let row = h.db.volume(&fileset.name).unwrap().unwrap();
    assert_eq!(row.state, RemoteVolumeState::Uploading);
    assert_eq!(row.file_type, RemoteVolumeType::Files);
}

#[test]
fn no_synthetic_fileset_without_an_interrupted_run() {
    let h = Harness::new();
    assert!(queue_synthetic_fileset(&h.opener).unwrap().is_none());

    let done = begin_fileset(&h.opener, Utc.timestamp_opt(1_000, 0).unwrap()).unwrap();
    h.db.mark_fileset_complete(done.id).unwrap();
    assert!(queue_synthetic_fileset(&h.opener).unwrap().is_none());
}

#[test]
fn incomplete_fileset_older_than_last_complete_is_ignored() {
    let h = Harness::new();
    begin_fileset(&h.opener, Utc.timestamp_opt(1_000, 0).unwrap()).unwrap();
    let done = begin_fileset(&h.opener, Utc.timestamp_opt(2_000, 0).unwrap()).unwrap();
    h.db.mark_fileset_complete(done.id).unwrap();
    assert!(queue_synthetic_fileset(&h.opener).unwrap().is_none());
}

#[test]
fn synthetic_fileset_overlays_interrupted_run_on_last_complete() {
    let h = Harness::new();
    let previous = begin_fileset(&h.opener, Utc.timestamp_opt(1_000, 0).unwrap()).unwrap();
    let old_a = h.blockset("a-v1", 1);
    let kept = h.blockset("kept", 1);
    h.db.add_file(previous.id, "a", old_a, None).unwrap();
    h.db.add_file(previous.id, "kept", kept, None).unwrap();
    h.db.mark_fileset_complete(previous.id).unwrap();

    let interrupted = begin_fileset(&h.opener, Utc.timestamp_opt(2_000, 0).unwrap()).unwrap();
    let new_a = h.blockset("a-v2", 2);
    let added = h.blockset("added", 1);
    h.db.add_file(interrupted.id, "a", new_a, None).unwrap();
    h.db.add_file(interrupted.id, "added", added, None).unwrap();

    // One second past the interrupted run is already taken.
    let taken = h
        .opener
        .volume_name(RemoteVolumeType::Files, Utc.timestamp_opt(2_001, 0).unwrap());
    h.db.register_volume(&taken, RemoteVolumeType::Files, RemoteVolumeState::Uploaded)
        .unwrap();

    let synthetic = queue_synthetic_fileset(&h.opener).unwrap().unwrap();
    assert_eq!(synthetic.timestamp, 2_002);
    assert_eq!(parse_filename(&synthetic.name).unwrap().time.timestamp(), 2_002);

    let files = h.db.fileset_entries(synthetic.id).unwrap();
    let mut listed: Vec<(String, BlocksetId)> = files.into_iter().map(|f| (f.path, f.blockset)).collect();
    listed.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        listed,
        vec![
            ("a".to_string(), new_a),
            ("added".to_string(), added),
            ("kept".to_string(), kept),
        ]
    );

    let (name, manifest) = h.next_manifest();
    assert_eq!(name, synthetic.name);
    assert_eq!(manifest.entries.len(), 3);
    assert_eq!(manifest.timestamp, 2_002);
}
