use std::io::Cursor;
use std::sync::Arc;
use std::thread::JoinHandle;

use tempfile::TempDir;

use dupvault_types::block_hash::BlockHash;
use dupvault_types::error::Result;

use crate::backup::chunker::{BlockMessage, BlockVerdict, Chunker, StreamRequest, StreamResult, StreamSource};
use crate::channel::{self, Sender};
use crate::compress::CompressionHint;
use crate::config::BackupConfig;
use crate::control::TaskControl;
use crate::db::DatabaseHandle;
use crate::testutil::{pattern, spawn_db, test_config};

/// What the stand-in packer saw, in arrival order.
struct Seen {
    hash: BlockHash,
    data: Vec<u8>,
    hint: CompressionHint,
    is_blocklist: bool,
}

struct Harness {
    _dir: TempDir,
    config: Arc<BackupConfig>,
    db: DatabaseHandle,
    control: Arc<TaskControl>,
    streams: Option<Sender<StreamRequest>>,
    chunker: Option<JoinHandle<()>>,
    sink: Option<JoinHandle<Vec<Seen>>>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let db = spawn_db();
        let control = Arc::new(TaskControl::new());
        let (block_tx, block_rx) = channel::bounded::<BlockMessage>(4);
        let (stream_tx, stream_rx) = channel::bounded(4);

        let sink = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Ok(msg) = block_rx.recv() {
                seen.push(Seen {
                    hash: msg.hash,
                    data: msg.data.clone(),
                    hint: msg.hint,
                    is_blocklist: msg.is_blocklist,
                });
                msg.reply.ok(BlockVerdict {
                    is_new: true,
                    buffer: msg.data,
                });
            }
            seen
        });
        let chunker = Chunker::new(Arc::clone(&config), db.clone(), block_tx, Arc::clone(&control));
        let handle = std::thread::spawn(move || chunker.run(stream_rx));

        Self {
            _dir: dir,
            config,
            db,
            control,
            streams: Some(stream_tx),
            chunker: Some(handle),
            sink: Some(sink),
        }
    }

    fn chunk(&self, source: StreamSource) -> Result<StreamResult> {
        let (reply, pending) = channel::reply();
        self.streams
            .as_ref()
            .unwrap()
            .send(StreamRequest {
                label: "test".into(),
                source,
                hint: CompressionHint::Default,
                reply,
            })
            .unwrap();
        pending.wait()
    }

    fn data(&self, bytes: &[u8]) -> Result<StreamResult> {
        self.chunk(StreamSource::Data(Box::new(Cursor::new(bytes.to_vec()))))
    }

    fn finish(&mut self) -> Vec<Seen> {
        self.streams = None;
        self.chunker.take().unwrap().join().unwrap();
        self.sink.take().unwrap().join().unwrap()
    }
}

#[test]
fn stream_is_split_into_blocks_and_blocklists() {
    let mut h = Harness::new();
    let data = pattern(1050, 7);
    let result = h.data(&data).unwrap();
    let seen = h.finish();

    let blocks = &h.config.blocks;
    assert_eq!(result.size, 1050);
    assert_eq!(result.hash, BlockHash::compute(blocks.file_hash, &data));

    let data_blocks: Vec<_> = seen.iter().filter(|s| !s.is_blocklist).collect();
    let blocklists: Vec<_> = seen.iter().filter(|s| s.is_blocklist).collect();
    assert_eq!(data_blocks.len(), 11);
    assert_eq!(blocklists.len(), 4);
    assert_eq!(data_blocks[10].data.len(), 50);
    for (i, block) in data_blocks.iter().enumerate() {
        let end = ((i + 1) * 100).min(1050);
        assert_eq!(block.data, &data[i * 100..end]);
        assert_eq!(block.hash, BlockHash::compute(blocks.block_hash, &block.data));
    }

    // Three 32-byte hashes fit in one 100-byte blocklist.
    let per_list = blocks.hashes_per_blocklist();
    assert_eq!(per_list, 3);
    for (i, list) in blocklists.iter().enumerate() {
        let expected: Vec<u8> = data_blocks
            .iter()
            .skip(i * per_list)
            .take(per_list)
            .flat_map(|b| b.hash.as_bytes().to_vec())
            .collect();
        assert_eq!(list.data, expected);
        assert_eq!(list.hint, CompressionHint::Noncompressible);
    }

    let record = h.db.blockset(result.blockset).unwrap();
    assert_eq!(record.blocks.len(), 11);
    let hashes: Vec<_> = blocklists.iter().map(|b| b.hash).collect();
    assert_eq!(record.blocklist_hashes, hashes);
}

#[test]
fn single_block_stream_has_no_blocklist() {
    let mut h = Harness::new();
    let result = h.data(&pattern(80, 2)).unwrap();
    let seen = h.finish();
    assert_eq!(seen.len(), 1);
    assert!(!seen[0].is_blocklist);
    assert!(h.db.blockset(result.blockset).unwrap().blocklist_hashes.is_empty());
}

#[test]
fn empty_stream_produces_no_blocks() {
    let mut h = Harness::new();
    let result = h.data(&[]).unwrap();
    let seen = h.finish();
    assert!(seen.is_empty());
    assert_eq!(result.size, 0);
    assert_eq!(result.hash, BlockHash::compute(h.config.blocks.file_hash, &[]));
    assert!(h.db.blockset(result.blockset).unwrap().blocks.is_empty());
}

#[test]
fn oversized_metadata_is_stored_empty() {
    let mut h = Harness::new();
    let limit = h.config.blocks.max_metadata_size();
    let fits = h.chunk(StreamSource::Metadata(pattern(limit, 1))).unwrap();
    let oversized = h.chunk(StreamSource::Metadata(pattern(limit + 1, 1))).unwrap();
    h.finish();
    assert_eq!(fits.size, limit as u64);
    assert_eq!(oversized.size, 0);
}

#[test]
fn terminated_chunker_fails_requests() {
    let mut h = Harness::new();
    h.control.terminate();
    let err = h.data(&pattern(300, 1)).unwrap_err();
    assert!(err.is_cancellation());
    assert!(h.finish().is_empty());
}
