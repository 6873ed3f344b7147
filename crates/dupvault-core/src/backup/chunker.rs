//! Fixed-size chunking with block, blocklist and whole-stream hashes.

use std::io::{self, Cursor, Read};
use std::sync::Arc;

use tracing::{debug, warn};

use dupvault_types::block_hash::{BlockHash, HashAlgorithm, StreamHasher};
use dupvault_types::error::{DupError, Result};
use dupvault_types::ids::BlocksetId;

use crate::channel::{self, Receiver, Reply, Sender};
use crate::compress::CompressionHint;
use crate::config::BackupConfig;
use crate::control::TaskControl;
use crate::db::{DatabaseHandle, NewBlockset};
use crate::volume::IndexedBlock;

pub enum StreamSource {
    Data(Box<dyn Read + Send>),
    Metadata(Vec<u8>),
}

/// One stream to chunk. `label` only appears in log lines.
pub struct StreamRequest {
    pub label: String,
    pub source: StreamSource,
    pub hint: CompressionHint,
    pub reply: Reply<StreamResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamResult {
    pub hash: BlockHash,
    pub size: u64,
    pub blockset: BlocksetId,
}

/// A hashed block on its way to a packer. The packer hands `data` back in
/// the verdict so the chunker can reuse the buffer.
pub struct BlockMessage {
    pub hash: BlockHash,
    pub size: u64,
    pub data: Vec<u8>,
    pub hint: CompressionHint,
    pub is_blocklist: bool,
    pub reply: Reply<BlockVerdict>,
}

#[derive(Debug)]
pub struct BlockVerdict {
    pub is_new: bool,
    pub buffer: Vec<u8>,
}

pub struct Chunker {
    config: Arc<BackupConfig>,
    db: DatabaseHandle,
    blocks: Sender<BlockMessage>,
    control: Arc<TaskControl>,
}

impl Chunker {
    pub fn new(
        config: Arc<BackupConfig>,
        db: DatabaseHandle,
        blocks: Sender<BlockMessage>,
        control: Arc<TaskControl>,
    ) -> Self {
        Self {
            config,
            db,
            blocks,
            control,
        }
    }

    /// Serve stream requests until the request channel retires. Every
    /// request's reply is resolved, with an error if chunking failed.
    pub fn run(self, requests: Receiver<StreamRequest>) {
        while let Ok(request) = requests.recv() {
            let StreamRequest {
                label,
                source,
                hint,
                reply,
            } = request;
            if let Err(e) = self.control.ensure_not_terminated() {
                reply.fail(e);
                continue;
            }
            match self.process(&label, source, hint) {
                Ok(result) => reply.ok(result),
                Err(e) => {
                    debug!(stream = %label, error = %e, "chunking failed");
                    reply.fail(e);
                }
            }
        }
    }

    fn process(&self, label: &str, source: StreamSource, hint: CompressionHint) -> Result<StreamResult> {
        let blocks_cfg = &self.config.blocks;
        let mut reader: Box<dyn Read + Send> = match source {
            StreamSource::Data(reader) => reader,
            StreamSource::Metadata(bytes) if bytes.len() > blocks_cfg.max_metadata_size() => {
                warn!(
                    stream = %label,
                    size = bytes.len(),
                    limit = blocks_cfg.max_metadata_size(),
                    "metadata too large, storing empty metadata instead"
                );
                Box::new(Cursor::new(Vec::new()))
            }
            StreamSource::Metadata(bytes) => Box::new(Cursor::new(bytes)),
        };
        self.chunk_stream(&mut reader, hint)
    }

    fn chunk_stream(&self, reader: &mut (dyn Read + Send), hint: CompressionHint) -> Result<StreamResult> {
        let blocks_cfg = &self.config.blocks;
        let blocksize = blocks_cfg.blocksize;
        let block_alg = blocks_cfg.block_hash;

        let mut stream_hasher = StreamHasher::new(blocks_cfg.file_hash);
        let mut blocklist = Vec::with_capacity(blocksize);
        let mut blocklist_hashes = Vec::new();
        let mut blocks: Vec<IndexedBlock> = Vec::new();
        let mut total = 0u64;

        let mut current = Vec::with_capacity(blocksize);
        let mut spare = Vec::with_capacity(blocksize);
        let mut current_hash = read_block(reader, &mut current, blocksize, block_alg)?;

        while let Some(hash) = current_hash {
            self.control.ensure_not_terminated()?;

            // Stream-hash this block while the next one is read and hashed.
            let (_, next) = rayon::join(
                || stream_hasher.update(&current),
                || read_block(reader, &mut spare, blocksize, block_alg),
            );
            let next = next?;

            let size = current.len() as u64;
            total += size;
            blocks.push(IndexedBlock { hash, size });
            let returned = self.emit(hash, current, hint, false)?;
            self.push_blocklist_hash(&mut blocklist, &mut blocklist_hashes, hash)?;

            current = spare;
            spare = returned;
            current_hash = next;
        }

        if blocks.len() > 1 && !blocklist.is_empty() {
            self.flush_blocklist(&mut blocklist, &mut blocklist_hashes)?;
        }

        let hash = stream_hasher.finalize();
        let blockset = self.db.register_blockset(NewBlockset {
            hash,
            size: total,
            blocks,
            blocklist_hashes,
        })?;
        Ok(StreamResult {
            hash,
            size: total,
            blockset,
        })
    }

    fn push_blocklist_hash(
        &self,
        blocklist: &mut Vec<u8>,
        blocklist_hashes: &mut Vec<BlockHash>,
        hash: BlockHash,
    ) -> Result<()> {
        if blocklist.len() + hash.as_bytes().len() > self.config.blocks.blocksize {
            self.flush_blocklist(blocklist, blocklist_hashes)?;
        }
        blocklist.extend_from_slice(hash.as_bytes());
        Ok(())
    }

    fn flush_blocklist(&self, blocklist: &mut Vec<u8>, blocklist_hashes: &mut Vec<BlockHash>) -> Result<()> {
        let hash = BlockHash::compute(self.config.blocks.block_hash, blocklist);
        let data = std::mem::take(blocklist);
        let mut returned = self.emit(hash, data, CompressionHint::Noncompressible, true)?;
        returned.clear();
        *blocklist = returned;
        blocklist_hashes.push(hash);
        Ok(())
    }

    /// Send one block to the packers and wait for its verdict.
    fn emit(&self, hash: BlockHash, data: Vec<u8>, hint: CompressionHint, is_blocklist: bool) -> Result<Vec<u8>> {
        let (reply, pending) = channel::reply();
        self.blocks
            .send(BlockMessage {
                hash,
                size: data.len() as u64,
                data,
                hint,
                is_blocklist,
                reply,
            })
            .map_err(|_| DupError::Canceled)?;
        Ok(pending.wait()?.buffer)
    }
}

/// Fill `buf` with up to `blocksize` bytes and hash them. `None` at end of
/// stream.
fn read_block(
    reader: &mut (dyn Read + Send),
    buf: &mut Vec<u8>,
    blocksize: usize,
    algorithm: HashAlgorithm,
) -> Result<Option<BlockHash>> {
    buf.resize(blocksize, 0);
    let mut filled = 0;
    while filled < blocksize {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                buf.clear();
                return Err(e.into());
            }
        }
    }
    buf.truncate(filled);
    if filled == 0 {
        return Ok(None);
    }
    Ok(Some(BlockHash::compute(algorithm, buf)))
}
