use std::sync::Arc;

use tracing::{debug, warn};

use dupvault_types::error::{DupError, Result};

use crate::channel::Receiver;
use crate::config::IndexPolicy;
use crate::control::{Flow, TaskControl};
use crate::limits::CpuThrottle;
use crate::stats::BackupStats;

use super::chunker::{BlockMessage, BlockVerdict};
use super::volumes::{OpenVolume, VolumeOpener};

/// Deduplicating block packer. Each worker owns at most one open volume.
pub struct Packer {
    opener: VolumeOpener,
    control: Arc<TaskControl>,
    stats: Arc<BackupStats>,
    throttle: CpuThrottle,
    current: Option<OpenVolume>,
}

impl Packer {
    pub fn new(opener: VolumeOpener, control: Arc<TaskControl>, stats: Arc<BackupStats>) -> Self {
        let throttle = CpuThrottle::new(opener.config().limits.cpu_intensity);
        Self {
            opener,
            control,
            stats,
            throttle,
            current: None,
        }
    }

    /// Pack blocks until the channel retires. Returns the partially filled
    /// volume, if it holds anything worth uploading. A failure terminates the
    /// whole run.
    pub fn run(mut self, blocks: Receiver<BlockMessage>) -> Result<Option<OpenVolume>> {
        let result = self.serve(&blocks);
        if let Err(e) = &result {
            if !e.is_cancellation() {
                warn!(error = %e, "packer failed, terminating backup");
                self.control.terminate();
            }
        }
        result
    }

    fn serve(&mut self, blocks: &Receiver<BlockMessage>) -> Result<Option<OpenVolume>> {
        while let Ok(msg) = blocks.recv() {
            if self.control.checkpoint() == Flow::Terminate {
                msg.reply.fail(DupError::Canceled);
                return Err(DupError::Canceled);
            }
            self.pack(msg)?;
        }

        match self.current.take() {
            Some(volume) if !volume.is_empty() => {
                debug!(volume = %volume.name(), blocks = volume.writer.block_count(), "handing partial volume to spill");
                Ok(Some(volume))
            }
            Some(volume) => {
                self.opener.discard(volume)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn pack(&mut self, msg: BlockMessage) -> Result<()> {
        let config = self.opener.config();
        let full_index = config.blocks.index_policy == IndexPolicy::Full;
        let threshold = config.blocks.volume_close_threshold();
        let db = self.opener.db();

        if self.current.is_none() && !(msg.is_blocklist && full_index) {
            if db.find_block(msg.hash, msg.size)?.is_some() {
                BackupStats::incr(&self.stats.deduplicated_blocks);
                msg.reply.ok(BlockVerdict {
                    is_new: false,
                    buffer: msg.data,
                });
                return Ok(());
            }
        }

        if self.current.is_none() {
            self.current = Some(self.opener.open()?);
        }
        let Some(volume) = self.current.as_mut() else {
            return Err(DupError::Other("no open block volume".into()));
        };

        let is_new = db.insert_block_if_absent(msg.hash, msg.size, volume.id)?;
        if is_new {
            // Only compression counts against the CPU budget.
            let started = self.throttle.start();
            volume
                .writer
                .add_block(msg.hash, &msg.data, msg.hint, msg.is_blocklist)?;
            self.throttle.finish(started);
            if let Some(index) = volume.index.as_mut() {
                index.add_block(msg.hash, msg.size);
            }
            BackupStats::incr(&self.stats.added_blocks);
            BackupStats::add(&self.stats.added_bytes, msg.size);
        } else {
            BackupStats::incr(&self.stats.deduplicated_blocks);
        }

        if msg.is_blocklist && full_index {
            if let Some(index) = volume.index.as_mut() {
                if is_new || !db.is_blocklist_hash_known(msg.hash)? {
                    index.add_blocklist(msg.hash, &msg.data);
                }
            }
        }

        let full = volume.writer.size() > threshold;
        msg.reply.ok(BlockVerdict {
            is_new,
            buffer: msg.data,
        });

        if full {
            if let Some(volume) = self.current.take() {
                self.opener.submit(volume)?;
            }
        }
        Ok(())
    }
}
