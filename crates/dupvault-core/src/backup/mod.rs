//! The backup pipeline.
//!
//! ```text
//! sources -> file processors -> chunkers -> packers -> uploader
//!                                              \-> spill -/
//! ```
//!
//! Every stage is a thread connected by bounded channels; the database is a
//! separate actor reached through [`DatabaseHandle`].

pub mod chunker;
pub mod file_processor;
pub mod filelist;
pub mod index_repair;
pub mod packer;
pub mod spill;
pub mod upload_request;
pub mod uploader;
pub mod volumes;

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use tracing::{debug, info, warn};

use dupvault_storage::SharedBackendFactory;
use dupvault_types::error::{DupError, Result};
use dupvault_types::ids::FilesetId;

use crate::channel::{self, Receiver};
use crate::codec;
use crate::config::BackupConfig;
use crate::control::TaskControl;
use crate::db::DatabaseHandle;
use crate::limits::LiveTunables;
use crate::stats::{BackupStats, StatsSnapshot};

pub use self::file_processor::{SourceContent, SourceEntry};

use self::chunker::Chunker;
use self::file_processor::FileProcessor;
use self::packer::Packer;
use self::spill::SpillCollector;
use self::upload_request::UploadRequest;
use self::uploader::{UploadContext, Uploader};
use self::volumes::{OpenVolume, VolumeOpener};

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub fileset: FilesetId,
    /// Fileset uploaded on behalf of an interrupted earlier run.
    pub synthetic_fileset: Option<FilesetId>,
    /// Source size of the last block volume handed to the uploader.
    pub last_volume_size: u64,
    pub stats: StatsSnapshot,
}

/// A failed run: the first error, plus what was done before it.
#[derive(Debug, thiserror::Error)]
#[error("backup failed: {error}")]
pub struct BackupFailure {
    #[source]
    pub error: DupError,
    pub stats: StatsSnapshot,
}

/// One backup run. Hands out its control, statistics and live tunables so
/// callers can pause, stop or re-throttle it from another thread.
pub struct Backup {
    config: Arc<BackupConfig>,
    backends: SharedBackendFactory,
    db: DatabaseHandle,
    control: Arc<TaskControl>,
    stats: Arc<BackupStats>,
    tunables: Arc<LiveTunables>,
}

impl Backup {
    pub fn new(config: BackupConfig, backends: SharedBackendFactory, db: DatabaseHandle) -> Self {
        let tunables = Arc::new(LiveTunables::from_config(&config.limits));
        Self {
            config: Arc::new(config),
            backends,
            db,
            control: Arc::new(TaskControl::new()),
            stats: Arc::new(BackupStats::default()),
            tunables,
        }
    }

    pub fn with_control(mut self, control: Arc<TaskControl>) -> Self {
        self.control = control;
        self
    }

    pub fn control(&self) -> Arc<TaskControl> {
        Arc::clone(&self.control)
    }

    pub fn stats(&self) -> Arc<BackupStats> {
        Arc::clone(&self.stats)
    }

    pub fn tunables(&self) -> Arc<LiveTunables> {
        Arc::clone(&self.tunables)
    }

    /// Back up `sources` and upload the resulting fileset.
    pub fn run<I>(self, sources: I) -> std::result::Result<BackupOutcome, BackupFailure>
    where
        I: IntoIterator<Item = SourceEntry>,
    {
        let result = self.execute(sources);
        let stats = self.stats.snapshot();
        match result {
            Ok(mut outcome) => {
                outcome.stats = stats;
                info!(
                    files = outcome.stats.processed_files,
                    added_blocks = outcome.stats.added_blocks,
                    uploaded_volumes = outcome.stats.uploaded_volumes,
                    "backup complete"
                );
                Ok(outcome)
            }
            Err(error) => {
                if let Err(e) = self.db.rollback() {
                    warn!(error = %e, "rollback after failed backup failed");
                }
                warn!(error = %error, "backup failed");
                Err(BackupFailure { error, stats })
            }
        }
    }

    fn execute<I>(&self, sources: I) -> Result<BackupOutcome>
    where
        I: IntoIterator<Item = SourceEntry>,
    {
        self.config.validate()?;
        let config = &self.config;
        let codec = codec::from_config(config)?;
        let depth = config.concurrency.channel_depth;

        let (upload_tx, upload_rx) = channel::bounded::<UploadRequest>(depth);
        let opener = VolumeOpener::new(Arc::clone(config), self.db.clone(), upload_tx);
        let ctx = Arc::new(UploadContext::new(
            Arc::clone(config),
            Arc::clone(&self.backends),
            self.db.clone(),
            codec,
            Arc::clone(&self.control),
            Arc::clone(&self.stats),
            Arc::clone(&self.tunables),
        ));

        thread::scope(|s| {
            let uploader = thread::Builder::new()
                .name("dupvault-uploader".into())
                .spawn_scoped(s, move || Uploader::new(ctx).run(upload_rx))?;

            let result = self.pipeline(s, &opener, sources);
            if let Err(e) = &result {
                if !e.is_cancellation() {
                    self.control.terminate();
                }
            }
            // The uploader exits once every request sender is gone.
            drop(opener);
            let uploaded = uploader
                .join()
                .map_err(|_| DupError::Other("uploader thread panicked".into()))
                .and_then(|r| r);

            match (result, uploaded) {
                (Ok(outcome), Ok(())) => Ok(outcome),
                (Ok(_), Err(e)) => Err(e),
                (Err(e), Err(upload_err)) if e.is_cancellation() => Err(upload_err),
                (Err(e), _) => Err(e),
            }
        })
    }

    fn pipeline<'scope, 'env, I>(
        &'env self,
        s: &'scope thread::Scope<'scope, 'env>,
        opener: &VolumeOpener,
        sources: I,
    ) -> Result<BackupOutcome>
    where
        I: IntoIterator<Item = SourceEntry>,
    {
        let config = &self.config;
        let concurrency = &config.concurrency;
        let depth = concurrency.channel_depth;

        index_repair::queue_missing_indexes(opener)?;
        let synthetic = if config.disable_synthetic_filelist {
            None
        } else {
            filelist::queue_synthetic_fileset(opener)?
        };
        let fileset = filelist::begin_fileset(opener, Utc::now())?;

        let (entry_tx, entry_rx) = channel::bounded::<SourceEntry>(depth);
        let (stream_tx, stream_rx) = channel::bounded(depth);
        let (block_tx, block_rx) = channel::bounded(depth);

        let mut packers = Vec::with_capacity(concurrency.compressors);
        for i in 0..concurrency.compressors {
            let packer = Packer::new(opener.clone(), Arc::clone(&self.control), Arc::clone(&self.stats));
            let rx = block_rx.clone();
            packers.push(
                thread::Builder::new()
                    .name(format!("dupvault-packer-{i}"))
                    .spawn_scoped(s, move || packer.run(rx))?,
            );
        }
        for i in 0..concurrency.block_hashers {
            let chunker = Chunker::new(
                Arc::clone(config),
                self.db.clone(),
                block_tx.clone(),
                Arc::clone(&self.control),
            );
            let rx = stream_rx.clone();
            thread::Builder::new()
                .name(format!("dupvault-chunker-{i}"))
                .spawn_scoped(s, move || chunker.run(rx))?;
        }
        let mut processors = Vec::with_capacity(concurrency.file_processors);
        for i in 0..concurrency.file_processors {
            let processor = FileProcessor::new(
                Arc::clone(config),
                self.db.clone(),
                stream_tx.clone(),
                Arc::clone(&self.control),
                Arc::clone(&self.stats),
                fileset.id,
            );
            let rx: Receiver<SourceEntry> = entry_rx.clone();
            processors.push(
                thread::Builder::new()
                    .name(format!("dupvault-files-{i}"))
                    .spawn_scoped(s, move || processor.run(rx))?,
            );
        }
        // Channels close only once every worker holding a clone exits.
        drop(block_tx);
        drop(block_rx);
        drop(stream_tx);
        drop(stream_rx);
        drop(entry_rx);

        for entry in sources {
            if self.control.ensure_running().is_err() || entry_tx.send(entry).is_err() {
                break;
            }
        }
        drop(entry_tx);

        let mut first_error: Option<DupError> = None;
        let mut record = |e: DupError, control: &TaskControl| {
            if !e.is_cancellation() {
                control.terminate();
            }
            match &first_error {
                Some(prev) if !prev.is_cancellation() => {}
                _ => first_error = Some(e),
            }
        };

        for handle in processors {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => record(e, &self.control),
                Err(_) => record(DupError::Other("file processor panicked".into()), &self.control),
            }
        }
        let mut leftovers: Vec<OpenVolume> = Vec::new();
        for handle in packers {
            match handle.join() {
                Ok(Ok(Some(volume))) => leftovers.push(volume),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => record(e, &self.control),
                Err(_) => record(DupError::Other("packer panicked".into()), &self.control),
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        self.control.ensure_not_terminated()?;
        debug!(leftovers = leftovers.len(), "packers retired");

        SpillCollector::new(opener.clone(), Arc::clone(&self.control)).run(leftovers)?;
        filelist::queue_fileset(opener, &fileset)?;

        let (reply, pending) = channel::reply();
        opener
            .uploads()
            .send(UploadRequest::Flush { reply })
            .map_err(|_| DupError::Canceled)?;
        let last_volume_size = pending.wait()?;

        self.db.mark_fileset_complete(fileset.id)?;
        if let Some(synthetic) = &synthetic {
            self.db.mark_fileset_complete(synthetic.id)?;
        }
        self.db.commit("backup-complete")?;

        Ok(BackupOutcome {
            fileset: fileset.id,
            synthetic_fileset: synthetic.map(|f| f.id),
            last_volume_size,
            stats: StatsSnapshot::default(),
        })
    }
}

/// Run one backup with a caller-supplied control.
pub fn run<I>(
    config: BackupConfig,
    backends: SharedBackendFactory,
    db: DatabaseHandle,
    sources: I,
    control: Arc<TaskControl>,
) -> std::result::Result<BackupOutcome, BackupFailure>
where
    I: IntoIterator<Item = SourceEntry>,
{
    Backup::new(config, backends, db)
        .with_control(control)
        .run(sources)
}
