//! The only stage that talks to the storage backend.
//!
//! Requests arrive over a bounded channel. Each accepted upload runs on its
//! own thread; the uploader keeps an ordered queue of `(weight, task)` and
//! stops accepting new work while the in-flight weight is at the limit.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use dupvault_storage::{SharedBackendFactory, StorageBackend};
use dupvault_types::error::{DupError, Result};
use dupvault_types::ids::VolumeId;
use dupvault_types::volume_name::RemoteVolumeType;

use crate::channel::{self, Pending, Receiver};
use crate::codec::VolumeCodec;
use crate::config::BackupConfig;
use crate::control::TaskControl;
use crate::db::{DatabaseHandle, RemoteVolumeState};
use crate::limits::{ByteRateLimiter, LiveTunables, ThrottledReader};
use crate::stats::BackupStats;
use crate::volume::PendingIndex;

use super::upload_request::{
    BlockVolumeUpload, ManifestUpload, UploadItem, UploadRequest, UploadState,
};

/// How often a blocked uploader re-checks the oldest task.
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything an upload task needs, shared by all tasks.
pub struct UploadContext {
    pub config: Arc<BackupConfig>,
    pub backends: SharedBackendFactory,
    pub db: DatabaseHandle,
    pub codec: Arc<dyn VolumeCodec>,
    pub control: Arc<TaskControl>,
    pub stats: Arc<BackupStats>,
    pub tunables: Arc<LiveTunables>,
    idle: Mutex<Vec<Box<dyn StorageBackend>>>,
}

impl UploadContext {
    pub fn new(
        config: Arc<BackupConfig>,
        backends: SharedBackendFactory,
        db: DatabaseHandle,
        codec: Arc<dyn VolumeCodec>,
        control: Arc<TaskControl>,
        stats: Arc<BackupStats>,
        tunables: Arc<LiveTunables>,
    ) -> Self {
        Self {
            config,
            backends,
            db,
            codec,
            control,
            stats,
            tunables,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn checkout(&self) -> Result<Box<dyn StorageBackend>> {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(backend) => Ok(backend),
            None => self.backends.connect(),
        }
    }

    fn checkin(&self, backend: Box<dyn StorageBackend>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(backend);
    }

    /// Encrypt, then put with retries. Returns once the remote copy is
    /// registered as uploaded and the local file is gone.
    pub fn upload_with_retry(&self, item: &mut UploadItem) -> Result<()> {
        let upload = &self.config.upload;
        item.encrypt(self.codec.as_ref())?;
        item.update_hash_and_size(self.config.blocks.file_hash)?;

        let attempts = upload.number_of_retries + 1;
        let mut backend: Option<Box<dyn StorageBackend>> = None;
        let mut last_err = None;

        for attempt in 1..=attempts {
            if attempt > 1 && !upload.retry_delay().is_zero() {
                self.control.sleep(upload.retry_delay())?;
            }
            self.control.ensure_not_terminated()?;

            let outcome = (|| -> Result<()> {
                if attempt > 1 {
                    item.state = UploadState::Retrying;
                    BackupStats::incr(&self.stats.retries);
                    item.rename_for_retry(&self.db)?;
                    BackupStats::incr(&self.stats.renames);
                }
                if backend.is_none() {
                    backend = Some(self.checkout()?);
                }
                let Some(conn) = backend.as_mut() else {
                    return Err(DupError::Backend("no backend connection".into()));
                };
                self.put(item, conn.as_mut())
            })();

            match outcome {
                Ok(()) => {
                    item.state = UploadState::Completed;
                    if let Some(conn) = backend.take() {
                        if !upload.no_connection_reuse {
                            self.checkin(conn);
                        }
                    }
                    return Ok(());
                }
                Err(e) if e.is_cancellation() => {
                    item.state = UploadState::Failed;
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        volume = %item.name,
                        attempt,
                        attempts,
                        error = %e,
                        "upload attempt failed"
                    );
                    let mut recovered = false;
                    if upload.autocreate_folders && e.is_folder_missing() {
                        if let Some(conn) = backend.as_mut() {
                            match conn.create_folder() {
                                Ok(()) => {
                                    info!("created missing remote folder");
                                    recovered = true;
                                }
                                Err(ce) => warn!(error = %ce, "failed to create remote folder"),
                            }
                        }
                    }
                    if !recovered || upload.no_connection_reuse {
                        backend = None;
                    }
                    last_err = Some(e);
                }
            }
        }

        item.state = UploadState::Failed;
        Err(last_err.unwrap_or_else(|| DupError::Backend("upload failed".into())))
    }

    fn put(&self, item: &mut UploadItem, backend: &mut dyn StorageBackend) -> Result<()> {
        let upload = &self.config.upload;
        item.state = UploadState::Uploading;
        self.db.update_volume(
            &item.name,
            RemoteVolumeState::Uploading,
            item.size as i64,
            item.hash,
        )?;

        if upload.dry_run {
            info!(volume = %item.name, size = item.size, "dry run: would upload volume");
            return item.delete_local();
        }

        let Some(path) = item.local_path().map(|p| p.to_path_buf()) else {
            return Err(DupError::Other(format!(
                "local file for {} already removed",
                item.name
            )));
        };

        let streaming = if upload.disable_streaming_transfers {
            None
        } else {
            backend.as_streaming()
        };
        match streaming {
            Some(streaming) => {
                let mut reader = ThrottledReader::new(File::open(&path)?, Arc::clone(&self.tunables));
                let limiter = ByteRateLimiter::new(self.tunables.upload_rate());
                let mut sent = 0u64;
                streaming.put_stream(&item.name, &mut reader, &mut |total| {
                    limiter.set_rate(self.tunables.upload_rate());
                    limiter.consume(total.saturating_sub(sent) as usize);
                    sent = total;
                })?;
            }
            None => backend.put(&item.name, &path)?,
        }

        if upload.list_verify_uploads {
            let listed = backend.list()?;
            match listed.iter().find(|e| e.name.eq_ignore_ascii_case(&item.name)) {
                None => {
                    return Err(DupError::ListVerify(format!(
                        "file not found after upload: {}",
                        item.name
                    )))
                }
                Some(e) if e.size >= 0 && e.size != item.size as i64 => {
                    return Err(DupError::ListVerify(format!(
                        "{}: size was {} but expected {}",
                        e.name, e.size, item.size
                    )))
                }
                Some(_) => {}
            }
        }

        self.db.update_volume(
            &item.name,
            RemoteVolumeState::Uploaded,
            item.size as i64,
            item.hash,
        )?;
        BackupStats::incr(&self.stats.uploaded_volumes);
        BackupStats::add(&self.stats.uploaded_bytes, item.size);
        debug!(volume = %item.name, size = item.size, "uploaded volume");

        item.delete_local()?;
        self.db.commit("upload-complete")
    }

    fn upload_block_and_index(
        &self,
        block: BlockVolumeUpload,
        index: Option<PendingIndex>,
    ) -> Result<()> {
        let block_id = block.id;
        let mut item = UploadItem::from_block(block);
        self.upload_with_retry(&mut item)?;

        let Some(index) = index else {
            return Ok(());
        };
        // The index names the block volume by its final (possibly renamed)
        // remote name and post-encryption hash.
        let hash = item.hash.ok_or_else(|| {
            DupError::Other(format!("no hash recorded for {}", item.name))
        })?;
        let manifest = index.materialize(&self.config.temp_dir(), &item.name, hash, item.size)?;
        let upload = ManifestUpload {
            id: index.id,
            volume: manifest,
        };
        self.upload_index(upload, Some(block_id))
    }

    fn upload_index(&self, index: ManifestUpload, block_volume: Option<VolumeId>) -> Result<()> {
        let index_id = index.id;
        let mut item = UploadItem::from_manifest(index, RemoteVolumeType::Index);
        self.upload_with_retry(&mut item)?;
        if let Some(block_id) = block_volume {
            self.db.link_index_to_volume(index_id, block_id)?;
            self.db.commit("index-link")?;
        }
        Ok(())
    }
}

struct InFlight {
    weight: usize,
    done: Pending<()>,
    handle: JoinHandle<()>,
}

impl InFlight {
    fn finish(self, result: Result<()>) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| DupError::Other("upload thread panicked".into()))?;
        result
    }
}

pub struct Uploader {
    ctx: Arc<UploadContext>,
    in_flight: VecDeque<InFlight>,
    deferred_filesets: Vec<ManifestUpload>,
    last_size: u64,
}

impl Uploader {
    pub fn new(ctx: Arc<UploadContext>) -> Self {
        Self {
            ctx,
            in_flight: VecDeque::new(),
            deferred_filesets: Vec::new(),
            last_size: 0,
        }
    }

    fn max_weight(&self) -> usize {
        self.ctx.config.upload.async_upload_limit
    }

    fn in_flight_weight(&self) -> usize {
        self.in_flight.iter().map(|t| t.weight).sum()
    }

    /// Serve requests until the channel retires. On error every in-flight
    /// task is cancelled and awaited before the error is returned.
    pub fn run(mut self, requests: Receiver<UploadRequest>) -> Result<()> {
        let result = self.serve(&requests);
        if let Err(e) = &result {
            if !e.is_cancellation() {
                self.ctx.control.terminate();
            }
            for task in self.in_flight.drain(..) {
                let _ = task.handle.join();
            }
            return result;
        }
        self.upload_deferred_filesets()?;
        self.drain()
    }

    fn serve(&mut self, requests: &Receiver<UploadRequest>) -> Result<()> {
        while let Ok(request) = requests.recv() {
            match request {
                UploadRequest::Volume { block, index } => {
                    let weight = if index.is_some() { 2 } else { 1 };
                    self.last_size = block.volume.size;
                    self.start(weight, move |ctx| ctx.upload_block_and_index(block, index))?;
                }
                UploadRequest::Index { index, block_volume } => {
                    self.start(1, move |ctx| ctx.upload_index(index, block_volume))?;
                }
                UploadRequest::Fileset { fileset } => {
                    debug!(volume = %fileset.volume.name, "deferring fileset upload until flush");
                    self.deferred_filesets.push(fileset);
                }
                UploadRequest::Flush { reply } => {
                    self.drain()?;
                    self.upload_deferred_filesets()?;
                    self.drain()?;
                    reply.ok(self.last_size);
                }
            }
        }
        Ok(())
    }

    fn upload_deferred_filesets(&mut self) -> Result<()> {
        for fileset in std::mem::take(&mut self.deferred_filesets) {
            self.start(1, move |ctx| {
                let mut item = UploadItem::from_manifest(fileset, RemoteVolumeType::Files);
                ctx.upload_with_retry(&mut item)
            })?;
        }
        Ok(())
    }

    /// Wait for capacity, then run `task` on its own thread.
    fn start<F>(&mut self, weight: usize, task: F) -> Result<()>
    where
        F: FnOnce(&UploadContext) -> Result<()> + Send + 'static,
    {
        self.reap_finished()?;
        let max = self.max_weight();
        if max > 0 {
            while !self.in_flight.is_empty() && self.in_flight_weight() >= max {
                self.wait_oldest(true)?;
            }
        }

        let (reply, done) = channel::reply();
        let ctx = Arc::clone(&self.ctx);
        let handle = std::thread::Builder::new()
            .name("dupvault-upload".into())
            .spawn(move || reply.send(task(&ctx)))?;
        self.in_flight.push_back(InFlight {
            weight,
            done,
            handle,
        });
        Ok(())
    }

    /// Block on the oldest task. With `blocking` set the statistics flag is
    /// raised for as long as the wait lasts.
    fn wait_oldest(&mut self, blocking: bool) -> Result<()> {
        let Some(oldest) = self.in_flight.pop_front() else {
            return Ok(());
        };
        if blocking {
            self.ctx.stats.set_blocking(true);
        }
        let result = loop {
            if let Some(result) = oldest.done.wait_timeout(BLOCKING_POLL_INTERVAL) {
                break result;
            }
        };
        if blocking {
            self.ctx.stats.set_blocking(false);
        }
        oldest.finish(result)
    }

    fn reap_finished(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.in_flight.len() {
            match self.in_flight[i].done.try_wait() {
                Some(result) => {
                    if let Some(task) = self.in_flight.remove(i) {
                        task.finish(result)?;
                    }
                }
                None => i += 1,
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        while !self.in_flight.is_empty() {
            self.wait_oldest(false)?;
        }
        Ok(())
    }
}
