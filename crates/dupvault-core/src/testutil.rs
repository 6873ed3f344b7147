use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dupvault_storage::{RemoteEntry, SharedBackendFactory, StorageBackend};
use dupvault_types::error::{DupError, Result};

use crate::backup::uploader::UploadContext;
use crate::codec::PlaintextCodec;
use crate::config::{BackupConfig, CompressionAlgorithm, IndexPolicy};
use crate::control::TaskControl;
use crate::db::{DatabaseActor, DatabaseHandle, MemoryDatabase};
use crate::limits::LiveTunables;
use crate::stats::BackupStats;

/// Shared state behind every [`MemoryBackend`] connection of one test.
#[derive(Default)]
struct StoreInner {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    attempts: Mutex<Vec<String>>,
    fail_puts: AtomicUsize,
    folder_missing: AtomicBool,
    folders_created: AtomicUsize,
    connections: AtomicUsize,
    put_delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// In-memory remote target with failure injection.
#[derive(Clone, Default)]
pub struct RemoteStore {
    inner: Arc<StoreInner>,
}

impl RemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` puts with a transient backend error.
    pub fn fail_next_puts(&self, n: usize) -> &Self {
        self.inner.fail_puts.store(n, Ordering::SeqCst);
        self
    }

    /// Report the target folder as missing until `create_folder` is called.
    pub fn without_folder(&self) -> &Self {
        self.inner.folder_missing.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_put_delay(&self, delay: Duration) -> &Self {
        self.inner
            .put_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn factory(&self) -> SharedBackendFactory {
        let store = self.clone();
        Arc::new(move || -> Result<Box<dyn StorageBackend>> {
            store.inner.connections.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MemoryBackend {
                store: store.clone(),
            }))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn names_with_suffix(&self, suffix: &str) -> Vec<String> {
        self.names()
            .into_iter()
            .filter(|n| n.contains(suffix))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.objects.lock().unwrap().get(name).cloned()
    }

    /// Every remote name a put was attempted for, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.inner.attempts.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    pub fn folders_created(&self) -> usize {
        self.inner.folders_created.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

/// One connection to a [`RemoteStore`]. Whole-file puts only.
pub struct MemoryBackend {
    store: RemoteStore,
}

impl StorageBackend for MemoryBackend {
    fn put(&mut self, remote_name: &str, source: &Path) -> Result<()> {
        let inner = &self.store.inner;
        inner.attempts.lock().unwrap().push(remote_name.to_string());
        if inner.folder_missing.load(Ordering::SeqCst) {
            return Err(DupError::FolderMissing("memory://target".into()));
        }
        let injected = inner
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DupError::Backend(format!("injected failure for {remote_name}")));
        }

        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = inner.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let data = std::fs::read(source);
        inner.in_flight.fetch_sub(1, Ordering::SeqCst);

        inner
            .objects
            .lock()
            .unwrap()
            .insert(remote_name.to_string(), data?);
        Ok(())
    }

    fn list(&mut self) -> Result<Vec<RemoteEntry>> {
        Ok(self
            .store
            .inner
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(name, data)| RemoteEntry {
                name: name.clone(),
                size: data.len() as i64,
            })
            .collect())
    }

    fn create_folder(&mut self) -> Result<()> {
        self.store.inner.folder_missing.store(false, Ordering::SeqCst);
        self.store.inner.folders_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Small blocks and volumes, no retry delay, temp files under `dir`.
pub fn test_config(dir: &Path) -> BackupConfig {
    let mut config = BackupConfig::default();
    config.blocks.blocksize = 100;
    config.blocks.volume_size = 1000;
    config.blocks.index_policy = IndexPolicy::Full;
    config.blocks.compression.algorithm = CompressionAlgorithm::None;
    config.upload.number_of_retries = 2;
    config.upload.retry_delay_ms = 0;
    config.upload.prefix = "test".into();
    config.concurrency.file_processors = 2;
    config.concurrency.block_hashers = 2;
    config.concurrency.compressors = 2;
    config.concurrency.channel_depth = 4;
    config.temp_dir = Some(dir.to_path_buf());
    config
}

/// Deterministic pseudo-random bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_left(seed as u32 % 31) as u8 ^ seed)
        .collect()
}

/// Database actor on its own thread; the thread exits once every handle drops.
pub fn spawn_db() -> DatabaseHandle {
    DatabaseActor::spawn(MemoryDatabase::new()).unwrap().0
}

/// Uploader context over `store` with a plaintext codec.
pub fn upload_context(
    config: &Arc<BackupConfig>,
    store: &RemoteStore,
    db: &DatabaseHandle,
    control: &Arc<TaskControl>,
    stats: &Arc<BackupStats>,
) -> Arc<UploadContext> {
    Arc::new(UploadContext::new(
        Arc::clone(config),
        store.factory(),
        db.clone(),
        Arc::new(PlaintextCodec),
        Arc::clone(control),
        Arc::clone(stats),
        Arc::new(LiveTunables::from_config(&config.limits)),
    ))
}
