use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters collected while a backup runs. Shared by every stage.
#[derive(Debug, Default)]
pub struct BackupStats {
    pub examined_files: AtomicU64,
    pub processed_files: AtomicU64,
    pub skipped_files: AtomicU64,
    pub processed_bytes: AtomicU64,
    pub added_blocks: AtomicU64,
    pub added_bytes: AtomicU64,
    pub deduplicated_blocks: AtomicU64,
    pub uploaded_volumes: AtomicU64,
    pub uploaded_bytes: AtomicU64,
    pub retries: AtomicU64,
    pub renames: AtomicU64,
    /// Set while the uploader waits for in-flight uploads before accepting more.
    pub blocking: AtomicBool,
}

/// Plain copy of [`BackupStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub examined_files: u64,
    pub processed_files: u64,
    pub skipped_files: u64,
    pub processed_bytes: u64,
    pub added_blocks: u64,
    pub added_bytes: u64,
    pub deduplicated_blocks: u64,
    pub uploaded_volumes: u64,
    pub uploaded_bytes: u64,
    pub retries: u64,
    pub renames: u64,
}

impl BackupStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            examined_files: get(&self.examined_files),
            processed_files: get(&self.processed_files),
            skipped_files: get(&self.skipped_files),
            processed_bytes: get(&self.processed_bytes),
            added_blocks: get(&self.added_blocks),
            added_bytes: get(&self.added_bytes),
            deduplicated_blocks: get(&self.deduplicated_blocks),
            uploaded_volumes: get(&self.uploaded_volumes),
            uploaded_bytes: get(&self.uploaded_bytes),
            retries: get(&self.retries),
            renames: get(&self.renames),
        }
    }
}
