use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use dupvault_types::error::{DupError, Result};
use dupvault_types::ids::FilesetId;

use crate::channel::{self, Receiver, Sender};
use crate::compress::CompressionHint;
use crate::config::BackupConfig;
use crate::control::{Flow, TaskControl};
use crate::db::DatabaseHandle;
use crate::stats::BackupStats;

use super::chunker::{StreamRequest, StreamResult, StreamSource};

pub enum SourceContent {
    /// Opened by the file processor when its turn comes.
    File(PathBuf),
    Reader(Box<dyn Read + Send>),
}

/// One changed file handed to the backup, with its already-extracted
/// metadata blob.
pub struct SourceEntry {
    pub path: String,
    pub content: SourceContent,
    pub metadata: Option<Vec<u8>>,
}

impl SourceEntry {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            path: path.to_string_lossy().into_owned(),
            content: SourceContent::File(path),
            metadata: None,
        }
    }

    pub fn from_reader(path: impl Into<String>, reader: impl Read + Send + 'static) -> Self {
        Self {
            path: path.into(),
            content: SourceContent::Reader(Box::new(reader)),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Turns source entries into fileset rows: chunks content and metadata and
/// records the file.
pub struct FileProcessor {
    config: Arc<BackupConfig>,
    db: DatabaseHandle,
    streams: Sender<StreamRequest>,
    control: Arc<TaskControl>,
    stats: Arc<BackupStats>,
    fileset: FilesetId,
}

impl FileProcessor {
    pub fn new(
        config: Arc<BackupConfig>,
        db: DatabaseHandle,
        streams: Sender<StreamRequest>,
        control: Arc<TaskControl>,
        stats: Arc<BackupStats>,
        fileset: FilesetId,
    ) -> Self {
        Self {
            config,
            db,
            streams,
            control,
            stats,
            fileset,
        }
    }

    /// Process entries until the channel retires or a stop is requested.
    /// Per-path read failures are logged and skipped.
    pub fn run(self, entries: Receiver<SourceEntry>) -> Result<()> {
        while let Ok(entry) = entries.recv() {
            match self.control.checkpoint() {
                Flow::Run => {}
                Flow::Stop => {
                    debug!(path = %entry.path, "stop requested, skipping file and taking no further files");
                    return Ok(());
                }
                Flow::Terminate => {
                    debug!(path = %entry.path, "terminated, skipping file");
                    return Err(DupError::Canceled);
                }
            }
            BackupStats::incr(&self.stats.examined_files);
            let path = entry.path.clone();
            match self.process(entry) {
                Ok(()) => BackupStats::incr(&self.stats.processed_files),
                Err(e) if e.is_soft_file_error() => {
                    warn!(path = %path, error = %e, "skipping unreadable file");
                    BackupStats::incr(&self.stats.skipped_files);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn process(&self, entry: SourceEntry) -> Result<()> {
        let SourceEntry {
            path,
            content,
            metadata,
        } = entry;
        let hint = if self.config.blocks.is_noncompressible(Path::new(&path)) {
            CompressionHint::Noncompressible
        } else {
            CompressionHint::Default
        };
        let reader: Box<dyn Read + Send> = match content {
            SourceContent::File(p) => Box::new(File::open(&p)?),
            SourceContent::Reader(r) => r,
        };

        let content = self.chunk(&path, StreamSource::Data(reader), hint)?;
        let metadata = match metadata {
            Some(blob) => Some(self.chunk(&path, StreamSource::Metadata(blob), CompressionHint::Default)?),
            None => None,
        };
        self.db.add_file(
            self.fileset,
            &path,
            content.blockset,
            metadata.map(|m| m.blockset),
        )?;
        BackupStats::add(&self.stats.processed_bytes, content.size);
        debug!(path = %path, size = content.size, "processed file");
        Ok(())
    }

    fn chunk(&self, label: &str, source: StreamSource, hint: CompressionHint) -> Result<StreamResult> {
        let (reply, pending) = channel::reply();
        self.streams
            .send(StreamRequest {
                label: label.to_string(),
                source,
                hint,
                reply,
            })
            .map_err(|_| DupError::Canceled)?;
        pending.wait()
    }
}
