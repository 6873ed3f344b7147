pub mod local_backend;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use dupvault_types::error::Result;

pub use local_backend::LocalBackend;

/// One object reported by [`StorageBackend::list`]. `size` is `-1` when the
/// backend cannot report sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: i64,
}

/// Progress callback for streaming uploads; receives the running byte count.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64);

/// Remote storage contract. Implementations are used from a single upload
/// worker at a time; a fresh instance is created after a failed attempt.
pub trait StorageBackend: Send {
    /// Upload the whole local file under `remote_name`.
    fn put(&mut self, remote_name: &str, source: &Path) -> Result<()>;

    /// List all objects in the target folder.
    fn list(&mut self) -> Result<Vec<RemoteEntry>>;

    /// Create the target folder. Called after a `FolderMissing` failure.
    fn create_folder(&mut self) -> Result<()>;

    /// Streaming capability, if the backend supports it.
    fn as_streaming(&mut self) -> Option<&mut dyn StreamingBackend> {
        None
    }
}

/// Backends that accept a readable stream instead of a local path.
pub trait StreamingBackend {
    fn put_stream(
        &mut self,
        remote_name: &str,
        source: &mut dyn Read,
        progress: ProgressFn<'_>,
    ) -> Result<()>;
}

/// Creates backend connections on demand.
pub trait BackendFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn StorageBackend>>;
}

impl<F> BackendFactory for F
where
    F: Fn() -> Result<Box<dyn StorageBackend>> + Send + Sync,
{
    fn connect(&self) -> Result<Box<dyn StorageBackend>> {
        self()
    }
}

pub type SharedBackendFactory = Arc<dyn BackendFactory>;
