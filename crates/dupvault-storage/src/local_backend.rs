use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use dupvault_types::error::{DupError, Result};
use tracing::debug;

use crate::{ProgressFn, RemoteEntry, StorageBackend, StreamingBackend};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Directory-backed storage target. Remote names map to flat files under `root`.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`. The directory does not need to exist;
    /// uploads into a missing root fail with `FolderMissing`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root_path: PathBuf = root.into();
        // Canonicalize existing roots so symlinked targets list consistently.
        let root = fs::canonicalize(&root_path).unwrap_or(root_path);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject names that could escape the target folder.
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(DupError::InvalidFilename("empty remote name".into()));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(DupError::InvalidFilename(format!(
                "remote name contains a path separator: '{name}'"
            )));
        }
        if Path::new(name)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(DupError::InvalidFilename(format!(
                "remote name is not a plain file name: '{name}'"
            )));
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn ensure_root(&self) -> Result<()> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(DupError::Backend(format!(
                "target is not a directory: {}",
                self.root.display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(DupError::FolderMissing(
                self.root.display().to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream `source` into a temp file next to the target, then rename into
    /// place. Readers never see a partial object.
    fn atomic_copy(
        &self,
        path: &Path,
        source: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        self.ensure_root()?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut written = 0u64;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            tmp.write_all(&buf[..n])?;
            written += n as u64;
            progress(written);
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(written)
    }
}

impl StorageBackend for LocalBackend {
    fn put(&mut self, remote_name: &str, source: &Path) -> Result<()> {
        let path = self.resolve(remote_name)?;
        let mut file = fs::File::open(source)?;
        let written = self.atomic_copy(&path, &mut file, &mut |_| {})?;
        debug!(name = remote_name, bytes = written, "stored object");
        Ok(())
    }

    fn list(&mut self) -> Result<Vec<RemoteEntry>> {
        self.ensure_root()?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // In-flight temp files from atomic_copy.
            if name.starts_with(".tmp") {
                continue;
            }
            entries.push(RemoteEntry {
                name,
                size: meta.len() as i64,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn create_folder(&mut self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        self.root = fs::canonicalize(&self.root)?;
        Ok(())
    }

    fn as_streaming(&mut self) -> Option<&mut dyn StreamingBackend> {
        Some(self)
    }
}

impl StreamingBackend for LocalBackend {
    fn put_stream(
        &mut self,
        remote_name: &str,
        source: &mut dyn Read,
        progress: ProgressFn<'_>,
    ) -> Result<()> {
        let path = self.resolve(remote_name)?;
        let written = self.atomic_copy(&path, source, progress)?;
        debug!(name = remote_name, bytes = written, "streamed object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_local(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn validate_name_rejects_unsafe_names() {
        assert!(LocalBackend::validate_name("").is_err());
        assert!(LocalBackend::validate_name("/etc/passwd").is_err());
        assert!(LocalBackend::validate_name("..").is_err());
        assert!(LocalBackend::validate_name("a/b").is_err());
        assert!(LocalBackend::validate_name("a\\b").is_err());
        assert!(LocalBackend::validate_name("dupvault-20240101T000000Z-ab.dblock.zstd").is_ok());
    }

    #[test]
    fn put_into_missing_root_reports_folder_missing() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_local(dir.path(), "src", b"payload");
        let mut backend = LocalBackend::new(dir.path().join("missing"));

        let err = backend.put("obj", &src).unwrap_err();
        assert!(err.is_folder_missing(), "got {err:?}");

        backend.create_folder().unwrap();
        backend.put("obj", &src).unwrap();
        let listed = backend.list().unwrap();
        assert_eq!(
            listed,
            vec![RemoteEntry {
                name: "obj".into(),
                size: 7
            }]
        );
    }

    #[test]
    fn put_overwrites_existing_object() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::create_dir(&target).unwrap();
        let mut backend = LocalBackend::new(&target);

        let v1 = write_local(dir.path(), "v1", b"version1");
        let v2 = write_local(dir.path(), "v2", b"v2");
        backend.put("manifest", &v1).unwrap();
        backend.put("manifest", &v2).unwrap();
        assert_eq!(fs::read(target.join("manifest")).unwrap(), b"v2");
    }

    #[test]
    fn put_stream_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = LocalBackend::new(dir.path());
        let data = vec![7u8; COPY_BUF_SIZE * 2 + 10];
        let mut seen = Vec::new();

        backend
            .as_streaming()
            .unwrap()
            .put_stream("streamed", &mut data.as_slice(), &mut |n| seen.push(n))
            .unwrap();

        assert_eq!(seen.last().copied(), Some(data.len() as u64));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(fs::read(dir.path().join("streamed")).unwrap(), data);
    }

    #[test]
    fn list_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        write_local(dir.path(), "b", b"22");
        write_local(dir.path(), "a", b"1");
        let mut backend = LocalBackend::new(dir.path());

        let names: Vec<_> = backend.list().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
