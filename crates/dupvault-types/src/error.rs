use thiserror::Error;

pub type Result<T> = std::result::Result<T, DupError>;

#[derive(Debug, Error)]
pub enum DupError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("remote folder is missing: {0}")]
    FolderMissing(String),

    #[error("operation canceled")]
    Canceled,

    #[error("list verify failed: {0}")]
    ListVerify(String),

    #[error("invalid volume format: {0}")]
    InvalidFormat(String),

    #[error("invalid remote filename: '{0}'")]
    InvalidFilename(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("remote volume not registered: '{0}'")]
    VolumeNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl DupError {
    /// Per-path errors that skip a single source entry instead of failing the run.
    pub fn is_soft_file_error(&self) -> bool {
        match self {
            DupError::Io(e) => is_soft_io_error(e),
            _ => false,
        }
    }

    /// Cancellation bypasses retry loops and is never reported as a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DupError::Canceled)
    }

    pub fn is_folder_missing(&self) -> bool {
        matches!(self, DupError::FolderMissing(_))
    }
}

/// Returns `true` for I/O errors that only affect the path being read
/// (permission denied, not found, locked, name too long).
pub fn is_soft_io_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    if matches!(
        e.kind(),
        ErrorKind::PermissionDenied | ErrorKind::NotFound | ErrorKind::WouldBlock
    ) {
        return true;
    }
    // ENAMETOOLONG (36 on Linux, 63 on macOS/BSD) has no stable ErrorKind.
    #[cfg(unix)]
    if let Some(code) = e.raw_os_error() {
        return code == 36 || code == 63;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn soft_io_errors_are_classified() {
        for kind in [
            ErrorKind::PermissionDenied,
            ErrorKind::NotFound,
            ErrorKind::WouldBlock,
        ] {
            let err = DupError::Io(Error::new(kind, "test"));
            assert!(err.is_soft_file_error(), "{kind:?} should be soft");
        }
    }

    #[test]
    fn hard_errors_are_not_soft() {
        let err = DupError::Io(Error::new(ErrorKind::InvalidData, "test"));
        assert!(!err.is_soft_file_error());
        assert!(!DupError::Backend("boom".into()).is_soft_file_error());
        assert!(!DupError::Canceled.is_soft_file_error());
    }

    #[test]
    fn cancellation_and_folder_missing_predicates() {
        assert!(DupError::Canceled.is_cancellation());
        assert!(!DupError::Backend("x".into()).is_cancellation());
        assert!(DupError::FolderMissing("/x".into()).is_folder_missing());
        assert!(!DupError::Canceled.is_folder_missing());
    }
}
