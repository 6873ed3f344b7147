pub mod aes;

use std::path::Path;
use std::sync::Arc;

use dupvault_types::error::Result;

use crate::config::{BackupConfig, EncryptionMode};

pub use self::aes::AesCodec;

/// Whole-file transform applied to a closed volume just before upload.
pub trait VolumeCodec: Send + Sync {
    /// Module name embedded in remote filenames; `None` for plaintext.
    fn module_name(&self) -> Option<&'static str>;

    /// Rewrite the file at `path` in place. The size may change.
    fn encrypt_file(&self, path: &Path) -> Result<()>;

    /// Reverse [`encrypt_file`](Self::encrypt_file) on file contents.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through codec.
pub struct PlaintextCodec;

impl VolumeCodec for PlaintextCodec {
    fn module_name(&self) -> Option<&'static str> {
        None
    }

    fn encrypt_file(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Build the codec selected by `config.encryption`.
pub fn from_config(config: &BackupConfig) -> Result<Arc<dyn VolumeCodec>> {
    match config.encryption.mode {
        EncryptionMode::None => Ok(Arc::new(PlaintextCodec)),
        EncryptionMode::Aes => {
            let passphrase = config.encryption.passphrase.as_deref().unwrap_or_default();
            Ok(Arc::new(AesCodec::new(passphrase)?))
        }
    }
}
