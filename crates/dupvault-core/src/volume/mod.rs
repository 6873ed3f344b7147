pub mod block_volume;
pub mod fileset_volume;
pub mod index_volume;

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::TempPath;

use dupvault_types::error::{DupError, Result};

pub use self::block_volume::{BlockVolumeReader, BlockVolumeWriter, ClosedBlockVolume, VolumeEntry};
pub use self::fileset_volume::{ContentRef, FilesetEntry, FilesetManifest};
pub use self::index_volume::{BlocklistBlock, IndexManifest, IndexedBlock, PendingIndex};

const MANIFEST_VERSION: u8 = 1;
const MANIFEST_ZSTD_LEVEL: i32 = 3;

/// A closed manifest-style volume (index or fileset) awaiting upload.
pub struct ClosedManifestVolume {
    pub name: String,
    pub path: TempPath,
    pub size: u64,
}

/// Write `[magic][version][zstd(msgpack(value))]` to a fresh temp file.
pub(crate) fn write_manifest<T: Serialize>(
    dir: &Path,
    prefix: &str,
    magic: &[u8; 8],
    value: &T,
) -> Result<(TempPath, u64)> {
    let packed = rmp_serde::to_vec(value)?;
    let compressed = zstd::bulk::compress(&packed, MANIFEST_ZSTD_LEVEL)
        .map_err(|e| DupError::Other(format!("zstd compress: {e}")))?;

    let mut file = tempfile::Builder::new().prefix(prefix).tempfile_in(dir)?;
    file.write_all(magic)?;
    file.write_all(&[MANIFEST_VERSION])?;
    file.write_all(&compressed)?;
    file.as_file().sync_all()?;
    let size = (magic.len() + 1 + compressed.len()) as u64;
    Ok((file.into_temp_path(), size))
}

pub(crate) fn read_manifest<T: DeserializeOwned>(magic: &[u8; 8], data: &[u8]) -> Result<T> {
    if data.len() < magic.len() + 1 || &data[..magic.len()] != magic {
        return Err(DupError::InvalidFormat("bad manifest magic".into()));
    }
    let version = data[magic.len()];
    if version != MANIFEST_VERSION {
        return Err(DupError::InvalidFormat(format!(
            "unsupported manifest version {version}"
        )));
    }
    let packed = zstd::stream::decode_all(&data[magic.len() + 1..])
        .map_err(|e| DupError::Decompression(format!("zstd: {e}")))?;
    Ok(rmp_serde::from_slice(&packed)?)
}
