use std::cell::RefCell;
use std::io::Read;

use serde::{Deserialize, Serialize};

use dupvault_types::error::{DupError, Result};

use crate::config::CompressionAlgorithm;

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Upper bound on decompressed output; guards against decompression bombs.
const MAX_DECOMPRESS_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Lz4,
    Zstd { level: i32 },
}

impl Compression {
    pub fn from_algorithm(algorithm: CompressionAlgorithm, zstd_level: i32) -> Self {
        match algorithm {
            CompressionAlgorithm::None => Compression::None,
            CompressionAlgorithm::Lz4 => Compression::Lz4,
            CompressionAlgorithm::Zstd => Compression::Zstd { level: zstd_level },
        }
    }
}

/// Per-block hint from the producer about whether compression is worth trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionHint {
    #[default]
    Default,
    Compressible,
    Noncompressible,
}

/// Compress `data` and prepend a 1-byte codec tag. Noncompressible blocks and
/// blocks that do not shrink are stored raw.
pub fn compress(compression: Compression, hint: CompressionHint, data: &[u8]) -> Result<Vec<u8>> {
    if hint == CompressionHint::Noncompressible {
        return Ok(store_raw(data));
    }
    let (tag, compressed) = match compression {
        Compression::None => return Ok(store_raw(data)),
        Compression::Lz4 => (TAG_LZ4, lz4_flex::compress_prepend_size(data)),
        Compression::Zstd { level } => (TAG_ZSTD, zstd_bulk(level, data)?),
    };
    if compressed.len() >= data.len() {
        return Ok(store_raw(data));
    }
    let mut out = Vec::with_capacity(1 + compressed.len());
    out.push(tag);
    out.extend_from_slice(&compressed);
    Ok(out)
}

fn store_raw(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + data.len());
    out.push(TAG_NONE);
    out.extend_from_slice(data);
    out
}

fn zstd_bulk(level: i32, data: &[u8]) -> Result<Vec<u8>> {
    thread_local! {
        static ZSTD_CX: RefCell<Option<(i32, zstd::bulk::Compressor<'static>)>> =
            const { RefCell::new(None) };
    }

    ZSTD_CX.with(|cell| {
        let mut slot = cell.borrow_mut();
        if !matches!(slot.as_ref(), Some((l, _)) if *l == level) {
            let cx = zstd::bulk::Compressor::new(level)
                .map_err(|e| DupError::Other(format!("zstd init: {e}")))?;
            *slot = Some((level, cx));
        }
        let Some((_, cx)) = slot.as_mut() else {
            return Err(DupError::Other("zstd compressor unavailable".into()));
        };
        cx.compress(data)
            .map_err(|e| DupError::Other(format!("zstd compress: {e}")))
    })
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(DupError::Decompression("empty data".into()));
    };
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            let Some(size_bytes) = payload.get(..4) else {
                return Err(DupError::Decompression("lz4: payload too short".into()));
            };
            let mut size = [0u8; 4];
            size.copy_from_slice(size_bytes);
            let uncompressed_size = u32::from_le_bytes(size) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(DupError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| DupError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| DupError::Decompression(format!("zstd init: {e}")))?;
            let mut output = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| DupError::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(DupError::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        _ => Err(DupError::UnknownCompressionTag(tag)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible() -> Vec<u8> {
        b"abcdefgh".repeat(512)
    }

    #[test]
    fn each_codec_restores_input() {
        let data = compressible();
        for c in [
            Compression::None,
            Compression::Lz4,
            Compression::Zstd { level: 3 },
        ] {
            let packed = compress(c, CompressionHint::Default, &data).unwrap();
            assert_eq!(decompress(&packed).unwrap(), data, "{c:?}");
        }
    }

    #[test]
    fn compressible_data_shrinks() {
        let data = compressible();
        let packed = compress(Compression::Zstd { level: 3 }, CompressionHint::Default, &data).unwrap();
        assert_eq!(packed[0], TAG_ZSTD);
        assert!(packed.len() < data.len());
    }

    #[test]
    fn noncompressible_hint_stores_raw() {
        let data = compressible();
        let packed = compress(Compression::Lz4, CompressionHint::Noncompressible, &data).unwrap();
        assert_eq!(packed[0], TAG_NONE);
        assert_eq!(&packed[1..], &data[..]);
    }

    #[test]
    fn incompressible_data_falls_back_to_raw() {
        let data: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
        let packed = compress(Compression::Zstd { level: 3 }, CompressionHint::Default, &data).unwrap();
        assert_eq!(packed[0], TAG_NONE);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(decompress(&[]).is_err());
        assert!(matches!(
            decompress(&[0x7f, 1, 2]),
            Err(DupError::UnknownCompressionTag(0x7f))
        ));
        assert!(decompress(&[TAG_LZ4, 1]).is_err());
    }
}
