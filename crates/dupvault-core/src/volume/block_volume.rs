use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};

use dupvault_types::block_hash::{BlockHash, HASH_SIZE};
use dupvault_types::error::{DupError, Result};

use crate::compress::{self, Compression, CompressionHint};

/// Magic bytes at the start of every block volume.
pub const BLOCK_VOLUME_MAGIC: &[u8; 8] = b"DVBLOCK\0";
pub const BLOCK_VOLUME_VERSION: u8 = 1;
/// Size of the header (magic + version byte).
pub const BLOCK_VOLUME_HEADER_SIZE: u64 = 9;
/// hash + raw size + offset + stored length + flags
pub const TRAILER_ENTRY_SIZE: u64 = HASH_SIZE as u64 + 8 + 8 + 4 + 1;
/// Trailing entry count.
const FOOTER_SIZE: u64 = 4;

const FLAG_BLOCKLIST: u8 = 0x01;

/// Location of one block inside a block volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeEntry {
    pub hash: BlockHash,
    /// Uncompressed block size.
    pub size: u64,
    /// Offset of the stored bytes (after the 4-byte length prefix).
    pub offset: u64,
    pub stored_len: u32,
    pub is_blocklist: bool,
}

/// Appends compressed blocks to a temp file.
///
/// Layout: `[magic][version]` then `[4B len][stored block]` per block, then a
/// fixed-size trailer entry per block and a 4-byte entry count.
#[derive(Debug)]
pub struct BlockVolumeWriter {
    name: String,
    compression: Compression,
    out: BufWriter<NamedTempFile>,
    entries: Vec<VolumeEntry>,
    data_bytes: u64,
}

impl BlockVolumeWriter {
    pub fn create(dir: &Path, name: String, compression: Compression) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("dupvault-dblock-")
            .tempfile_in(dir)?;
        let mut out = BufWriter::new(file);
        out.write_all(BLOCK_VOLUME_MAGIC)?;
        out.write_all(&[BLOCK_VOLUME_VERSION])?;
        Ok(Self {
            name,
            compression,
            out,
            entries: Vec::new(),
            data_bytes: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compress and append one block.
    pub fn add_block(
        &mut self,
        hash: BlockHash,
        data: &[u8],
        hint: CompressionHint,
        is_blocklist: bool,
    ) -> Result<()> {
        let stored = compress::compress(self.compression, hint, data)?;
        self.append(hash, data.len() as u64, &stored, is_blocklist)
    }

    /// Append an already-stored block copied from another volume.
    pub fn add_stored(&mut self, entry: &VolumeEntry, stored: &[u8]) -> Result<()> {
        self.append(entry.hash, entry.size, stored, entry.is_blocklist)
    }

    fn append(&mut self, hash: BlockHash, size: u64, stored: &[u8], is_blocklist: bool) -> Result<()> {
        let stored_len = u32::try_from(stored.len())
            .map_err(|_| DupError::InvalidFormat(format!("block too large: {}", stored.len())))?;
        let offset = BLOCK_VOLUME_HEADER_SIZE + self.data_bytes + 4;
        self.out.write_all(&stored_len.to_le_bytes())?;
        self.out.write_all(stored)?;
        self.data_bytes += 4 + stored.len() as u64;
        self.entries.push(VolumeEntry {
            hash,
            size,
            offset,
            stored_len,
            is_blocklist,
        });
        Ok(())
    }

    /// Exact size of the file once closed.
    pub fn size(&self) -> u64 {
        BLOCK_VOLUME_HEADER_SIZE
            + self.data_bytes
            + TRAILER_ENTRY_SIZE * self.entries.len() as u64
            + FOOTER_SIZE
    }

    pub fn entries(&self) -> &[VolumeEntry] {
        &self.entries
    }

    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the trailer and flush. The returned path deletes the file on drop.
    pub fn close(mut self) -> Result<ClosedBlockVolume> {
        for e in &self.entries {
            self.out.write_all(e.hash.as_bytes())?;
            self.out.write_all(&e.size.to_le_bytes())?;
            self.out.write_all(&e.offset.to_le_bytes())?;
            self.out.write_all(&e.stored_len.to_le_bytes())?;
            self.out
                .write_all(&[if e.is_blocklist { FLAG_BLOCKLIST } else { 0 }])?;
        }
        let count = u32::try_from(self.entries.len())
            .map_err(|_| DupError::InvalidFormat("too many blocks in volume".into()))?;
        self.out.write_all(&count.to_le_bytes())?;
        let size = self.size();
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.as_file().sync_all()?;
        debug_assert_eq!(fs::metadata(file.path()).map(|m| m.len()).ok(), Some(size));
        Ok(ClosedBlockVolume {
            name: self.name,
            path: file.into_temp_path(),
            size,
            entries: self.entries,
        })
    }

    /// Drop the volume without producing a file.
    pub fn discard(self) -> Result<()> {
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.close()?;
        Ok(())
    }
}

/// A finished block volume awaiting upload.
pub struct ClosedBlockVolume {
    pub name: String,
    pub path: TempPath,
    /// Size before encryption.
    pub size: u64,
    pub entries: Vec<VolumeEntry>,
}

impl ClosedBlockVolume {
    pub fn local_path(&self) -> PathBuf {
        self.path.to_path_buf()
    }
}

/// Random access to the blocks of a closed (decrypted) block volume.
pub struct BlockVolumeReader {
    data: Vec<u8>,
    entries: Vec<VolumeEntry>,
}

impl BlockVolumeReader {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_bytes(fs::read(path)?)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let bad = |msg: &str| DupError::InvalidFormat(format!("block volume: {msg}"));
        let len = data.len() as u64;
        if len < BLOCK_VOLUME_HEADER_SIZE + FOOTER_SIZE {
            return Err(bad("too short"));
        }
        if &data[..8] != BLOCK_VOLUME_MAGIC {
            return Err(bad("bad magic"));
        }
        if data[8] != BLOCK_VOLUME_VERSION {
            return Err(bad(&format!("unsupported version {}", data[8])));
        }
        let count = read_u32(&data, (len - FOOTER_SIZE) as usize) as u64;
        let trailer_len = count
            .checked_mul(TRAILER_ENTRY_SIZE)
            .filter(|t| t + BLOCK_VOLUME_HEADER_SIZE + FOOTER_SIZE <= len)
            .ok_or_else(|| bad("entry count exceeds file size"))?;
        let trailer_start = len - FOOTER_SIZE - trailer_len;

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let at = (trailer_start + i * TRAILER_ENTRY_SIZE) as usize;
            let hash = BlockHash::from_slice(&data[at..at + HASH_SIZE])?;
            let mut p = at + HASH_SIZE;
            let size = read_u64(&data, p);
            p += 8;
            let offset = read_u64(&data, p);
            p += 8;
            let stored_len = read_u32(&data, p);
            p += 4;
            let flags = data[p];
            if offset + stored_len as u64 > trailer_start {
                return Err(bad("entry points past data section"));
            }
            entries.push(VolumeEntry {
                hash,
                size,
                offset,
                stored_len,
                is_blocklist: flags & FLAG_BLOCKLIST != 0,
            });
        }
        Ok(Self { data, entries })
    }

    pub fn entries(&self) -> &[VolumeEntry] {
        &self.entries
    }

    /// Stored (compression-tagged) bytes of a block.
    pub fn read_stored(&self, entry: &VolumeEntry) -> &[u8] {
        let start = entry.offset as usize;
        &self.data[start..start + entry.stored_len as usize]
    }

    /// Decompressed block contents, verified against the recorded size.
    pub fn read_block(&self, entry: &VolumeEntry) -> Result<Vec<u8>> {
        let block = compress::decompress(self.read_stored(entry))?;
        if block.len() as u64 != entry.size {
            return Err(DupError::InvalidFormat(format!(
                "block {} decompressed to {} bytes, expected {}",
                entry.hash,
                block.len(),
                entry.size
            )));
        }
        Ok(block)
    }

    pub fn find(&self, hash: &BlockHash, size: u64) -> Option<&VolumeEntry> {
        self.entries
            .iter()
            .find(|e| e.hash == *hash && e.size == size)
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}
