use std::fmt;

use blake2::digest::consts::U32;
use blake2::Blake2b;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DupError, Result};

type Blake2b256 = Blake2b<U32>;

/// Size in bytes of every supported digest.
pub const HASH_SIZE: usize = 32;

/// A 32-byte content hash identifying a block, blocklist or whole stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; HASH_SIZE]);

impl BlockHash {
    pub fn compute(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let mut hasher = StreamHasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| {
            DupError::InvalidFormat(format!(
                "hash must be {HASH_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(BlockHash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Operator-selectable digest used for block and file hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "sha256")]
    Sha256,
    #[serde(rename = "blake2b256")]
    Blake2b256,
}

impl HashAlgorithm {
    pub fn hash_size(&self) -> usize {
        HASH_SIZE
    }
}

/// Incremental hasher over one of the supported algorithms.
#[derive(Clone)]
pub enum StreamHasher {
    Sha256(Sha256),
    Blake2b256(Blake2b256),
}

impl StreamHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => StreamHasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake2b256 => StreamHasher::Blake2b256(Blake2b256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamHasher::Sha256(h) => h.update(data),
            StreamHasher::Blake2b256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> BlockHash {
        let mut out = [0u8; HASH_SIZE];
        match self {
            StreamHasher::Sha256(h) => out.copy_from_slice(&h.finalize()),
            StreamHasher::Blake2b256(h) => out.copy_from_slice(&h.finalize()),
        }
        BlockHash(out)
    }
}
