use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use zeroize::Zeroizing;

use dupvault_types::error::{DupError, Result};

use super::VolumeCodec;

const MAGIC: &[u8; 4] = b"DVAE";
const VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// magic + version + salt + m/t/p costs + nonce
const HEADER_LEN: usize = 4 + 1 + SALT_LEN + 12 + NONCE_LEN;

/// Upper bounds on header-supplied costs, checked before any key derivation.
const MAX_MEMORY_KIB: u32 = 1024 * 1024;
const MAX_TIME: u32 = 16;
const MAX_PARALLELISM: u32 = 16;

/// Argon2id cost parameters, stored in every file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfCost {
    pub memory_kib: u32,
    pub time: u32,
    pub parallelism: u32,
}

impl KdfCost {
    fn check_bounds(&self) -> Result<()> {
        if self.memory_kib > MAX_MEMORY_KIB || self.time > MAX_TIME || self.parallelism > MAX_PARALLELISM {
            return Err(DupError::InvalidFormat(format!(
                "key derivation cost out of range: {}KiB, t={}, p={}",
                self.memory_kib, self.time, self.parallelism
            )));
        }
        Ok(())
    }
}

impl Default for KdfCost {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            time: 2,
            parallelism: 1,
        }
    }
}

struct DerivedKey {
    salt: [u8; SALT_LEN],
    cost: KdfCost,
    cipher: Aes256Gcm,
}

/// AES-256-GCM whole-volume encryption with a passphrase-derived key.
///
/// One salt (and key derivation) is used for every file this codec writes;
/// decryption derives and caches the key for whatever salt a file carries.
pub struct AesCodec {
    passphrase: Zeroizing<String>,
    write_key: DerivedKey,
    read_key: Mutex<Option<DerivedKey>>,
}

impl AesCodec {
    pub fn new(passphrase: &str) -> Result<Self> {
        Self::with_cost(passphrase, KdfCost::default())
    }

    pub fn with_cost(passphrase: &str, cost: KdfCost) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(DupError::Encryption("empty passphrase".into()));
        }
        cost.check_bounds()?;
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let write_key = derive(passphrase, salt, cost)?;
        Ok(Self {
            passphrase: Zeroizing::new(passphrase.to_string()),
            write_key,
            read_key: Mutex::new(None),
        })
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.push(VERSION);
        header.extend_from_slice(&self.write_key.salt);
        header.extend_from_slice(&self.write_key.cost.memory_kib.to_le_bytes());
        header.extend_from_slice(&self.write_key.cost.time.to_le_bytes());
        header.extend_from_slice(&self.write_key.cost.parallelism.to_le_bytes());
        header.extend_from_slice(&nonce_bytes);

        // The header is authenticated so cost or salt tampering fails decryption.
        let ciphertext = self
            .write_key
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|e| DupError::Encryption(format!("AES-GCM encrypt: {e}")))?;

        let mut out = header;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

fn derive(passphrase: &str, salt: [u8; SALT_LEN], cost: KdfCost) -> Result<DerivedKey> {
    let params = argon2::Params::new(cost.memory_kib, cost.time, cost.parallelism, Some(32))
        .map_err(|e| DupError::Encryption(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &salt, key.as_mut())
        .map_err(|e| DupError::Encryption(format!("argon2 hash: {e}")))?;
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| DupError::Encryption(format!("AES-GCM key: {e}")))?;
    Ok(DerivedKey { salt, cost, cipher })
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

impl VolumeCodec for AesCodec {
    fn module_name(&self) -> Option<&'static str> {
        Some("aes")
    }

    fn encrypt_file(&self, path: &Path) -> Result<()> {
        let plaintext = fs::read(path)?;
        let sealed = self.seal(&plaintext)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&sealed)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < HEADER_LEN + TAG_LEN || &data[..4] != MAGIC {
            return Err(DupError::DecryptionFailed);
        }
        if data[4] != VERSION {
            return Err(DupError::InvalidFormat(format!(
                "unsupported encryption version {}",
                data[4]
            )));
        }
        let (header, ciphertext) = data.split_at(HEADER_LEN);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&header[5..5 + SALT_LEN]);
        let cost_at = 5 + SALT_LEN;
        let cost = KdfCost {
            memory_kib: read_u32(header, cost_at),
            time: read_u32(header, cost_at + 4),
            parallelism: read_u32(header, cost_at + 8),
        };
        let nonce = Nonce::from_slice(&header[cost_at + 12..]);
        let payload = Payload {
            msg: ciphertext,
            aad: header,
        };

        if salt == self.write_key.salt && cost == self.write_key.cost {
            return self
                .write_key
                .cipher
                .decrypt(nonce, payload)
                .map_err(|_| DupError::DecryptionFailed);
        }

        let mut cached = self.read_key.lock().unwrap_or_else(PoisonError::into_inner);
        let reuse = matches!(cached.as_ref(), Some(k) if k.salt == salt && k.cost == cost);
        if !reuse {
            cost.check_bounds()?;
            *cached = Some(derive(&self.passphrase, salt, cost)?);
        }
        let Some(key) = cached.as_ref() else {
            return Err(DupError::DecryptionFailed);
        };
        key.cipher
            .decrypt(nonce, payload)
            .map_err(|_| DupError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KdfCost {
        KdfCost {
            memory_kib: 64,
            time: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn encrypt_file_then_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol");
        fs::write(&path, b"volume contents").unwrap();

        let codec = AesCodec::with_cost("secret", cheap()).unwrap();
        codec.encrypt_file(&path).unwrap();
        let sealed = fs::read(&path).unwrap();
        assert_eq!(sealed.len(), HEADER_LEN + 15 + TAG_LEN);
        assert_eq!(codec.decrypt(&sealed).unwrap(), b"volume contents");
    }

    #[test]
    fn other_instance_with_same_passphrase_decrypts() {
        let writer = AesCodec::with_cost("secret", cheap()).unwrap();
        let reader = AesCodec::with_cost("secret", cheap()).unwrap();
        let sealed = writer.seal(b"payload").unwrap();
        assert_eq!(reader.decrypt(&sealed).unwrap(), b"payload");
        // Second call hits the cached key.
        assert_eq!(reader.decrypt(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn wrong_passphrase_fails() {
        let writer = AesCodec::with_cost("secret", cheap()).unwrap();
        let reader = AesCodec::with_cost("nope", cheap()).unwrap();
        let sealed = writer.seal(b"payload").unwrap();
        assert!(matches!(
            reader.decrypt(&sealed),
            Err(DupError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_header_fails() {
        let codec = AesCodec::with_cost("secret", cheap()).unwrap();
        let mut sealed = codec.seal(b"payload").unwrap();
        sealed[6] ^= 0xff;
        assert!(codec.decrypt(&sealed).is_err());
    }

    #[test]
    fn oversized_header_cost_is_rejected_before_derivation() {
        let writer = AesCodec::with_cost("secret", cheap()).unwrap();
        let reader = AesCodec::with_cost("secret", cheap()).unwrap();
        let mut sealed = writer.seal(b"payload").unwrap();
        let cost_at = 5 + SALT_LEN;
        sealed[cost_at..cost_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            reader.decrypt(&sealed),
            Err(DupError::InvalidFormat(_))
        ));
        assert!(AesCodec::with_cost(
            "secret",
            KdfCost {
                time: MAX_TIME + 1,
                ..cheap()
            }
        )
        .is_err());
    }

    #[test]
    fn empty_passphrase_rejected() {
        assert!(AesCodec::new("").is_err());
    }
}
