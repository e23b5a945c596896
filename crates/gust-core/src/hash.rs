//! 20-byte SHA-1 content identifier.
//!
//! Every file on the network is addressed by the SHA-1 of its complete
//! contents, and every chunk is verified against the SHA-1 of its region.
//! The all-0xFF value is the "blank" sentinel, used in discovery requests
//! to mean "any file".

use std::fmt;
use std::io::Read;

use sha1::{Digest, Sha1};

/// A 20-byte SHA-1 digest. Equality is byte equality. Immutable once built.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha1Hash([u8; 20]);

impl Sha1Hash {
    /// Wrap raw digest bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Sha1Hash(bytes)
    }

    /// The 0xFF×20 sentinel meaning "any file" in wildcard requests.
    pub fn blank() -> Self {
        Sha1Hash([0xFF; 20])
    }

    /// True if this is the blank sentinel.
    pub fn is_blank(&self) -> bool {
        self.0 == [0xFF; 20]
    }

    /// Digest an in-memory byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Sha1Hash(hasher.finalize().into())
    }

    /// Digest everything a reader yields, streaming in 64 KiB blocks.
    pub fn of_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Sha1Hash(hasher.finalize().into()))
    }

    /// 40 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse 40 hex characters. Rejects wrong lengths and non-hex input.
    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(s).map_err(|_| HashError::BadHash(s.to_string()))?;
        Self::from_slice(&bytes).ok_or_else(|| HashError::BadHash(s.to_string()))
    }

    /// Copy from a slice that must be exactly 20 bytes.
    pub fn from_slice(s: &[u8]) -> Option<Self> {
        let bytes: [u8; 20] = s.try_into().ok()?;
        Some(Sha1Hash(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({})", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    #[error("expected 40 hex characters, got {0:?}")]
    BadHash(String),
}
