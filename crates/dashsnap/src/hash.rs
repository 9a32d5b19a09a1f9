//! Content hashing for captured images.
//!
//! Every image is identified by its SHA-256 content hash. This provides:
//! - Deduplication: same bytes = same hash = one cache entry
//! - Verification: stored baselines are checked against their hash on read
//! - Cache keying: diff and vision results are addressed by hash pairs

use crate::error::{Result, SnapError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 content hash over canonical encoded image bytes.
///
/// Format: `sha256:<64 hex characters>`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageHash([u8; 32]);

impl ImageHash {
    /// Hash raw encoded bytes.
    ///
    /// # Example
    /// ```
    /// use dashsnap::ImageHash;
    ///
    /// let hash = ImageHash::from_bytes(b"png bytes");
    /// assert!(hash.to_string().starts_with("sha256:"));
    /// ```
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Parse from a hex string, with or without the `sha256:` prefix.
    pub fn from_hex(s: &str) -> Result<Self> {
        let hex_str = s.strip_prefix("sha256:").unwrap_or(s);

        if hex_str.len() != 64 {
            return Err(SnapError::InvalidInput(format!(
                "expected 64 hex characters, got {}",
                hex_str.len()
            )));
        }

        let bytes = hex::decode(hex_str)
            .map_err(|e| SnapError::InvalidInput(format!("invalid hex: {e}")))?;

        let array: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            SnapError::InvalidInput(format!("hash must be exactly 32 bytes, got {}", v.len()))
        })?;

        Ok(Self(array))
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded hash without prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify that data matches this hash.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::from_bytes(data) == *self
    }
}

impl fmt::Display for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

impl fmt::Debug for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "ImageHash({}..)", &self.to_hex()[..12])
    }
}
