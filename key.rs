//! Symmetric key derivation and printable key encoding.
//!
//! This module provides [`SymmetricKey`], the 256-bit key behind every
//! encrypted blob, with automatic memory zeroization.
//!
//! ## Key Encoding
//!
//! ```text
//! [algorithm tag: 2 hex chars][key material: 64 hex chars]
//! ```
//!
//! The only tag defined today is `01` (XChaCha20, version 1).

use crate::error::{BlobError, BlobResult};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Key size in bytes (256 bits)
pub const KEY_BYTES: usize = 32;

/// Algorithm tag for XChaCha20 keys
pub const KEY_TAG_XCHACHA20: u8 = 0x01;

/// Length of a printable key: tag plus key material, both hex encoded
pub const ENCODED_KEY_LEN: usize = 2 + KEY_BYTES * 2;

/// Derived key material, wiped from memory on drop.
pub struct SymmetricKey {
    key_bytes: [u8; KEY_BYTES],
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.key_bytes.zeroize();
    }
}

impl SymmetricKey {
    /// Derive a key from key source material.
    /// The same key source always yields the same key.
    pub fn derive(key_source: &[u8]) -> Self {
        let mut digest = Sha256::digest(key_source);
        let mut key_bytes = [0u8; KEY_BYTES];
        key_bytes.copy_from_slice(&digest);
        digest.as_mut_slice().zeroize();
        Self { key_bytes }
    }

    /// Parse a printable key produced by [`SymmetricKey::encode`].
    pub fn parse(encoded: &str) -> BlobResult<Self> {
        if encoded.is_empty() {
            return Err(BlobError::invalid_key("empty key"));
        }
        if encoded.len() != ENCODED_KEY_LEN {
            return Err(BlobError::invalid_key(format!(
                "expected {} characters but found {}",
                ENCODED_KEY_LEN,
                encoded.len()
            )));
        }

        let tag = encoded
            .get(..2)
            .and_then(|t| u8::from_str_radix(t, 16).ok())
            .ok_or_else(|| BlobError::invalid_key("malformed algorithm tag"))?;
        if tag != KEY_TAG_XCHACHA20 {
            return Err(BlobError::invalid_key(format!(
                "unsupported algorithm tag: {:02x}",
                tag
            )));
        }

        let mut key_bytes = [0u8; KEY_BYTES];
        hex::decode_to_slice(&encoded[2..], &mut key_bytes)
            .map_err(|e| BlobError::invalid_key(format!("malformed key material: {}", e)))?;
        Ok(Self { key_bytes })
    }

    pub fn encode(&self) -> String {
        format!("{:02x}{}", KEY_TAG_XCHACHA20, hex::encode(self.key_bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.key_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = SymmetricKey::derive(&[7u8; 64]);
        let b = SymmetricKey::derive(&[7u8; 64]);
        let c = SymmetricKey::derive(&[8u8; 64]);

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let key = SymmetricKey::derive(b"some key source material");
        let encoded = key.encode();

        assert_eq!(encoded.len(), ENCODED_KEY_LEN);
        assert!(encoded.starts_with("01"));

        let parsed = SymmetricKey::parse(&encoded).expect("valid key");
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_parse_rejects_bad_keys() {
        let unknown_tag = format!("ff{}", "00".repeat(KEY_BYTES));
        let not_hex = format!("01{}", "zz".repeat(KEY_BYTES));
        let bad_tag = format!("x1{}", "00".repeat(KEY_BYTES));

        for key in [
            "",
            "a",
            "01",
            "010000000000000000",
            unknown_tag.as_str(),
            not_hex.as_str(),
            bad_tag.as_str(),
        ] {
            let result = SymmetricKey::parse(key);
            assert!(
                matches!(result, Err(BlobError::InvalidKey(_))),
                "key {:?} should be rejected",
                key
            );
        }
    }
}
