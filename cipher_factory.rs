//! Hash and cipher factory.
//!
//! [`CipherFactory`] is the single source of cryptographic primitives for the
//! blob pipeline: keyed stream encryptors, matching decryptors and content
//! hashers. The default implementation, [`XChaChaCipherFactory`], pairs
//! XChaCha20 with SHA-512.
//!
//! ## Key Derivation Contract
//!
//! - The key is derived from caller supplied key source material, which must
//!   be at least [`CipherFactory::min_key_source_bytes`] long
//! - The same key source and iv always produce the same key and ciphertext
//! - The iv may have any length, including zero

use sha2::{Digest, Sha512};
use std::io::{self, Read, Write};
use tracing::debug;

use crate::error::{BlobError, BlobResult};
use crate::key::SymmetricKey;
use crate::streaming::{StreamDecryptor, StreamEncryptor, NONCE_BYTES};

/// Minimal key source size: 128 bits of derivation material
pub const MIN_KEY_SOURCE_BYTES: usize = 16;

/// Incremental digest accumulator
pub trait ContentHasher: Write + Send {
    /// Digest of everything written since creation or the last reset
    fn sum(&self) -> Vec<u8>;

    fn reset(&mut self);
}

/// Capability set of cryptographic primitives used by the blob pipeline
pub trait CipherFactory: Send + Sync {
    /// Create an encrypting sink over `sink`, returning it with the printable key
    fn create_encryptor<'a>(
        &self,
        key_source: &[u8],
        iv: &[u8],
        sink: Box<dyn Write + 'a>,
    ) -> BlobResult<(Box<dyn Write + 'a>, String)>;

    /// Create a lazy decrypting reader over `source`
    fn create_decryptor<'a>(
        &self,
        key: &str,
        iv: &[u8],
        source: Box<dyn Read + 'a>,
    ) -> BlobResult<Box<dyn Read + 'a>>;

    fn create_hasher(&self) -> BlobResult<Box<dyn ContentHasher>>;

    fn min_key_source_bytes(&self) -> usize;
}

/// SHA-512 content hasher
#[derive(Clone, Default)]
pub struct Sha512Hasher {
    inner: Sha512,
}

impl Write for Sha512Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ContentHasher for Sha512Hasher {
    fn sum(&self) -> Vec<u8> {
        self.inner.clone().finalize().to_vec()
    }

    fn reset(&mut self) {
        Digest::reset(&mut self.inner);
    }
}

/// Default factory: XChaCha20 encryption, SHA-512 hashing
#[derive(Debug, Clone, Copy, Default)]
pub struct XChaChaCipherFactory;

/// Create the default cipher factory
pub fn create() -> XChaChaCipherFactory {
    XChaChaCipherFactory
}

/// Expand an iv of arbitrary length into an XChaCha20 nonce.
/// Long enough ivs are used as is, shorter ones are hashed.
fn nonce_from_iv(iv: &[u8]) -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    if iv.len() >= NONCE_BYTES {
        nonce.copy_from_slice(&iv[..NONCE_BYTES]);
    } else {
        nonce.copy_from_slice(&Sha512::digest(iv)[..NONCE_BYTES]);
    }
    nonce
}

impl CipherFactory for XChaChaCipherFactory {
    fn create_encryptor<'a>(
        &self,
        key_source: &[u8],
        iv: &[u8],
        sink: Box<dyn Write + 'a>,
    ) -> BlobResult<(Box<dyn Write + 'a>, String)> {
        if key_source.len() < MIN_KEY_SOURCE_BYTES {
            return Err(BlobError::InsufficientKeySource {
                got: key_source.len(),
                min: MIN_KEY_SOURCE_BYTES,
            });
        }

        let key = SymmetricKey::derive(key_source);
        let encryptor = StreamEncryptor::new(&key, &nonce_from_iv(iv), sink)?;
        debug!(iv_len = iv.len(), "created xchacha20 encryptor");
        Ok((Box::new(encryptor), key.encode()))
    }

    fn create_decryptor<'a>(
        &self,
        key: &str,
        iv: &[u8],
        source: Box<dyn Read + 'a>,
    ) -> BlobResult<Box<dyn Read + 'a>> {
        let key = SymmetricKey::parse(key)?;
        let decryptor = StreamDecryptor::new(&key, &nonce_from_iv(iv), source)?;
        Ok(Box::new(decryptor))
    }

    fn create_hasher(&self) -> BlobResult<Box<dyn ContentHasher>> {
        Ok(Box::new(Sha512Hasher::default()))
    }

    fn min_key_source_bytes(&self) -> usize {
        MIN_KEY_SOURCE_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::{OsRng, RngCore};
    use std::io::Cursor;

    #[test]
    fn test_factory_creation() {
        let f = create();
        assert!(
            f.min_key_source_bytes() >= 16,
            "at least 128 bits of key source are required"
        );
    }

    #[test]
    fn test_encryptor_creation() {
        let f = create();
        let key_source = vec![0u8; f.min_key_source_bytes()];
        let mut buff = Vec::new();

        let (_enc, key) = f
            .create_encryptor(&key_source, &[], Box::new(&mut buff))
            .expect("couldn't create encryptor");
        assert!(!key.is_empty());
    }

    #[test]
    fn test_key_source_length_requirement() {
        let f = create();
        let min = f.min_key_source_bytes();
        let key_source = vec![0u8; min];

        for len in [0, 1, min - 1] {
            let result = f.create_encryptor(&key_source[..len], &[], Box::new(io::sink()));
            match result {
                Err(BlobError::InsufficientKeySource { got, min: required }) => {
                    assert_eq!(got, len);
                    assert_eq!(required, min);
                }
                Err(e) => panic!("unexpected error for key length {}: {}", len, e),
                Ok(_) => panic!("encryptor created with key length {}", len),
            }
        }

        assert!(f
            .create_encryptor(&key_source, &[], Box::new(io::sink()))
            .is_ok());
    }

    #[test]
    fn test_any_iv_length_accepted() {
        let f = create();
        let key_source = vec![0u8; f.min_key_source_bytes()];

        for len in [0, 1, 3, 8, 16, 28, 32, 64] {
            let iv = vec![0xabu8; len];
            let result = f.create_encryptor(&key_source, &iv, Box::new(io::sink()));
            assert!(result.is_ok(), "iv of length {} rejected", len);
        }
    }

    #[test]
    fn test_encryptor_decryptor_pair() {
        let mut random = vec![0u8; 1089];
        OsRng.fill_bytes(&mut random);

        let test_set: Vec<Vec<u8>> = vec![
            vec![],
            vec![47],
            vec![13, 17],
            (54u8..=76).collect(),
            random,
        ];

        let f = create();
        for iv in [&[][..], &[5u8; 3][..], &[7u8; 32][..]] {
            for data in &test_set {
                let key_source = vec![0u8; f.min_key_source_bytes()];
                let mut buff = Vec::new();

                let key = {
                    let (mut enc, key) = f
                        .create_encryptor(&key_source, iv, Box::new(&mut buff))
                        .expect("encryptor");
                    let n = enc.write(data).expect("write to encryptor");
                    assert_eq!(n, data.len());
                    key
                };

                let mut dec = f
                    .create_decryptor(&key, iv, Box::new(Cursor::new(buff)))
                    .expect("decryptor");
                let mut out = Vec::new();
                dec.read_to_end(&mut out).expect("decode");

                assert_eq!(&out, data);
            }
        }
    }

    #[test]
    fn test_encryption_is_convergent() {
        let f = create();
        let key_source = [3u8; 64];
        let data = b"identical plaintext";

        let run = || {
            let mut buff = Vec::new();
            let key = {
                let (mut enc, key) = f
                    .create_encryptor(&key_source, &[], Box::new(&mut buff))
                    .expect("encryptor");
                enc.write_all(data).expect("write");
                key
            };
            (buff, key)
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_decryptor_rejects_invalid_keys() {
        let f = create();
        for key in [
            "",
            "a",
            "z",
            "FFABCDABCDABCDABCDABCDABCDABCDABCD",
            "010000000000000000",
        ] {
            let result = f.create_decryptor(key, &[], Box::new(io::empty()));
            assert!(
                matches!(result, Err(BlobError::InvalidKey(_))),
                "decryptor created for invalid key {:?}",
                key
            );
        }

        let unknown_tag = format!("7f{}", "ab".repeat(32));
        assert!(f
            .create_decryptor(&unknown_tag, &[], Box::new(io::empty()))
            .is_err());
    }

    #[test]
    fn test_hasher() {
        let f = create();
        let mut h = f.create_hasher().expect("hasher");
        h.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).expect("write");
        let hash = h.sum();

        assert!(hash.len() >= 16, "at least 16 bytes of hash are required");
        assert_eq!(hash, Sha512::digest([1u8, 2, 3, 4, 5, 6, 7, 8]).to_vec());
    }

    #[test]
    fn test_hasher_split_writes() {
        let f = create();
        let data: Vec<u8> = (0..200u8).collect();

        let mut whole = f.create_hasher().expect("hasher");
        whole.write_all(&data).expect("write");
        let expected = whole.sum();

        for split in [0, 1, 99, 199, 200] {
            let mut h = f.create_hasher().expect("hasher");
            h.write_all(&data[..split]).expect("write");
            h.write_all(&data[split..]).expect("write");
            assert_eq!(h.sum(), expected, "split at {}", split);
        }

        whole.reset();
        assert_eq!(whole.sum(), Sha512::digest(b"").to_vec());
    }
}
