//! Streaming encryption and decryption handles.
//!
//! [`StreamEncryptor`] is a `Write` sink that encrypts every byte it accepts
//! and forwards the ciphertext immediately. [`StreamDecryptor`] is a lazy
//! `Read` adapter over a ciphertext source. Neither buffers whole content.
//!
//! Both apply the XChaCha20 keystream, so ciphertext length always equals
//! plaintext length and encryption is deterministic for a given key and nonce.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use std::io::{self, Read, Write};

use crate::error::{BlobError, BlobResult};
use crate::key::SymmetricKey;

/// XChaCha20 nonce size in bytes
pub const NONCE_BYTES: usize = 24;

/// Scratch buffer size used while encrypting (64KB)
const CHUNK_SIZE: usize = 64 * 1024;

fn new_cipher(key: &SymmetricKey, nonce: &[u8; NONCE_BYTES]) -> BlobResult<XChaCha20> {
    XChaCha20::new_from_slices(key.as_bytes(), nonce)
        .map_err(|e| BlobError::invalid_key(format!("cipher init failed: {}", e)))
}

fn apply(cipher: &mut XChaCha20, data: &mut [u8]) -> io::Result<()> {
    cipher
        .try_apply_keystream(data)
        .map_err(|e| io::Error::other(format!("keystream exhausted: {}", e)))
}

/// Encrypting sink: every accepted byte is encrypted and written to `sink`
pub struct StreamEncryptor<'a> {
    cipher: XChaCha20,
    sink: Box<dyn Write + 'a>,
    scratch: Vec<u8>,
}

impl<'a> StreamEncryptor<'a> {
    pub fn new(
        key: &SymmetricKey,
        nonce: &[u8; NONCE_BYTES],
        sink: Box<dyn Write + 'a>,
    ) -> BlobResult<Self> {
        Ok(Self {
            cipher: new_cipher(key, nonce)?,
            sink,
            scratch: Vec::new(),
        })
    }
}

impl Write for StreamEncryptor<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for chunk in buf.chunks(CHUNK_SIZE) {
            self.scratch.clear();
            self.scratch.extend_from_slice(chunk);
            apply(&mut self.cipher, &mut self.scratch)?;
            self.sink.write_all(&self.scratch)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// Decrypting reader over a ciphertext source
pub struct StreamDecryptor<'a> {
    cipher: XChaCha20,
    source: Box<dyn Read + 'a>,
}

impl<'a> StreamDecryptor<'a> {
    pub fn new(
        key: &SymmetricKey,
        nonce: &[u8; NONCE_BYTES],
        source: Box<dyn Read + 'a>,
    ) -> BlobResult<Self> {
        Ok(Self {
            cipher: new_cipher(key, nonce)?,
            source,
        })
    }
}

impl Read for StreamDecryptor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read(buf)?;
        apply(&mut self.cipher, &mut buf[..n])?;
        Ok(n)
    }
}
