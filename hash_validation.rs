//! Hash-validated blob pipeline.
//!
//! The only path by which plaintext becomes a stored blob:
//!
//! 1. Hash the plaintext, the digest is the key source (convergent encryption)
//! 2. Derive the key and encrypt the plaintext into a temporary buffer
//! 3. Hash the ciphertext, the hex digest is the blob id
//! 4. Stage `[VALIDATION_METHOD_HASH][ciphertext]` under that id and finalize
//!
//! The staged writer is canceled on every failure path.

use std::io::{self, Read, Write};
use tracing::debug;

use crate::blob_storage::{BlobStorage, BlobWriteGuard};
use crate::capability::Capability;
use crate::cipher_factory::{CipherFactory, ContentHasher};
use crate::codec::{BlobType, VALIDATION_METHOD_HASH};
use crate::error::{BlobError, BlobResult};

/// Store the plaintext produced by `producer` as one encrypted blob.
///
/// `producer` is invoked twice and must yield the same bytes both times.
pub fn create_hash_validated_blob<R, F>(
    producer: F,
    storage: &dyn BlobStorage,
    factory: &dyn CipherFactory,
) -> BlobResult<Capability>
where
    R: Read,
    F: Fn() -> R,
{
    let mut hasher = factory.create_hasher()?;
    let plaintext_len = io::copy(&mut producer(), &mut hasher)?;
    let key_source = hasher.sum();

    let mut ciphertext = Vec::new();
    let key = {
        let (mut encryptor, key) =
            factory.create_encryptor(&key_source, &[], Box::new(&mut ciphertext))?;
        io::copy(&mut producer(), &mut encryptor)?;
        encryptor.flush()?;
        key
    };

    hasher.reset();
    hasher.write_all(&ciphertext)?;
    let bid = hex::encode(hasher.sum());

    let mut writer = BlobWriteGuard::open(storage, &bid)?;
    writer.write_all(&[VALIDATION_METHOD_HASH])?;
    writer.write_all(&ciphertext)?;
    writer.finalize()?;

    debug!(bid = %bid, plaintext_len, "hash validated blob stored");
    Ok(Capability::new(bid, key))
}

/// Reader that hashes everything passing through and checks the digest at EOF
struct HashValidatingReader<'a> {
    inner: Box<dyn Read + Send + 'a>,
    hasher: Box<dyn ContentHasher>,
    bid: String,
    expected: Vec<u8>,
    verified: bool,
}

impl Read for HashValidatingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.write_all(&buf[..n])?;
        } else if !buf.is_empty() && !self.verified {
            if self.hasher.sum() != self.expected {
                return Err(BlobError::validation(format!(
                    "content of blob {} does not match its id",
                    self.bid
                ))
                .into());
            }
            self.verified = true;
        }
        Ok(n)
    }
}

/// Open a stored blob for streamed, decrypted reading.
///
/// The ciphertext is verified against the blob id as it streams; a mismatch
/// surfaces as a [`BlobError::Validation`] error once the end is reached.
pub fn open_hash_validated_blob<'a>(
    capability: &Capability,
    storage: &'a dyn BlobStorage,
    factory: &dyn CipherFactory,
) -> BlobResult<Box<dyn Read + 'a>> {
    let expected = hex::decode(&capability.bid)
        .map_err(|e| BlobError::format(format!("blob id is not hex: {}", e)))?;

    let mut raw = storage.new_blob_reader(&capability.bid)?;
    let mut method = [0u8; 1];
    raw.read_exact(&mut method).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            BlobError::validation(format!("blob {} is empty", capability.bid))
        }
        _ => BlobError::from_io(e),
    })?;
    if method[0] != VALIDATION_METHOD_HASH {
        return Err(BlobError::validation(format!(
            "unsupported validation method {:#04x} in blob {}",
            method[0], capability.bid
        )));
    }

    let validating = HashValidatingReader {
        inner: raw,
        hasher: factory.create_hasher()?,
        bid: capability.bid.clone(),
        expected,
        verified: false,
    };
    factory.create_decryptor(&capability.key, &[], Box::new(validating))
}

/// Open a stored blob and read its leading payload type
pub fn open_typed_blob<'a>(
    capability: &Capability,
    storage: &'a dyn BlobStorage,
    factory: &dyn CipherFactory,
) -> BlobResult<(BlobType, Box<dyn Read + 'a>)> {
    let mut reader = open_hash_validated_blob(capability, storage, factory)?;
    let blob_type = BlobType::read_from(&mut reader)?;
    Ok((blob_type, reader))
}

/// Read and decrypt a whole blob into memory
pub fn read_hash_validated_blob(
    capability: &Capability,
    storage: &dyn BlobStorage,
    factory: &dyn CipherFactory,
) -> BlobResult<Vec<u8>> {
    let mut reader = open_hash_validated_blob(capability, storage, factory)?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data).map_err(BlobError::from_io)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher_factory;
    use crate::blob_storage::StagedWriter;
    use crate::memory_storage::MemoryBlobStorage;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store(storage: &MemoryBlobStorage, data: &[u8]) -> Capability {
        let factory = cipher_factory::create();
        create_hash_validated_blob(|| Cursor::new(data), storage, &factory).expect("store")
    }

    #[test]
    fn test_round_trip() {
        let storage = MemoryBlobStorage::new();
        let factory = cipher_factory::create();

        for data in [&b""[..], &b"a"[..], &b"Hello World!"[..], &[0u8; 10_000][..]] {
            let cap = store(&storage, data);
            let out = read_hash_validated_blob(&cap, &storage, &factory).expect("read");
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_capabilities_are_convergent() {
        let a = store(&MemoryBlobStorage::new(), b"same content");
        let b = store(&MemoryBlobStorage::new(), b"same content");
        let c = store(&MemoryBlobStorage::new(), b"other content");

        assert_eq!(a, b);
        assert_ne!(a.bid, c.bid);
        assert_ne!(a.key, c.key);
    }

    #[test]
    fn test_repeated_store_is_idempotent() {
        let storage = MemoryBlobStorage::new();
        let first = store(&storage, b"stored twice");
        let second = store(&storage, b"stored twice");

        assert_eq!(first, second);
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_blob_layout() {
        let storage = MemoryBlobStorage::new();
        let factory = cipher_factory::create();
        let cap = store(&storage, b"Hello World!");

        let mut raw = Vec::new();
        storage
            .new_blob_reader(&cap.bid)
            .expect("reader")
            .read_to_end(&mut raw)
            .expect("read");

        assert_eq!(raw[0], VALIDATION_METHOD_HASH);
        assert_eq!(raw.len(), 1 + b"Hello World!".len());
        assert_ne!(&raw[1..], b"Hello World!");
        assert_eq!(cap.bid.len(), 128);
        assert_eq!(cap.bid, cap.bid.to_lowercase());

        let mut hasher = factory.create_hasher().expect("hasher");
        hasher.write_all(&raw[1..]).expect("hash");
        assert_eq!(cap.bid, hex::encode(hasher.sum()));
    }

    #[test]
    fn test_tampered_blob_fails_validation() {
        let storage = MemoryBlobStorage::new();
        let factory = cipher_factory::create();
        let cap = store(&storage, b"tamper with me");

        let mut raw = Vec::new();
        storage
            .new_blob_reader(&cap.bid)
            .expect("reader")
            .read_to_end(&mut raw)
            .expect("read");
        raw[3] ^= 0x01;
        storage.replace_raw(&cap.bid, raw.clone());

        assert!(matches!(
            read_hash_validated_blob(&cap, &storage, &factory),
            Err(BlobError::Validation(_))
        ));

        raw[0] = 0x7f;
        storage.replace_raw(&cap.bid, raw);
        assert!(matches!(
            read_hash_validated_blob(&cap, &storage, &factory),
            Err(BlobError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_blob_and_bad_key() {
        let storage = MemoryBlobStorage::new();
        let factory = cipher_factory::create();
        let cap = store(&storage, b"content");

        let missing = Capability::new("00".repeat(64), cap.key.clone());
        assert!(matches!(
            read_hash_validated_blob(&missing, &storage, &factory),
            Err(BlobError::BidNotFound(_))
        ));

        let bad_key = Capability::new(cap.bid.clone(), "02");
        assert!(matches!(
            read_hash_validated_blob(&bad_key, &storage, &factory),
            Err(BlobError::InvalidKey(_))
        ));
    }

    /// Storage whose staged writes always fail, counting cancels
    #[derive(Default)]
    struct FailingStorage {
        canceled: AtomicUsize,
    }

    struct FailingWriter<'a>(&'a FailingStorage);

    impl Write for FailingWriter<'_> {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl StagedWriter for FailingWriter<'_> {
        fn finalize(self: Box<Self>) -> BlobResult<()> {
            Ok(())
        }

        fn cancel(self: Box<Self>) -> BlobResult<()> {
            self.0.canceled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl BlobStorage for FailingStorage {
        fn new_blob_writer(&self, _bid: &str) -> BlobResult<Box<dyn StagedWriter + '_>> {
            Ok(Box::new(FailingWriter(self)))
        }

        fn new_blob_reader(&self, bid: &str) -> BlobResult<Box<dyn Read + Send + '_>> {
            Err(BlobError::BidNotFound(bid.to_string()))
        }
    }

    #[test]
    fn test_failed_write_cancels_and_propagates() {
        let storage = FailingStorage::default();
        let factory = cipher_factory::create();

        let result = create_hash_validated_blob(|| Cursor::new(b"data"), &storage, &factory);
        match result {
            Err(BlobError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(cap) => panic!("blob stored despite failing backend: {}", cap),
        }
        assert_eq!(storage.canceled.load(Ordering::SeqCst), 1);
    }
}
