//! In-memory blob storage.
//!
//! Useful for tests and for short lived processes. Finalize runs under the
//! map's write lock, so dedup and collision checks never race.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::blob_storage::{BlobStorage, StagedWriter};
use crate::error::{BlobError, BlobResult};

#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_lock(&self) -> BlobResult<RwLockReadGuard<'_, HashMap<String, Vec<u8>>>> {
        self.blobs
            .read()
            .map_err(|_| BlobError::storage("memory storage lock poisoned"))
    }

    fn write_lock(&self) -> BlobResult<RwLockWriteGuard<'_, HashMap<String, Vec<u8>>>> {
        self.blobs
            .write()
            .map_err(|_| BlobError::storage("memory storage lock poisoned"))
    }

    /// Number of committed blobs
    pub fn len(&self) -> usize {
        self.read_lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, bid: &str) -> bool {
        self.read_lock()
            .map(|b| b.contains_key(bid))
            .unwrap_or(false)
    }

    /// Ids of all committed blobs, sorted
    pub fn blob_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read_lock()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Overwrite stored bytes, bypassing finalize checks
    #[cfg(test)]
    pub(crate) fn replace_raw(&self, bid: &str, data: Vec<u8>) {
        if let Ok(mut blobs) = self.blobs.write() {
            blobs.insert(bid.to_string(), data);
        }
    }
}

struct MemoryBlobWriter<'a> {
    storage: &'a MemoryBlobStorage,
    bid: String,
    buffer: Vec<u8>,
}

impl Write for MemoryBlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StagedWriter for MemoryBlobWriter<'_> {
    fn finalize(self: Box<Self>) -> BlobResult<()> {
        let MemoryBlobWriter {
            storage,
            bid,
            buffer,
        } = *self;
        let mut blobs = storage.write_lock()?;
        match blobs.get(&bid) {
            Some(existing) if *existing == buffer => {
                debug!(bid = %bid, "blob already stored, dedup");
                Ok(())
            }
            Some(_) => Err(BlobError::BidCollision(bid)),
            None => {
                debug!(bid = %bid, size = buffer.len(), "blob committed");
                blobs.insert(bid, buffer);
                Ok(())
            }
        }
    }

    fn cancel(self: Box<Self>) -> BlobResult<()> {
        debug!(bid = %self.bid, "staged blob discarded");
        Ok(())
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn new_blob_writer(&self, bid: &str) -> BlobResult<Box<dyn StagedWriter + '_>> {
        Ok(Box::new(MemoryBlobWriter {
            storage: self,
            bid: bid.to_string(),
            buffer: Vec::new(),
        }))
    }

    fn new_blob_reader(&self, bid: &str) -> BlobResult<Box<dyn Read + Send + '_>> {
        let data = self
            .read_lock()?
            .get(bid)
            .cloned()
            .ok_or_else(|| BlobError::BidNotFound(bid.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }
}

/// Test backend that lets a fixed number of staged writers through and fails
/// the writes of every later one, counting how each writer ended
#[cfg(test)]
pub(crate) mod quota {
    use std::io::{self, Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::MemoryBlobStorage;
    use crate::blob_storage::{BlobStorage, StagedWriter};
    use crate::error::{BlobError, BlobResult};

    #[derive(Debug, Default)]
    pub(crate) struct QuotaBlobStorage {
        inner: MemoryBlobStorage,
        quota: usize,
        opened: AtomicUsize,
        committed: AtomicUsize,
        canceled: AtomicUsize,
    }

    impl QuotaBlobStorage {
        pub(crate) fn new(quota: usize) -> Self {
            Self {
                quota,
                ..Self::default()
            }
        }

        pub(crate) fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        pub(crate) fn committed(&self) -> usize {
            self.committed.load(Ordering::SeqCst)
        }

        pub(crate) fn canceled(&self) -> usize {
            self.canceled.load(Ordering::SeqCst)
        }

        /// Blobs actually stored
        pub(crate) fn stored(&self) -> usize {
            self.inner.len()
        }
    }

    struct QuotaBlobWriter<'a> {
        storage: &'a QuotaBlobStorage,
        inner: Option<Box<dyn StagedWriter + 'a>>,
    }

    impl Write for QuotaBlobWriter<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.inner.as_mut() {
                Some(writer) => writer.write(buf),
                None => Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "blob quota exhausted",
                )),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            match self.inner.as_mut() {
                Some(writer) => writer.flush(),
                None => Ok(()),
            }
        }
    }

    impl StagedWriter for QuotaBlobWriter<'_> {
        fn finalize(self: Box<Self>) -> BlobResult<()> {
            let QuotaBlobWriter { storage, inner } = *self;
            match inner {
                Some(writer) => {
                    writer.finalize()?;
                    storage.committed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                None => Err(BlobError::storage("blob quota exhausted")),
            }
        }

        fn cancel(self: Box<Self>) -> BlobResult<()> {
            let QuotaBlobWriter { storage, inner } = *self;
            storage.canceled.fetch_add(1, Ordering::SeqCst);
            match inner {
                Some(writer) => writer.cancel(),
                None => Ok(()),
            }
        }
    }

    impl BlobStorage for QuotaBlobStorage {
        fn new_blob_writer(&self, bid: &str) -> BlobResult<Box<dyn StagedWriter + '_>> {
            let index = self.opened.fetch_add(1, Ordering::SeqCst);
            let inner = if index < self.quota {
                Some(self.inner.new_blob_writer(bid)?)
            } else {
                None
            };
            Ok(Box::new(QuotaBlobWriter {
                storage: self,
                inner,
            }))
        }

        fn new_blob_reader(&self, bid: &str) -> BlobResult<Box<dyn Read + Send + '_>> {
            self.inner.new_blob_reader(bid)
        }
    }
}
