//! Blob storage port.
//!
//! Backends implement [`BlobStorage`]: a staged-write / read key-value store
//! keyed by blob id. Nothing becomes visible to readers until
//! [`StagedWriter::finalize`] succeeds.
//!
//! ## Finalize Semantics
//!
//! - Nothing stored under the id yet: the staged bytes are committed
//! - Identical bytes already stored: no-op success (dedup)
//! - Different bytes already stored: [`crate::BlobError::BidCollision`]
//!
//! Backends must serialize concurrent finalizes of the same id so that the
//! outcome above is race-free.

use std::io::{self, Read, Write};
use tracing::warn;

use crate::error::BlobResult;

/// Write / finalize / cancel handle for one blob
pub trait StagedWriter: Write + Send {
    /// Atomically commit the staged bytes
    fn finalize(self: Box<Self>) -> BlobResult<()>;

    /// Discard the staged bytes without any persisted effect
    fn cancel(self: Box<Self>) -> BlobResult<()>;
}

pub trait BlobStorage: Send + Sync {
    fn new_blob_writer(&self, bid: &str) -> BlobResult<Box<dyn StagedWriter + '_>>;

    /// Open a committed blob, fails with [`crate::BlobError::BidNotFound`] if absent
    fn new_blob_reader(&self, bid: &str) -> BlobResult<Box<dyn Read + Send + '_>>;
}

/// Staged writer that is canceled when dropped without a finalize.
pub struct BlobWriteGuard<'a> {
    bid: String,
    inner: Option<Box<dyn StagedWriter + 'a>>,
}

impl<'a> BlobWriteGuard<'a> {
    pub fn new(bid: impl Into<String>, inner: Box<dyn StagedWriter + 'a>) -> Self {
        Self {
            bid: bid.into(),
            inner: Some(inner),
        }
    }

    /// Open a writer on `storage` and guard it
    pub fn open(storage: &'a dyn BlobStorage, bid: &str) -> BlobResult<Self> {
        Ok(Self::new(bid, storage.new_blob_writer(bid)?))
    }

    pub fn finalize(mut self) -> BlobResult<()> {
        match self.inner.take() {
            Some(writer) => writer.finalize(),
            None => Ok(()),
        }
    }

    pub fn cancel(mut self) -> BlobResult<()> {
        match self.inner.take() {
            Some(writer) => writer.cancel(),
            None => Ok(()),
        }
    }

    fn writer(&mut self) -> io::Result<&mut Box<dyn StagedWriter + 'a>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other("blob writer already closed"))
    }
}

impl Write for BlobWriteGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl Drop for BlobWriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(writer) = self.inner.take() {
            if let Err(e) = writer.cancel() {
                warn!(bid = %self.bid, error = %e, "failed to cancel staged blob");
            }
        }
    }
}
