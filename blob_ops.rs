//! High-level blob operations.
//!
//! This module provides [`BlobOps`], the primary interface for storing and
//! retrieving files and directories as encrypted, content-addressed blobs.
//!
//! ## Features
//!
//! - Buffer and streaming file writes, split into blocks past the block size
//! - Streaming reads with hash validation of every blob
//! - Directory trees with name lookup
//! - Pluggable storage backends and cipher factories

use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, info};

use crate::blob_storage::BlobStorage;
use crate::capability::Capability;
use crate::cipher_factory::{self, CipherFactory};
use crate::codec::BlobType;
use crate::config::Config;
use crate::dir_blob::{
    self, DirBlobWriter, DirEntry, MAX_DIR_FAN_OUT, MAX_SIMPLE_DIR_ENTRIES, MIN_DIR_FAN_OUT,
};
use crate::error::{BlobError, BlobResult};
use crate::file_blob::{FileBlobReader, FileBlobWriter, BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::file_storage::FileBlobStorage;
use crate::hash_validation::open_typed_blob;

/// Cheap to clone, clones share storage and factory.
#[derive(Clone)]
pub struct BlobOps {
    storage: Arc<dyn BlobStorage>,
    factory: Arc<dyn CipherFactory>,
    block_size: usize,
    max_dir_entries: usize,
}

impl BlobOps {
    pub fn new(storage: Arc<dyn BlobStorage>) -> Self {
        Self {
            storage,
            factory: Arc::new(cipher_factory::create()),
            block_size: BLOCK_SIZE,
            max_dir_entries: MAX_SIMPLE_DIR_ENTRIES,
        }
    }

    /// File-backed instance using the configured directory and policy
    pub fn open(config: &Config) -> BlobResult<Self> {
        config
            .validate()
            .map_err(|e| BlobError::config(format!("{:#}", e)))?;
        let storage = FileBlobStorage::open(&config.storage_dir)?;
        Ok(Self::new(Arc::new(storage))
            .with_block_size(config.block_size)
            .with_max_dir_entries(config.max_simple_dir_entries))
    }

    pub fn with_factory(mut self, factory: Arc<dyn CipherFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Clamped to [`MIN_BLOCK_SIZE`]..=[`MAX_BLOCK_SIZE`]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        self
    }

    /// Clamped to [`MIN_DIR_FAN_OUT`]..=[`MAX_DIR_FAN_OUT`]
    pub fn with_max_dir_entries(mut self, max_entries: usize) -> Self {
        self.max_dir_entries = max_entries.clamp(MIN_DIR_FAN_OUT, MAX_DIR_FAN_OUT);
        self
    }

    pub fn storage(&self) -> &dyn BlobStorage {
        self.storage.as_ref()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max_dir_entries(&self) -> usize {
        self.max_dir_entries
    }

    pub fn file_writer(&self) -> FileBlobWriter<'_> {
        FileBlobWriter::with_block_size(
            self.storage.as_ref(),
            self.factory.as_ref(),
            self.block_size,
        )
    }

    pub fn dir_writer(&self) -> DirBlobWriter<'_> {
        DirBlobWriter::with_max_entries(
            self.storage.as_ref(),
            self.factory.as_ref(),
            self.max_dir_entries,
        )
    }

    pub fn write_file(&self, data: &[u8]) -> BlobResult<Capability> {
        debug!(size = data.len(), "storing file (buffer mode)");
        let mut writer = self.file_writer();
        writer.write_all(data).map_err(BlobError::from_io)?;
        let capability = writer.finalize()?;
        info!(size = data.len(), bid = %capability.bid, "file stored");
        Ok(capability)
    }

    /// Store everything `reader` yields, returning the capability and byte count.
    /// Memory use stays bounded by one block.
    pub fn write_file_stream<R>(&self, reader: &mut R) -> BlobResult<(Capability, u64)>
    where
        R: Read + ?Sized,
    {
        debug!(block_size = self.block_size, "storing file (streaming mode)");
        let mut writer = self.file_writer();
        let size = io::copy(reader, &mut writer).map_err(BlobError::from_io)?;
        let capability = writer.finalize()?;
        info!(size, bid = %capability.bid, "file stored (streaming)");
        Ok((capability, size))
    }

    pub fn open_file(&self, capability: &Capability) -> BlobResult<FileBlobReader<'_>> {
        FileBlobReader::open(capability, self.storage.as_ref(), self.factory.as_ref())
    }

    pub fn read_file(&self, capability: &Capability) -> BlobResult<Vec<u8>> {
        debug!(bid = %capability.bid, "reading file (buffer mode)");
        let mut data = Vec::new();
        self.open_file(capability)?
            .read_to_end(&mut data)
            .map_err(BlobError::from_io)?;
        info!(bid = %capability.bid, size = data.len(), "file read");
        Ok(data)
    }

    /// Stream file content into `writer`, returning the number of bytes written
    pub fn read_file_stream<W>(&self, capability: &Capability, writer: &mut W) -> BlobResult<u64>
    where
        W: Write + ?Sized,
    {
        debug!(bid = %capability.bid, "reading file (streaming mode)");
        let mut reader = self.open_file(capability)?;
        let size = io::copy(&mut reader, writer).map_err(BlobError::from_io)?;
        info!(bid = %capability.bid, size, "file read (streaming)");
        Ok(size)
    }

    pub fn write_dir<I>(&self, entries: I) -> BlobResult<Capability>
    where
        I: IntoIterator<Item = DirEntry>,
    {
        let mut writer = self.dir_writer();
        for entry in entries {
            writer.add_entry(entry)?;
        }
        let count = writer.len();
        let capability = writer.finalize()?;
        info!(entries = count, bid = %capability.bid, "directory stored");
        Ok(capability)
    }

    pub fn read_dir(&self, capability: &Capability) -> BlobResult<Vec<DirEntry>> {
        dir_blob::read_dir(capability, self.storage.as_ref(), self.factory.as_ref())
    }

    pub fn lookup(&self, capability: &Capability, name: &str) -> BlobResult<Option<DirEntry>> {
        dir_blob::lookup(capability, name, self.storage.as_ref(), self.factory.as_ref())
    }

    /// Payload type of the blob behind `capability`. Validates the whole blob.
    pub fn blob_type(&self, capability: &Capability) -> BlobResult<BlobType> {
        let (blob_type, mut rest) =
            open_typed_blob(capability, self.storage.as_ref(), self.factory.as_ref())?;
        // drain so the hash check runs
        io::copy(&mut rest, &mut io::sink()).map_err(BlobError::from_io)?;
        Ok(blob_type)
    }
}
