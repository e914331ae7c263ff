//! Chunked file blobs.
//!
//! [`FileBlobWriter`] accepts an arbitrarily long byte stream and produces a
//! single capability for it. [`FileBlobReader`] streams the content back.
//!
//! ## Layout
//!
//! Content of at most `block_size` bytes is stored as one blob:
//!
//! ```text
//! [SimpleFile][content...]
//! ```
//!
//! Larger content is cut into `block_size` blocks, each stored as its own
//! `SimpleFile` blob, and listed by index nodes:
//!
//! ```text
//! [SplitFile][count][size][capability]...
//! ```
//!
//! An index node that would exceed `block_size` is split as well, giving a
//! shallow tree whose leaves are data blocks in stream order. Identical
//! blocks share one stored blob.

use std::io::{self, Cursor, Read, Write};
use tracing::{debug, info};

use crate::blob_storage::BlobStorage;
use crate::capability::Capability;
use crate::cipher_factory::CipherFactory;
use crate::codec::{expect_end, read_count, read_int, write_int, BlobType};
use crate::error::{BlobError, BlobResult};
use crate::hash_validation::{create_hash_validated_blob, open_typed_blob};

/// Default block size (16MiB)
pub const BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Smallest accepted block size
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Largest accepted block size (1GiB). An index node this large holds far
/// fewer than [`MAX_INDEX_ENTRIES`] capabilities.
pub const MAX_BLOCK_SIZE: usize = 1 << 30;

/// Worst case size of an index node header: type tag plus entry count
const INDEX_HEADER_MAX: usize = 1 + 9;

/// Bound on the entry count of a single index node, enforced on both sides
pub const MAX_INDEX_ENTRIES: usize = 1 << 24;

/// Initial accumulation buffer capacity, grown on demand up to the block size
const INITIAL_BUFFER: usize = 64 * 1024;

/// One child of an index node: content size covered and its capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub size: u64,
    pub capability: Capability,
}

impl IndexEntry {
    fn write_to(&self, w: &mut (impl Write + ?Sized)) -> io::Result<()> {
        write_int(w, self.size)?;
        self.capability.write_to(w)
    }

    fn read_from(r: &mut (impl Read + ?Sized)) -> BlobResult<Self> {
        let size = read_int(r)?;
        let capability = Capability::read_from(r)?;
        Ok(Self { size, capability })
    }
}

/// Store `data` as a single `SimpleFile` blob
fn store_simple_file(
    data: &[u8],
    storage: &dyn BlobStorage,
    factory: &dyn CipherFactory,
) -> BlobResult<Capability> {
    create_hash_validated_blob(
        || Cursor::new([BlobType::SimpleFile.to_byte()]).chain(data),
        storage,
        factory,
    )
}

struct IndexNode {
    size: u64,
    payload: Vec<u8>,
}

/// Greedily pack entries into index nodes of at most `block_size` bytes and
/// `max_entries` entries. Every node but the last holds at least two entries.
fn pack_index_nodes(
    entries: &[IndexEntry],
    block_size: usize,
    max_entries: usize,
) -> io::Result<Vec<IndexNode>> {
    let max_entries = max_entries.max(2) as u64;
    let mut nodes = Vec::new();
    let mut body = Vec::new();
    let mut count = 0u64;
    let mut size = 0u64;

    let mut seal = |body: &mut Vec<u8>, count: u64, size: u64| -> io::Result<()> {
        let mut payload = Vec::with_capacity(INDEX_HEADER_MAX + body.len());
        payload.push(BlobType::SplitFile.to_byte());
        write_int(&mut payload, count)?;
        payload.append(body);
        nodes.push(IndexNode { size, payload });
        Ok(())
    };

    let mut encoded = Vec::new();
    for entry in entries {
        encoded.clear();
        entry.write_to(&mut encoded)?;

        let too_big = INDEX_HEADER_MAX + body.len() + encoded.len() > block_size;
        if count >= max_entries || (count >= 2 && too_big) {
            seal(&mut body, count, size)?;
            count = 0;
            size = 0;
        }
        body.extend_from_slice(&encoded);
        count += 1;
        size += entry.size;
    }
    if count > 0 {
        seal(&mut body, count, size)?;
    }

    Ok(nodes)
}

/// Store index nodes level by level until a single root remains
fn store_index(
    entries: Vec<IndexEntry>,
    block_size: usize,
    storage: &dyn BlobStorage,
    factory: &dyn CipherFactory,
) -> BlobResult<Capability> {
    let mut level = entries;
    let mut depth = 1;
    loop {
        let mut nodes = pack_index_nodes(&level, block_size, MAX_INDEX_ENTRIES)?;
        if nodes.len() == 1 {
            if let Some(root) = nodes.pop() {
                debug!(depth, entries = level.len(), "storing index root");
                return create_hash_validated_blob(|| root.payload.as_slice(), storage, factory);
            }
        }

        level = nodes
            .iter()
            .map(|node| {
                let capability =
                    create_hash_validated_blob(|| node.payload.as_slice(), storage, factory)?;
                Ok(IndexEntry {
                    size: node.size,
                    capability,
                })
            })
            .collect::<BlobResult<Vec<_>>>()?;
        debug!(depth, nodes = level.len(), "stored index level");
        depth += 1;
    }
}

/// Streaming writer producing one capability for the whole stream.
///
/// Memory use is bounded by one block plus one capability per stored block.
pub struct FileBlobWriter<'a> {
    storage: &'a dyn BlobStorage,
    factory: &'a dyn CipherFactory,
    block_size: usize,
    buffer: Vec<u8>,
    blocks: Vec<IndexEntry>,
    failed: bool,
}

impl<'a> FileBlobWriter<'a> {
    pub fn new(storage: &'a dyn BlobStorage, factory: &'a dyn CipherFactory) -> Self {
        Self::with_block_size(storage, factory, BLOCK_SIZE)
    }

    /// Writer with a custom block size, clamped to
    /// [`MIN_BLOCK_SIZE`]..=[`MAX_BLOCK_SIZE`]
    pub fn with_block_size(
        storage: &'a dyn BlobStorage,
        factory: &'a dyn CipherFactory,
        block_size: usize,
    ) -> Self {
        let block_size = block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        Self {
            storage,
            factory,
            block_size,
            buffer: Vec::with_capacity(INITIAL_BUFFER.min(block_size)),
            blocks: Vec::new(),
            failed: false,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total bytes accepted so far
    pub fn written(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum::<u64>() + self.buffer.len() as u64
    }

    fn store_block(&mut self) -> BlobResult<()> {
        let capability = store_simple_file(&self.buffer, self.storage, self.factory)?;
        debug!(
            block = self.blocks.len(),
            size = self.buffer.len(),
            bid = %capability.bid,
            "stored file block"
        );
        self.blocks.push(IndexEntry {
            size: self.buffer.len() as u64,
            capability,
        });
        self.buffer.clear();
        Ok(())
    }

    /// Store everything written so far and return the file's capability
    pub fn finalize(mut self) -> BlobResult<Capability> {
        if self.failed {
            return Err(BlobError::storage(
                "file writer aborted after a failed block store",
            ));
        }

        if self.blocks.is_empty() {
            let capability = store_simple_file(&self.buffer, self.storage, self.factory)?;
            debug!(size = self.buffer.len(), bid = %capability.bid, "stored simple file");
            return Ok(capability);
        }

        if !self.buffer.is_empty() {
            self.store_block()?;
        }
        let size = self.written();
        let blocks = std::mem::take(&mut self.blocks);
        let block_count = blocks.len();
        let capability = store_index(blocks, self.block_size, self.storage, self.factory)?;
        info!(size, blocks = block_count, bid = %capability.bid, "stored split file");
        Ok(capability)
    }
}

impl Write for FileBlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failed {
            return Err(io::Error::other("file writer aborted after a failed block store"));
        }

        let mut rest = buf;
        while !rest.is_empty() {
            // A full buffer is only flushed once more data arrives, so content
            // of exactly one block stays a simple file
            if self.buffer.len() == self.block_size {
                if let Err(e) = self.store_block() {
                    self.failed = true;
                    return Err(e.into());
                }
            }
            let take = (self.block_size - self.buffer.len()).min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Streaming reader over a file capability.
///
/// Walks the index tree depth-first, holding one node's children per level.
/// Sizes recorded in index nodes are checked against the children's sizes
/// and against the bytes each data block actually yields.
pub struct FileBlobReader<'a> {
    storage: &'a dyn BlobStorage,
    factory: &'a dyn CipherFactory,
    /// Blobs still to visit with the size their parent recorded, next one last
    pending: Vec<(Capability, Option<u64>)>,
    current: Option<Box<dyn Read + 'a>>,
    /// Recorded size of the current block and bytes read from it so far
    expected: Option<u64>,
    streamed: u64,
}

impl<'a> FileBlobReader<'a> {
    pub fn open(
        capability: &Capability,
        storage: &'a dyn BlobStorage,
        factory: &'a dyn CipherFactory,
    ) -> BlobResult<Self> {
        let mut reader = Self {
            storage,
            factory,
            pending: vec![(capability.clone(), None)],
            current: None,
            expected: None,
            streamed: 0,
        };
        reader.advance()?;
        Ok(reader)
    }

    /// Open pending blobs until a data block is current or nothing is left
    fn advance(&mut self) -> BlobResult<()> {
        while let Some((capability, expected)) = self.pending.pop() {
            let (blob_type, mut blob) = open_typed_blob(&capability, self.storage, self.factory)?;
            match blob_type {
                BlobType::SimpleFile => {
                    self.current = Some(blob);
                    self.expected = expected;
                    self.streamed = 0;
                    return Ok(());
                }
                BlobType::SplitFile => {
                    let count = read_count(&mut blob, MAX_INDEX_ENTRIES, "index entry")?;
                    let mut children = Vec::with_capacity(count.min(1024));
                    let mut total = 0u64;
                    for _ in 0..count {
                        let entry = IndexEntry::read_from(&mut blob)?;
                        total = total.checked_add(entry.size).ok_or_else(|| {
                            BlobError::format("index entry sizes overflow")
                        })?;
                        children.push((entry.capability, Some(entry.size)));
                    }
                    expect_end(&mut blob)?;
                    check_size(&capability, expected, total)?;
                    self.pending.extend(children.into_iter().rev());
                }
                other => {
                    return Err(BlobError::format(format!(
                        "expected a file blob but found {:?}",
                        other
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Fail unless an index node covers the size its parent recorded for it
fn check_size(capability: &Capability, expected: Option<u64>, actual: u64) -> BlobResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(BlobError::format(format!(
            "index node {} covers {} bytes but its parent records {}",
            capability.bid, actual, expected
        ))),
        _ => Ok(()),
    }
}

impl Read for FileBlobReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(current) = self.current.as_mut() {
                let n = current.read(buf)?;
                self.streamed += n as u64;
                if let Some(expected) = self.expected {
                    if self.streamed > expected {
                        return Err(BlobError::format(format!(
                            "file block is longer than the {} bytes its index records",
                            expected
                        ))
                        .into());
                    }
                    if n == 0 && self.streamed < expected {
                        return Err(BlobError::format(format!(
                            "file block holds {} bytes but its index records {}",
                            self.streamed, expected
                        ))
                        .into());
                    }
                }
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            if self.pending.is_empty() {
                return Ok(0);
            }
            self.advance()?;
        }
    }
}
