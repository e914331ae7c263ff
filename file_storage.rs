//! File system blob storage.
//!
//! ## Layout
//!
//! ```text
//! <root>/<bid[0..2]>/<bid>     committed blobs
//! <root>/.staged-XXXXXX        in-flight writes
//! ```
//!
//! Writes are staged in a temp file inside the root and committed with an
//! atomic no-clobber link, so a blob file is either absent or complete.
//! When two writers race on one id the link lets exactly one of them win;
//! the loser compares contents to tell dedup from collision.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::blob_storage::{BlobStorage, StagedWriter};
use crate::error::{BlobError, BlobResult};

const STAGED_PREFIX: &str = ".staged-";
const COMPARE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FileBlobStorage {
    root: PathBuf,
}

impl FileBlobStorage {
    /// Open a storage rooted at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> BlobResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), "opened file blob storage");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, bid: &str) -> BlobResult<PathBuf> {
        let valid = bid.len() >= 2
            && bid
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(BlobError::format(format!("invalid blob id: {:?}", bid)));
        }
        Ok(self.root.join(&bid[..2]).join(bid))
    }

    pub fn exists(&self, bid: &str) -> bool {
        self.blob_path(bid).map(|p| p.is_file()).unwrap_or(false)
    }

    /// List committed blobs as (bid, size_bytes), sorted by id
    pub fn list_blobs(&self) -> BlobResult<Vec<(String, u64)>> {
        let mut blobs = Vec::new();

        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }

            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                if name.starts_with('.') || !entry.file_type()?.is_file() {
                    continue;
                }
                blobs.push((name, entry.metadata()?.len()));
            }
        }

        blobs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(blobs)
    }
}

struct FileBlobWriter {
    bid: String,
    target: PathBuf,
    staged: NamedTempFile,
}

impl Write for FileBlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staged.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staged.flush()
    }
}

/// Compare two streams of equal, known length
fn same_content(a: &mut impl Read, b: &mut impl Read, len: u64) -> io::Result<bool> {
    let mut buf_a = vec![0u8; COMPARE_CHUNK];
    let mut buf_b = vec![0u8; COMPARE_CHUNK];
    let mut remaining = len;

    while remaining > 0 {
        let n = remaining.min(COMPARE_CHUNK as u64) as usize;
        a.read_exact(&mut buf_a[..n])?;
        b.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
        remaining -= n as u64;
    }
    Ok(true)
}

impl StagedWriter for FileBlobWriter {
    fn finalize(self: Box<Self>) -> BlobResult<()> {
        let FileBlobWriter {
            bid,
            target,
            mut staged,
        } = *self;

        staged.flush()?;
        staged.as_file().sync_all()?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let err = match staged.persist_noclobber(&target) {
            Ok(_) => {
                debug!(bid = %bid, path = %target.display(), "blob committed");
                return Ok(());
            }
            Err(err) => err,
        };
        if err.error.kind() != io::ErrorKind::AlreadyExists {
            return Err(err.error.into());
        }

        // Someone committed this id first: dedup or collision
        let mut staged = err.file;
        let mut existing = File::open(&target)?;
        let staged_len = staged.as_file().metadata()?.len();
        let existing_len = existing.metadata()?.len();

        staged.seek(SeekFrom::Start(0))?;
        let identical = staged_len == existing_len
            && same_content(&mut staged, &mut existing, staged_len)?;
        if identical {
            debug!(bid = %bid, "blob already stored, dedup");
            Ok(())
        } else {
            warn!(bid = %bid, "blob id collision");
            Err(BlobError::BidCollision(bid))
        }
    }

    fn cancel(self: Box<Self>) -> BlobResult<()> {
        debug!(bid = %self.bid, "staged blob discarded");
        self.staged.close()?;
        Ok(())
    }
}

impl BlobStorage for FileBlobStorage {
    fn new_blob_writer(&self, bid: &str) -> BlobResult<Box<dyn StagedWriter + '_>> {
        let target = self.blob_path(bid)?;
        let staged = tempfile::Builder::new()
            .prefix(STAGED_PREFIX)
            .tempfile_in(&self.root)?;
        Ok(Box::new(FileBlobWriter {
            bid: bid.to_string(),
            target,
            staged,
        }))
    }

    fn new_blob_reader(&self, bid: &str) -> BlobResult<Box<dyn Read + Send + '_>> {
        let path = self.blob_path(bid)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BlobError::BidNotFound(bid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
