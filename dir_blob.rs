//! Directory blobs.
//!
//! A directory is a set of named entries, each pointing at another blob.
//! Entries are sorted before encoding so that a given entry set always
//! produces the same blobs, whatever order it was built in.
//!
//! ## Layout
//!
//! Up to `max_entries` entries fit in one simple directory blob:
//!
//! ```text
//! [SimpleStaticDir][count][name][mime_type][capability]...
//! ```
//!
//! Larger sets are cut into sorted groups, each stored as a simple
//! directory, and referenced by name range from split nodes:
//!
//! ```text
//! [SplitStaticDir][count][first_name][last_name][capability]...
//! ```
//!
//! Split nodes are themselves grouped until a single root remains.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::{self, Read, Write};
use tracing::debug;

use crate::blob_storage::BlobStorage;
use crate::capability::Capability;
use crate::cipher_factory::CipherFactory;
use crate::codec::{expect_end, read_count, read_string, write_int, write_string, BlobType};
use crate::error::{BlobError, BlobResult};
use crate::hash_validation::{create_hash_validated_blob, open_typed_blob};

/// Default number of entries per directory blob
pub const MAX_SIMPLE_DIR_ENTRIES: usize = 1024;

/// Smallest accepted directory fan-out
pub const MIN_DIR_FAN_OUT: usize = 2;

/// Largest accepted directory fan-out, the most entries a reader takes from one node
pub const MAX_DIR_FAN_OUT: usize = MAX_NODE_ENTRIES;

/// Mime type marking an entry as a subdirectory
pub const DIRECTORY_MIME_TYPE: &str = "application/x-cipherblob-dir";

const MAX_NAME_LEN: usize = 4096;
const MAX_MIME_LEN: usize = 256;
const MAX_NODE_ENTRIES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub mime_type: String,
    pub capability: Capability,
}

impl DirEntry {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        capability: Capability,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            capability,
        }
    }

    /// Entry for a subdirectory
    pub fn directory(name: impl Into<String>, capability: Capability) -> Self {
        Self::new(name, DIRECTORY_MIME_TYPE, capability)
    }

    pub fn is_dir(&self) -> bool {
        self.mime_type == DIRECTORY_MIME_TYPE
    }

    fn write_to(&self, w: &mut (impl Write + ?Sized)) -> io::Result<()> {
        write_string(w, &self.name)?;
        write_string(w, &self.mime_type)?;
        self.capability.write_to(w)
    }

    fn read_from(r: &mut (impl Read + ?Sized)) -> BlobResult<Self> {
        Ok(Self {
            name: read_string(r, MAX_NAME_LEN)?,
            mime_type: read_string(r, MAX_MIME_LEN)?,
            capability: Capability::read_from(r)?,
        })
    }
}

/// Byte order on names, remaining fields break ties between duplicates
fn entry_order(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.name
        .as_bytes()
        .cmp(b.name.as_bytes())
        .then_with(|| a.mime_type.as_bytes().cmp(b.mime_type.as_bytes()))
        .then_with(|| a.capability.cmp(&b.capability))
}

/// Reference from a split node to a child covering `first_name..=last_name`
#[derive(Debug, Clone, PartialEq, Eq)]
struct DirRef {
    first_name: String,
    last_name: String,
    capability: Capability,
}

impl DirRef {
    fn write_to(&self, w: &mut (impl Write + ?Sized)) -> io::Result<()> {
        write_string(w, &self.first_name)?;
        write_string(w, &self.last_name)?;
        self.capability.write_to(w)
    }

    fn read_from(r: &mut (impl Read + ?Sized)) -> BlobResult<Self> {
        Ok(Self {
            first_name: read_string(r, MAX_NAME_LEN)?,
            last_name: read_string(r, MAX_NAME_LEN)?,
            capability: Capability::read_from(r)?,
        })
    }

    fn covers(&self, name: &str) -> bool {
        self.first_name.as_bytes() <= name.as_bytes() && name.as_bytes() <= self.last_name.as_bytes()
    }
}

fn store_node<T>(
    blob_type: BlobType,
    items: &[T],
    write_item: impl Fn(&T, &mut Vec<u8>) -> io::Result<()>,
    storage: &dyn BlobStorage,
    factory: &dyn CipherFactory,
) -> BlobResult<Capability> {
    let mut payload = vec![blob_type.to_byte()];
    write_int(&mut payload, items.len() as u64)?;
    for item in items {
        write_item(item, &mut payload)?;
    }
    create_hash_validated_blob(|| payload.as_slice(), storage, factory)
}

/// Collects entries and stores them as a directory blob tree
pub struct DirBlobWriter<'a> {
    storage: &'a dyn BlobStorage,
    factory: &'a dyn CipherFactory,
    max_entries: usize,
    entries: Vec<DirEntry>,
}

impl<'a> DirBlobWriter<'a> {
    pub fn new(storage: &'a dyn BlobStorage, factory: &'a dyn CipherFactory) -> Self {
        Self::with_max_entries(storage, factory, MAX_SIMPLE_DIR_ENTRIES)
    }

    /// Writer with a custom fan-out, clamped to
    /// [`MIN_DIR_FAN_OUT`]..=[`MAX_DIR_FAN_OUT`]
    pub fn with_max_entries(
        storage: &'a dyn BlobStorage,
        factory: &'a dyn CipherFactory,
        max_entries: usize,
    ) -> Self {
        Self {
            storage,
            factory,
            max_entries: max_entries.clamp(MIN_DIR_FAN_OUT, MAX_DIR_FAN_OUT),
            entries: Vec::new(),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Queue an entry. Duplicate names are kept as given.
    pub fn add_entry(&mut self, entry: DirEntry) -> BlobResult<()> {
        if entry.name.len() > MAX_NAME_LEN {
            return Err(BlobError::format(format!(
                "entry name is {} bytes, limit is {}",
                entry.name.len(),
                MAX_NAME_LEN
            )));
        }
        if entry.mime_type.len() > MAX_MIME_LEN {
            return Err(BlobError::format(format!(
                "mime type of {:?} is {} bytes, limit is {}",
                entry.name,
                entry.mime_type.len(),
                MAX_MIME_LEN
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finalize(mut self) -> BlobResult<Capability> {
        self.entries.sort_by(entry_order);

        if self.entries.len() <= self.max_entries {
            let capability = self.store_entries(&self.entries)?;
            debug!(entries = self.entries.len(), bid = %capability.bid, "stored simple dir");
            return Ok(capability);
        }

        let mut refs = self
            .entries
            .chunks(self.max_entries)
            .map(|group| {
                Ok(DirRef {
                    first_name: group[0].name.clone(),
                    last_name: group[group.len() - 1].name.clone(),
                    capability: self.store_entries(group)?,
                })
            })
            .collect::<BlobResult<Vec<_>>>()?;

        let mut depth = 1;
        while refs.len() > self.max_entries {
            debug!(depth, refs = refs.len(), "grouping dir refs");
            refs = refs
                .chunks(self.max_entries)
                .map(|group| {
                    Ok(DirRef {
                        first_name: group[0].first_name.clone(),
                        last_name: group[group.len() - 1].last_name.clone(),
                        capability: self.store_refs(group)?,
                    })
                })
                .collect::<BlobResult<Vec<_>>>()?;
            depth += 1;
        }

        let capability = self.store_refs(&refs)?;
        debug!(
            entries = self.entries.len(),
            depth,
            bid = %capability.bid,
            "stored split dir"
        );
        Ok(capability)
    }

    fn store_entries(&self, entries: &[DirEntry]) -> BlobResult<Capability> {
        store_node(
            BlobType::SimpleStaticDir,
            entries,
            |e, w| e.write_to(w),
            self.storage,
            self.factory,
        )
    }

    fn store_refs(&self, refs: &[DirRef]) -> BlobResult<Capability> {
        store_node(
            BlobType::SplitStaticDir,
            refs,
            |r, w| r.write_to(w),
            self.storage,
            self.factory,
        )
    }
}

enum DirNode {
    Entries(Vec<DirEntry>),
    Refs(Vec<DirRef>),
}

fn read_node(
    capability: &Capability,
    storage: &dyn BlobStorage,
    factory: &dyn CipherFactory,
) -> BlobResult<DirNode> {
    let (blob_type, mut blob) = open_typed_blob(capability, storage, factory)?;
    let node = match blob_type {
        BlobType::SimpleStaticDir => {
            let count = read_count(&mut blob, MAX_NODE_ENTRIES, "dir entry")?;
            let entries = (0..count)
                .map(|_| DirEntry::read_from(&mut blob))
                .collect::<BlobResult<Vec<_>>>()?;
            DirNode::Entries(entries)
        }
        BlobType::SplitStaticDir => {
            let count = read_count(&mut blob, MAX_NODE_ENTRIES, "dir ref")?;
            let refs = (0..count)
                .map(|_| DirRef::read_from(&mut blob))
                .collect::<BlobResult<Vec<_>>>()?;
            DirNode::Refs(refs)
        }
        other => {
            return Err(BlobError::format(format!(
                "expected a directory blob but found {:?}",
                other
            )))
        }
    };
    expect_end(&mut blob)?;
    Ok(node)
}

/// All entries of a directory, in sorted order
pub fn read_dir(
    capability: &Capability,
    storage: &dyn BlobStorage,
    factory: &dyn CipherFactory,
) -> BlobResult<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut pending = vec![capability.clone()];

    while let Some(next) = pending.pop() {
        match read_node(&next, storage, factory)? {
            DirNode::Entries(mut found) => entries.append(&mut found),
            DirNode::Refs(refs) => {
                pending.extend(refs.into_iter().rev().map(|r| r.capability));
            }
        }
    }

    Ok(entries)
}

/// Find an entry by name. With duplicate names the first in sort order wins.
pub fn lookup(
    capability: &Capability,
    name: &str,
    storage: &dyn BlobStorage,
    factory: &dyn CipherFactory,
) -> BlobResult<Option<DirEntry>> {
    let mut current = capability.clone();
    loop {
        match read_node(&current, storage, factory)? {
            DirNode::Entries(entries) => {
                return Ok(entries.into_iter().find(|e| e.name == name));
            }
            DirNode::Refs(refs) => match refs.into_iter().find(|r| r.covers(name)) {
                Some(r) => current = r.capability,
                None => return Ok(None),
            },
        }
    }
}
