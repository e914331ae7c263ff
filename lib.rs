//! # cipherblob - Convergently Encrypted Blob Storage
//!
//! cipherblob stores files and directories as encrypted, content-addressed
//! blobs. Every blob is encrypted with a key derived from its own plaintext,
//! so identical content always produces the same blob and is stored once.
//!
//! ## Features
//!
//! - **Convergent encryption**: XChaCha20 keyed by a hash of the plaintext
//! - **Content addressing**: blob ids are the SHA-512 of the stored ciphertext
//! - **Capabilities**: a `(bid, key)` pair is all that is needed to read a blob
//! - **Split files**: large files become block trees with block-level dedup
//! - **Directories**: sorted entry sets, split by name range when large
//! - **Pluggable storage**: in-memory and file system backends
//!
//! ## Quick Start
//!
//! ```no_run
//! use cipherblob::{blob_ops::BlobOps, config::Config, dir_blob::DirEntry};
//!
//! fn main() -> anyhow::Result<()> {
//!     let cfg = Config::new("./blobs");
//!     let ops = BlobOps::open(&cfg)?;
//!
//!     // Store a file
//!     let file = ops.write_file(b"sensitive data")?;
//!
//!     // Store a directory referencing it
//!     let dir = ops.write_dir([DirEntry::new("notes.txt", "text/plain", file.clone())])?;
//!     println!("{}", dir);
//!
//!     // Read it back
//!     let data = ops.read_file(&file)?;
//!     assert_eq!(data, b"sensitive data");
//!     Ok(())
//! }
//! ```
//!
//! ## Blob Format
//!
//! - **Stored**: validation method tag, then ciphertext
//! - **Plaintext**: payload type tag, then the type specific body

pub mod blob_ops;
pub mod blob_storage;
pub mod capability;
pub mod cipher_factory;
pub mod codec;
pub mod config;
pub mod dir_blob;
pub mod error;
pub mod file_blob;
pub mod file_storage;
pub mod hash_validation;
pub mod key;
pub mod memory_storage;
pub mod streaming;

// Re-export common types for convenience
pub use capability::Capability;
pub use error::{BlobError, BlobResult};
