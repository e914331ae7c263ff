use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use crate::codec::{read_string, write_string};
use crate::error::{BlobError, BlobResult};

/// Upper bound for a serialized blob id or key inside payloads
pub(crate) const MAX_CAPABILITY_FIELD: usize = 1024;

/// Blob id and key pair: names a blob and unlocks its content.
///
/// Possession of a capability is the only access control, treat it as secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability {
    pub bid: String,
    pub key: String,
}

impl Capability {
    pub fn new(bid: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bid: bid.into(),
            key: key.into(),
        }
    }

    /// Serialize as `[string bid][string key]`
    pub fn write_to(&self, w: &mut (impl Write + ?Sized)) -> io::Result<()> {
        write_string(w, &self.bid)?;
        write_string(w, &self.key)
    }

    pub fn read_from(r: &mut (impl Read + ?Sized)) -> BlobResult<Self> {
        let bid = read_string(r, MAX_CAPABILITY_FIELD)?;
        let key = read_string(r, MAX_CAPABILITY_FIELD)?;
        Ok(Self { bid, key })
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bid, self.key)
    }
}

impl FromStr for Capability {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bid, key) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| BlobError::format("capability must look like <bid>:<key>"))?;
        if bid.is_empty() || !bid.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BlobError::format("capability blob id must be hex"));
        }
        if key.is_empty() {
            return Err(BlobError::invalid_key("capability has an empty key"));
        }
        Ok(Self::new(bid.to_ascii_lowercase(), key))
    }
}
