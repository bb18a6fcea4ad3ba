//! Blob identifier type

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Opaque identifier of a blob in the blob store
///
/// The inner string is the unique string form handed out by the blob store
/// (for example `sha1:9f2c...` or `blake3:ab01...`). The index never parses
/// it beyond rejecting empty values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId(String);

impl BlobId {
    /// Prefix used for ids derived with [`BlobId::for_content`]
    pub const CONTENT_PREFIX: &'static str = "blake3:";

    /// Create a blob id from its unique string form
    pub fn new(unique: impl Into<String>) -> Result<Self, StorageError> {
        let unique = unique.into();
        if unique.trim().is_empty() {
            return Err(StorageError::InvalidBlobId(
                "blob id must not be empty".to_string(),
            ));
        }
        Ok(Self(unique))
    }

    /// Derive a content-addressed id from blob bytes
    pub fn for_content(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Self(format!(
            "{}{}",
            Self::CONTENT_PREFIX,
            hex::encode(hash.as_bytes())
        ))
    }

    /// The unique string form
    pub fn as_unique_str(&self) -> &str {
        &self.0
    }

    /// Short form for log output (first 12 chars)
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Consume the id and return its string form
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BlobId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> Self {
        id.0
    }
}

impl AsRef<str> for BlobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
