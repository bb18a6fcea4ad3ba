//! Transactional record stores
//!
//! The index talks to its backing store only through the traits in this
//! module:
//! - [`RecordStore`] registers tables and hands out transactions
//! - [`ReadTransaction`] pages through a consistent snapshot
//! - [`WriteTransaction`] creates and deletes records, then commits or aborts
//!
//! Records are opaque byte strings; encoding belongs to the caller. Each
//! record gets a store-assigned [`RecordKey`] that is never reused within a
//! table. A table declared with a lookup can also file each record under a
//! caller-chosen lookup key, so deletes by that key only visit its records.

pub mod memory;
pub mod persistent;

pub use memory::InMemoryRecordStore;
pub use persistent::{RedbRecordStore, RedbRecordStoreConfig};

use crate::error::StorageError;

/// Store-assigned identity of a record, distinct from any domain key
pub type RecordKey = u64;

/// Predicate used by [`WriteTransaction::delete_matching`]
pub type RecordPredicate<'a> = dyn FnMut(&[u8]) -> Result<bool, StorageError> + 'a;

/// Declared shape of a table
///
/// Only the names are persisted; the record layout is owned by whoever
/// encodes the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableSchema {
    name: &'static str,
    lookup: Option<&'static str>,
}

impl TableSchema {
    /// Declare a table
    pub const fn new(name: &'static str) -> Self {
        Self { name, lookup: None }
    }

    /// Also keep a lookup table named `lookup` mapping lookup keys to
    /// record keys
    pub const fn with_lookup(self, lookup: &'static str) -> Self {
        Self {
            name: self.name,
            lookup: Some(lookup),
        }
    }

    /// Table name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lookup table name, if the table has one
    pub fn lookup(&self) -> Option<&'static str> {
        self.lookup
    }

    pub(crate) fn require_lookup(&self) -> Result<&'static str, StorageError> {
        self.lookup.ok_or_else(|| {
            StorageError::schema(format!("table '{}' has no lookup", self.name))
        })
    }
}

/// A record as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Store-assigned key
    pub key: RecordKey,
    /// Encoded record
    pub bytes: Vec<u8>,
}

/// A store that can register tables and open transactions
pub trait RecordStore: Send + Sync {
    /// Read-only snapshot transaction
    type Read: ReadTransaction;
    /// Read-write transaction
    type Write: WriteTransaction;

    /// Declare a table. Registering an existing table is a no-op.
    fn register(&self, schema: &TableSchema) -> Result<(), StorageError>;

    /// Open a read transaction over a consistent snapshot
    fn begin_read(&self) -> Result<Self::Read, StorageError>;

    /// Open a write transaction
    fn begin_write(&self) -> Result<Self::Write, StorageError>;
}

/// Operations available on any open transaction
pub trait ReadTransaction {
    /// Return up to `limit` records with keys strictly greater than `after`,
    /// in ascending key order
    fn scan(
        &self,
        schema: &TableSchema,
        after: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError>;
}

/// Operations available on a write transaction
///
/// Dropping a write transaction without calling [`commit`](Self::commit)
/// discards its changes.
pub trait WriteTransaction: ReadTransaction {
    /// Insert a record and return its new key
    fn create(&mut self, schema: &TableSchema, bytes: &[u8]) -> Result<RecordKey, StorageError>;

    /// Insert a record filed under `lookup` and return its new key.
    /// Several records may share a lookup key.
    ///
    /// Fails with [`StorageError::Schema`] if the table has no lookup.
    fn create_with_lookup(
        &mut self,
        schema: &TableSchema,
        lookup: &str,
        bytes: &[u8],
    ) -> Result<RecordKey, StorageError>;

    /// Delete every record for which `predicate` returns `true`.
    /// Returns the number of records deleted.
    ///
    /// With `lookup` set, only records filed under that lookup key are
    /// offered to the predicate; otherwise the whole table is scanned.
    fn delete_matching(
        &mut self,
        schema: &TableSchema,
        lookup: Option<&str>,
        predicate: &mut RecordPredicate<'_>,
    ) -> Result<usize, StorageError>;

    /// Make the changes durable and visible to later transactions
    fn commit(self) -> Result<(), StorageError>;

    /// Discard the changes
    fn abort(self) -> Result<(), StorageError>;
}
