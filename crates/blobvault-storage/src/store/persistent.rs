//! redb-backed record store
//!
//! Each registered [`TableSchema`] becomes a redb table keyed by
//! [`RecordKey`]. Keys come from a per-table counter kept in the
//! `__sequences` table and bumped inside the same write transaction as the
//! insert, so a rolled-back insert never leaks a key into a committed state.
//!
//! Tables declared with a lookup get a companion multimap table from lookup
//! key to record keys, maintained in the same write transaction. Deleting
//! through a full scan leaves the lookup entries of removed records behind;
//! since record keys are never reused they cannot match a later record, and
//! they are dropped the next time their lookup key is visited.
//!
//! redb serializes writers, so this store never reports
//! [`StorageError::Conflict`]; read transactions are MVCC snapshots.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use tracing::{debug, info, instrument};

use super::{
    ReadTransaction, RecordKey, RecordPredicate, RecordStore, StoredRecord, TableSchema,
    WriteTransaction,
};
use crate::error::StorageError;

// Key: table name, Value: last key handed out for that table
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("__sequences");

type Registered = Arc<RwLock<HashSet<&'static str>>>;

fn records_table(schema: &TableSchema) -> TableDefinition<'static, RecordKey, &'static [u8]> {
    TableDefinition::new(schema.name())
}

fn lookup_table(
    schema: &TableSchema,
) -> Result<MultimapTableDefinition<'static, &'static str, RecordKey>, StorageError> {
    Ok(MultimapTableDefinition::new(schema.require_lookup()?))
}

fn ensure_registered(registered: &Registered, schema: &TableSchema) -> Result<(), StorageError> {
    if registered.read().contains(schema.name()) {
        Ok(())
    } else {
        Err(StorageError::schema(format!(
            "table '{}' is not registered",
            schema.name()
        )))
    }
}

/// Configuration for the redb record store
#[derive(Debug, Clone)]
pub struct RedbRecordStoreConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Cache size in bytes
    pub cache_size: usize,
}

impl Default for RedbRecordStoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/blobvault.redb"),
            cache_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl RedbRecordStoreConfig {
    /// Config for a database file at `db_path` with default cache size
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }
}

/// Persistent [`RecordStore`] on top of a single redb database file
pub struct RedbRecordStore {
    db: Arc<Database>,
    config: RedbRecordStoreConfig,
    registered: Registered,
}

impl std::fmt::Debug for RedbRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbRecordStore")
            .field("config", &self.config)
            .field("registered", &*self.registered.read())
            .finish()
    }
}

impl RedbRecordStore {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbRecordStoreConfig) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = config.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let db = redb::Builder::new()
            .set_cache_size(config.cache_size)
            .create(&config.db_path)?;

        let store = Self {
            db: Arc::new(db),
            config,
            registered: Arc::new(RwLock::new(HashSet::new())),
        };
        store.init_sequences()?;

        info!("Opened redb record store");
        Ok(store)
    }

    fn init_sequences(&self) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        write_txn.open_table(SEQUENCES)?;
        write_txn.commit()?;
        Ok(())
    }

    /// Get the configuration
    pub fn config(&self) -> &RedbRecordStoreConfig {
        &self.config
    }

    /// Whether `schema` has been registered through this handle
    pub fn is_registered(&self, schema: &TableSchema) -> bool {
        self.registered.read().contains(schema.name())
    }
}

impl RecordStore for RedbRecordStore {
    type Read = RedbReadTransaction;
    type Write = RedbWriteTransaction;

    #[instrument(skip(self), fields(table = schema.name()))]
    fn register(&self, schema: &TableSchema) -> Result<(), StorageError> {
        let write_txn = self.db.begin_write()?;
        // Creates the table if it does not exist yet, otherwise just opens it
        write_txn.open_table(records_table(schema))?;
        if schema.lookup().is_some() {
            write_txn.open_multimap_table(lookup_table(schema)?)?;
        }
        write_txn.commit()?;

        self.registered.write().insert(schema.name());
        debug!("Registered table");
        Ok(())
    }

    fn begin_read(&self) -> Result<Self::Read, StorageError> {
        Ok(RedbReadTransaction {
            txn: self.db.begin_read()?,
            registered: Arc::clone(&self.registered),
        })
    }

    fn begin_write(&self) -> Result<Self::Write, StorageError> {
        Ok(RedbWriteTransaction {
            txn: self.db.begin_write()?,
            registered: Arc::clone(&self.registered),
        })
    }
}

/// Read transaction over a redb snapshot
pub struct RedbReadTransaction {
    txn: redb::ReadTransaction,
    registered: Registered,
}

impl ReadTransaction for RedbReadTransaction {
    fn scan(
        &self,
        schema: &TableSchema,
        after: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        ensure_registered(&self.registered, schema)?;
        let table = self.txn.open_table(records_table(schema))?;
        scan_table(&table, after, limit)
    }
}

/// Read-write redb transaction
///
/// Dropping without commit rolls back.
pub struct RedbWriteTransaction {
    txn: redb::WriteTransaction,
    registered: Registered,
}

impl ReadTransaction for RedbWriteTransaction {
    fn scan(
        &self,
        schema: &TableSchema,
        after: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        ensure_registered(&self.registered, schema)?;
        let table = self.txn.open_table(records_table(schema))?;
        scan_table(&table, after, limit)
    }
}

impl RedbWriteTransaction {
    fn next_key(&self, schema: &TableSchema) -> Result<RecordKey, StorageError> {
        let mut sequences = self.txn.open_table(SEQUENCES)?;
        let last = sequences.get(schema.name())?.map(|v| v.value()).unwrap_or(0);
        let next = last
            .checked_add(1)
            .ok_or_else(|| StorageError::Database("record key space exhausted".into()))?;
        sequences.insert(schema.name(), next)?;
        Ok(next)
    }

    fn delete_by_lookup(
        &mut self,
        schema: &TableSchema,
        lookup: &str,
        predicate: &mut RecordPredicate<'_>,
    ) -> Result<usize, StorageError> {
        let candidates = {
            let index = self.txn.open_multimap_table(lookup_table(schema)?)?;
            let mut keys = Vec::new();
            for entry in index.get(lookup)? {
                keys.push(entry?.value());
            }
            keys
        };

        let mut table = self.txn.open_table(records_table(schema))?;
        let mut index = self.txn.open_multimap_table(lookup_table(schema)?)?;
        let mut removed = 0;
        for key in candidates {
            let matched = match table.get(key)? {
                Some(value) => predicate(value.value())?,
                None => {
                    // Record already gone through a full-scan delete
                    index.remove(lookup, key)?;
                    continue;
                }
            };
            if matched {
                table.remove(key)?;
                index.remove(lookup, key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn delete_by_scan(
        &mut self,
        schema: &TableSchema,
        predicate: &mut RecordPredicate<'_>,
    ) -> Result<usize, StorageError> {
        let mut table = self.txn.open_table(records_table(schema))?;

        let mut doomed = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            if predicate(value.value())? {
                doomed.push(key.value());
            }
        }

        for key in &doomed {
            table.remove(*key)?;
        }
        Ok(doomed.len())
    }
}

impl WriteTransaction for RedbWriteTransaction {
    fn create(&mut self, schema: &TableSchema, bytes: &[u8]) -> Result<RecordKey, StorageError> {
        ensure_registered(&self.registered, schema)?;

        let key = self.next_key(schema)?;
        let mut table = self.txn.open_table(records_table(schema))?;
        table.insert(key, bytes)?;
        Ok(key)
    }

    fn create_with_lookup(
        &mut self,
        schema: &TableSchema,
        lookup: &str,
        bytes: &[u8],
    ) -> Result<RecordKey, StorageError> {
        ensure_registered(&self.registered, schema)?;
        let definition = lookup_table(schema)?;

        let key = self.next_key(schema)?;
        self.txn.open_table(records_table(schema))?.insert(key, bytes)?;
        self.txn.open_multimap_table(definition)?.insert(lookup, key)?;
        Ok(key)
    }

    fn delete_matching(
        &mut self,
        schema: &TableSchema,
        lookup: Option<&str>,
        predicate: &mut RecordPredicate<'_>,
    ) -> Result<usize, StorageError> {
        ensure_registered(&self.registered, schema)?;
        match lookup {
            Some(lookup) => self.delete_by_lookup(schema, lookup, predicate),
            None => self.delete_by_scan(schema, predicate),
        }
    }

    fn commit(self) -> Result<(), StorageError> {
        self.txn.commit()?;
        Ok(())
    }

    fn abort(self) -> Result<(), StorageError> {
        self.txn.abort()?;
        Ok(())
    }
}

fn scan_table<T>(table: &T, after: Option<RecordKey>, limit: usize) -> Result<Vec<StoredRecord>, StorageError>
where
    T: ReadableTable<RecordKey, &'static [u8]>,
{
    let start = match after {
        Some(key) => match key.checked_add(1) {
            Some(next) => next,
            None => return Ok(Vec::new()),
        },
        None => 0,
    };

    let mut results = Vec::new();
    for entry in table.range(start..)?.take(limit) {
        let (key, value) = entry?;
        results.push(StoredRecord {
            key: key.value(),
            bytes: value.value().to_vec(),
        });
    }
    Ok(results)
}
