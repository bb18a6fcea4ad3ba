//! In-memory record store
//!
//! Optimistic concurrency with first-committer-wins: every transaction works
//! on a copy-on-write snapshot of the tables, and a write transaction that
//! changed anything only commits if no other writer committed since it
//! began. Otherwise commit fails with [`StorageError::Conflict`].
//!
//! Suitable for testing and simulation. Faults can be injected to exercise
//! retry paths deterministically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{
    ReadTransaction, RecordKey, RecordPredicate, RecordStore, StoredRecord, TableSchema,
    WriteTransaction,
};
use crate::error::StorageError;

#[derive(Debug, Clone, Default)]
struct TableData {
    records: BTreeMap<RecordKey, Vec<u8>>,
    // Lookup key -> keys of live records filed under it
    lookup: HashMap<String, BTreeSet<RecordKey>>,
}

impl TableData {
    fn remove_records(&mut self, keys: &[RecordKey]) {
        for key in keys {
            self.records.remove(key);
        }
        for filed in self.lookup.values_mut() {
            for key in keys {
                filed.remove(key);
            }
        }
        self.lookup.retain(|_, filed| !filed.is_empty());
    }
}

type Table = Arc<TableData>;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    tables: HashMap<&'static str, Table>,
    sequences: HashMap<&'static str, RecordKey>,
}

impl Snapshot {
    fn table(&self, schema: &TableSchema) -> Result<&Table, StorageError> {
        self.tables.get(schema.name()).ok_or_else(|| {
            StorageError::schema(format!("table '{}' is not registered", schema.name()))
        })
    }

    fn table_mut(&mut self, schema: &TableSchema) -> Result<&mut TableData, StorageError> {
        self.tables
            .get_mut(schema.name())
            .map(Arc::make_mut)
            .ok_or_else(|| {
                StorageError::schema(format!("table '{}' is not registered", schema.name()))
            })
    }
}

#[derive(Debug, Default)]
struct Committed {
    version: u64,
    snapshot: Snapshot,
}

#[derive(Debug, Default)]
struct Inner {
    committed: RwLock<Committed>,
    injected_conflicts: AtomicU32,
    unavailable: AtomicBool,
    commit_attempts: AtomicU64,
}

/// In-memory [`RecordStore`] with optimistic concurrency control
///
/// Cloning yields another handle to the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    inner: Arc<Inner>,
}

impl InMemoryRecordStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with [`StorageError::Conflict`]
    pub fn inject_conflicts(&self, count: u32) {
        self.inner.injected_conflicts.fetch_add(count, Ordering::SeqCst);
    }

    /// Number of injected conflicts not yet consumed
    pub fn pending_injected_conflicts(&self) -> u32 {
        self.inner.injected_conflicts.load(Ordering::SeqCst)
    }

    /// Make `begin_read`/`begin_write` fail with [`StorageError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Total number of commit calls, successful or not
    pub fn commit_attempts(&self) -> u64 {
        self.inner.commit_attempts.load(Ordering::SeqCst)
    }

    /// Number of committed records in a table (0 if unregistered)
    pub fn record_count(&self, schema: &TableSchema) -> usize {
        self.inner
            .committed
            .read()
            .snapshot
            .tables
            .get(schema.name())
            .map_or(0, |t| t.records.len())
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::unavailable("in-memory store marked unavailable"))
        } else {
            Ok(())
        }
    }

    fn take_injected_conflict(&self) -> bool {
        self.inner
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RecordStore for InMemoryRecordStore {
    type Read = InMemoryReadTransaction;
    type Write = InMemoryWriteTransaction;

    fn register(&self, schema: &TableSchema) -> Result<(), StorageError> {
        self.check_available()?;
        let mut committed = self.inner.committed.write();
        if !committed.snapshot.tables.contains_key(schema.name()) {
            committed
                .snapshot
                .tables
                .insert(schema.name(), Arc::new(TableData::default()));
            committed.version += 1;
            debug!(table = schema.name(), "Registered in-memory table");
        }
        Ok(())
    }

    fn begin_read(&self) -> Result<Self::Read, StorageError> {
        self.check_available()?;
        let committed = self.inner.committed.read();
        Ok(InMemoryReadTransaction {
            snapshot: committed.snapshot.clone(),
        })
    }

    fn begin_write(&self) -> Result<Self::Write, StorageError> {
        self.check_available()?;
        let committed = self.inner.committed.read();
        Ok(InMemoryWriteTransaction {
            store: self.clone(),
            base_version: committed.version,
            snapshot: committed.snapshot.clone(),
            dirty: false,
        })
    }
}

/// Read transaction over an in-memory snapshot
#[derive(Debug)]
pub struct InMemoryReadTransaction {
    snapshot: Snapshot,
}

impl ReadTransaction for InMemoryReadTransaction {
    fn scan(
        &self,
        schema: &TableSchema,
        after: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        scan_snapshot(&self.snapshot, schema, after, limit)
    }
}

/// Write transaction against an in-memory snapshot
#[derive(Debug)]
pub struct InMemoryWriteTransaction {
    store: InMemoryRecordStore,
    base_version: u64,
    snapshot: Snapshot,
    dirty: bool,
}

impl ReadTransaction for InMemoryWriteTransaction {
    fn scan(
        &self,
        schema: &TableSchema,
        after: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        scan_snapshot(&self.snapshot, schema, after, limit)
    }
}

impl InMemoryWriteTransaction {
    fn next_key(&mut self, schema: &TableSchema) -> RecordKey {
        let sequence = self.snapshot.sequences.entry(schema.name()).or_insert(0);
        *sequence += 1;
        *sequence
    }
}

impl WriteTransaction for InMemoryWriteTransaction {
    fn create(&mut self, schema: &TableSchema, bytes: &[u8]) -> Result<RecordKey, StorageError> {
        // Check registration before touching the sequence
        self.snapshot.table(schema)?;

        let key = self.next_key(schema);
        self.snapshot.table_mut(schema)?.records.insert(key, bytes.to_vec());
        self.dirty = true;
        Ok(key)
    }

    fn create_with_lookup(
        &mut self,
        schema: &TableSchema,
        lookup: &str,
        bytes: &[u8],
    ) -> Result<RecordKey, StorageError> {
        self.snapshot.table(schema)?;
        schema.require_lookup()?;

        let key = self.next_key(schema);
        let table = self.snapshot.table_mut(schema)?;
        table.records.insert(key, bytes.to_vec());
        table.lookup.entry(lookup.to_string()).or_default().insert(key);
        self.dirty = true;
        Ok(key)
    }

    fn delete_matching(
        &mut self,
        schema: &TableSchema,
        lookup: Option<&str>,
        predicate: &mut RecordPredicate<'_>,
    ) -> Result<usize, StorageError> {
        let table = self.snapshot.table(schema)?;

        let mut doomed = Vec::new();
        match lookup {
            Some(lookup) => {
                schema.require_lookup()?;
                for key in table.lookup.get(lookup).into_iter().flatten() {
                    if let Some(bytes) = table.records.get(key)
                        && predicate(bytes)?
                    {
                        doomed.push(*key);
                    }
                }
            }
            None => {
                for (key, bytes) in table.records.iter() {
                    if predicate(bytes)? {
                        doomed.push(*key);
                    }
                }
            }
        }

        if !doomed.is_empty() {
            self.snapshot.table_mut(schema)?.remove_records(&doomed);
            self.dirty = true;
        }
        Ok(doomed.len())
    }

    fn commit(self) -> Result<(), StorageError> {
        let inner = &self.store.inner;
        inner.commit_attempts.fetch_add(1, Ordering::SeqCst);

        if self.store.take_injected_conflict() {
            trace!("Injected commit conflict");
            return Err(StorageError::conflict("injected commit conflict"));
        }

        if !self.dirty {
            return Ok(());
        }

        let mut committed = inner.committed.write();
        if committed.version != self.base_version {
            return Err(StorageError::conflict(format!(
                "store advanced from version {} to {} since transaction began",
                self.base_version, committed.version
            )));
        }

        committed.snapshot = self.snapshot;
        committed.version += 1;
        Ok(())
    }

    fn abort(self) -> Result<(), StorageError> {
        Ok(())
    }
}

fn scan_snapshot(
    snapshot: &Snapshot,
    schema: &TableSchema,
    after: Option<RecordKey>,
    limit: usize,
) -> Result<Vec<StoredRecord>, StorageError> {
    use std::ops::Bound;

    let lower = match after {
        Some(key) => Bound::Excluded(key),
        None => Bound::Unbounded,
    };

    Ok(snapshot
        .table(schema)?
        .records
        .range((lower, Bound::Unbounded))
        .take(limit)
        .map(|(key, bytes)| StoredRecord {
            key: *key,
            bytes: bytes.clone(),
        })
        .collect())
}
