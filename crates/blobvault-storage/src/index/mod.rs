//! Store-backed deleted blob index
//!
//! [`StoreDeletedBlobIndex`] implements [`DeletedBlobIndex`] on any
//! [`RecordStore`]. Every operation runs through a
//! [`TransactionalExecutor`], so transient conflicts are retried and every
//! other error reaches the caller unchanged.

mod browse;
mod marker;

pub use browse::BrowseIter;
pub use marker::{DeletedBlobMarker, MARKER_TABLE, MarkerAdapter};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument};

use crate::DeletedBlobIndex;
use crate::blob_id::BlobId;
use crate::config::IndexConfig;
use crate::error::StorageError;
use crate::retry::{RetryPolicy, TransactionalExecutor};
use crate::store::{RecordStore, RedbRecordStore};

/// Default number of markers fetched per page while browsing
pub const DEFAULT_BROWSE_PAGE_SIZE: usize = 256;

/// Deleted blob index persisted in a redb database
pub type RedbDeletedBlobIndex = StoreDeletedBlobIndex<RedbRecordStore>;

/// [`DeletedBlobIndex`] on top of a transactional [`RecordStore`]
///
/// Holds no state besides the store handle and the started flag; all
/// coordination between concurrent callers is left to the store.
#[derive(Debug)]
pub struct StoreDeletedBlobIndex<S> {
    executor: TransactionalExecutor<S>,
    adapter: MarkerAdapter,
    browse_page_size: usize,
    started: AtomicBool,
}

impl<S: RecordStore> StoreDeletedBlobIndex<S> {
    /// Create an index over `store`. Call [`start`](DeletedBlobIndex::start)
    /// before using it.
    pub fn new(store: Arc<S>, retry: RetryPolicy) -> Self {
        Self {
            executor: TransactionalExecutor::new(store, retry),
            adapter: MarkerAdapter::new(),
            browse_page_size: DEFAULT_BROWSE_PAGE_SIZE,
            started: AtomicBool::new(false),
        }
    }

    /// Create an index over `store` using the retry and paging settings of
    /// `config`
    pub fn with_config(store: Arc<S>, config: &IndexConfig) -> Result<Self, StorageError> {
        config.validate()?;
        Ok(Self::new(store, config.retry.clone()).with_browse_page_size(config.browse_page_size))
    }

    /// Set how many markers are fetched per page while browsing
    pub fn with_browse_page_size(mut self, page_size: usize) -> Self {
        self.browse_page_size = page_size.max(1);
        self
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<S> {
        self.executor.store()
    }

    /// The retry policy in effect
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.executor.policy()
    }

    /// Whether [`start`](DeletedBlobIndex::start) has completed
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Return to the not-started state; later operations fail with
    /// [`StorageError::NotStarted`] until started again
    pub fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            info!("Deleted blob index stopped");
        }
    }

    fn ensure_started(&self) -> Result<(), StorageError> {
        if self.is_started() {
            Ok(())
        } else {
            Err(StorageError::NotStarted)
        }
    }
}

impl RedbDeletedBlobIndex {
    /// Open the redb database named by `config` and build an index on it
    pub fn open(config: &IndexConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let store = RedbRecordStore::open(config.redb_config())?;
        Self::with_config(Arc::new(store), config)
    }
}

impl<S: RecordStore> DeletedBlobIndex for StoreDeletedBlobIndex<S> {
    type Browse = BrowseIter<S::Read>;

    #[instrument(skip(self), fields(table = self.adapter.schema().name()))]
    fn start(&self) -> Result<(), StorageError> {
        if self.is_started() {
            debug!("Deleted blob index already started");
            return Ok(());
        }

        self.adapter.register(&**self.executor.store())?;
        self.started.store(true, Ordering::SeqCst);

        info!("Deleted blob index started");
        Ok(())
    }

    #[instrument(skip(self, blob_id), fields(blob_id = %blob_id))]
    fn add(&self, blob_id: &BlobId) -> Result<(), StorageError> {
        self.ensure_started()?;

        // Built once; only the store write is repeated on retry
        let marker = self.adapter.new_marker(blob_id.clone());
        let key = self
            .executor
            .call_in_transaction("add", |tx| self.adapter.add_marker(tx, &marker))?;

        debug!(record_key = key, "Added deleted blob marker");
        Ok(())
    }

    #[instrument(skip(self, blob_id), fields(blob_id = %blob_id))]
    fn remove(&self, blob_id: &BlobId) -> Result<(), StorageError> {
        self.ensure_started()?;

        let removed = self
            .executor
            .call_in_transaction("remove", |tx| self.adapter.delete_by_blob_id(tx, blob_id))?;

        debug!(removed, "Removed deleted blob markers");
        Ok(())
    }

    #[instrument(skip(self))]
    fn browse(&self) -> Result<Self::Browse, StorageError> {
        self.ensure_started()?;

        let page_size = self.browse_page_size;
        self.executor
            .call_in_read_transaction("browse", |tx| Ok(self.adapter.browse(tx, page_size)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;
    use crate::store::InMemoryRecordStore;

    fn id(s: &str) -> BlobId {
        BlobId::new(s).unwrap()
    }

    fn started_index() -> (StoreDeletedBlobIndex<InMemoryRecordStore>, InMemoryRecordStore) {
        let store = InMemoryRecordStore::new();
        let index = StoreDeletedBlobIndex::new(Arc::new(store.clone()), RetryPolicy::immediate(5));
        index.start().unwrap();
        (index, store)
    }

    fn browse_set<I: DeletedBlobIndex>(index: &I) -> BTreeSet<String> {
        index
            .browse()
            .unwrap()
            .map(|r| r.unwrap().into_string())
            .collect()
    }

    #[test]
    fn test_operations_require_start() {
        let store = InMemoryRecordStore::new();
        let index = StoreDeletedBlobIndex::new(Arc::new(store), RetryPolicy::default());

        assert!(matches!(index.add(&id("sha1:aaa")), Err(StorageError::NotStarted)));
        assert!(matches!(index.remove(&id("sha1:aaa")), Err(StorageError::NotStarted)));
        assert!(matches!(index.browse(), Err(StorageError::NotStarted)));
    }

    #[test]
    fn test_start_is_idempotent() {
        let (index, _store) = started_index();
        index.start().unwrap();
        assert!(index.is_started());
    }

    #[test]
    fn test_stop_blocks_operations() {
        let (index, _store) = started_index();
        index.add(&id("sha1:aaa")).unwrap();

        index.stop();
        assert!(!index.is_started());
        assert!(matches!(index.browse(), Err(StorageError::NotStarted)));

        index.start().unwrap();
        assert_eq!(browse_set(&index), BTreeSet::from(["sha1:aaa".to_string()]));
    }

    #[test]
    fn test_add_remove_scenario() {
        let (index, _store) = started_index();

        index.add(&id("sha1:aaa")).unwrap();
        index.add(&id("sha1:bbb")).unwrap();
        index.remove(&id("sha1:aaa")).unwrap();

        assert_eq!(browse_set(&index), BTreeSet::from(["sha1:bbb".to_string()]));
    }

    #[test]
    fn test_duplicate_add_single_remove() {
        let (index, store) = started_index();

        index.add(&id("sha1:aaa")).unwrap();
        index.add(&id("sha1:aaa")).unwrap();
        assert_eq!(store.record_count(&MARKER_TABLE), 2);

        index.remove(&id("sha1:aaa")).unwrap();
        assert!(browse_set(&index).is_empty());
        assert_eq!(store.record_count(&MARKER_TABLE), 0);
    }

    #[test]
    fn test_add_retries_injected_conflicts() {
        let (index, store) = started_index();
        store.inject_conflicts(3);

        index.add(&id("sha1:aaa")).unwrap();

        assert_eq!(store.pending_injected_conflicts(), 0);
        assert_eq!(store.record_count(&MARKER_TABLE), 1);
    }

    #[test]
    fn test_unvalidated_nan_jitter_still_retries() {
        let store = InMemoryRecordStore::new();
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            jitter: f64::NAN,
            ..Default::default()
        };
        let index = StoreDeletedBlobIndex::new(Arc::new(store.clone()), policy);
        index.start().unwrap();
        store.inject_conflicts(1);

        index.add(&id("sha1:aaa")).unwrap();
        assert_eq!(store.record_count(&MARKER_TABLE), 1);
    }

    #[test]
    fn test_conflict_exhaustion_surfaces() {
        let (index, store) = started_index();
        store.inject_conflicts(100);

        let err = index.remove(&id("sha1:aaa")).unwrap_err();
        // remove of an absent id commits a clean transaction, which still
        // consumes injected conflicts
        assert!(matches!(err, StorageError::RetriesExhausted { attempts: 5, .. }));
    }

    #[test]
    fn test_unavailable_is_not_retried() {
        let (index, store) = started_index();
        store.set_unavailable(true);

        assert!(matches!(index.add(&id("sha1:aaa")), Err(StorageError::Unavailable(_))));
        assert_eq!(store.commit_attempts(), 0);
    }

    #[test]
    fn test_small_pages() {
        let store = InMemoryRecordStore::new();
        let index = StoreDeletedBlobIndex::new(Arc::new(store), RetryPolicy::default())
            .with_browse_page_size(1);
        index.start().unwrap();

        for name in ["a", "b", "c"] {
            index.add(&id(name)).unwrap();
        }
        assert_eq!(browse_set(&index).len(), 3);
    }
}
