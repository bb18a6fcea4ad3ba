//! # Blobvault Storage
//!
//! Soft-delete tracking for the blobvault blob store.
//!
//! When a blob is deleted its id is first recorded in a persistent index
//! of soft-deleted blobs; the payload is only reclaimed later by a pass that
//! walks that index. This crate provides the index and the transactional
//! plumbing under it.
//!
//! ## Features
//!
//! - **DeletedBlobIndex trait**: `start`, `add`, `remove`, `browse`
//! - **StoreDeletedBlobIndex**: implementation on any [`RecordStore`]
//! - **RedbRecordStore**: persistent store on a redb database file
//! - **InMemoryRecordStore**: optimistic-concurrency store for testing, with
//!   conflict and outage injection
//! - **TransactionalExecutor**: runs transaction bodies with bounded,
//!   jittered retry on transient conflicts
//!
//! ## Example
//!
//! ```rust,ignore
//! use blobvault_storage::{BlobId, DeletedBlobIndex, IndexConfig, RedbDeletedBlobIndex};
//!
//! let index = RedbDeletedBlobIndex::open(&IndexConfig::new("./data/deleted.redb"))?;
//! index.start()?;
//!
//! let id = BlobId::new("sha1:9f2c")?;
//! index.add(&id)?;
//!
//! for blob_id in index.browse()? {
//!     let blob_id = blob_id?; // an error means the list is incomplete
//!     println!("reclaim {blob_id}");
//! }
//!
//! index.remove(&id)?;
//! ```

pub mod blob_id;
pub mod config;
pub mod error;
pub mod index;
pub mod retry;
pub mod store;

// Re-exports
pub use blob_id::BlobId;
pub use config::IndexConfig;
pub use error::StorageError;
pub use index::{
    BrowseIter, DeletedBlobMarker, MARKER_TABLE, MarkerAdapter, RedbDeletedBlobIndex,
    StoreDeletedBlobIndex,
};
pub use retry::{RetryPolicy, TransactionalExecutor};
pub use store::{
    InMemoryRecordStore, ReadTransaction, RecordKey, RecordStore, RedbRecordStore,
    RedbRecordStoreConfig, StoredRecord, TableSchema, WriteTransaction,
};

/// Index of blob ids that have been soft-deleted but not yet reclaimed
///
/// Implementations must be safe to call from many threads at once. Apart
/// from [`start`](Self::start), every operation fails with
/// [`StorageError::NotStarted`] until `start` has succeeded.
pub trait DeletedBlobIndex: Send + Sync {
    /// Sequence returned by [`browse`](Self::browse)
    type Browse: Iterator<Item = Result<BlobId, StorageError>>;

    /// Register the marker schema with the store
    ///
    /// Must be called once before any other operation. Calling it again, or
    /// against a store that already holds the schema, is a no-op.
    fn start(&self) -> Result<(), StorageError>;

    /// Record `blob_id` as soft-deleted
    ///
    /// Once this returns `Ok`, any browse started afterwards includes
    /// `blob_id` until it is removed. Adding the same id twice is allowed.
    ///
    /// # Errors
    ///
    /// [`StorageError::RetriesExhausted`] if the write kept conflicting,
    /// or the store's error if it failed for another reason. In both cases
    /// the caller cannot tell whether the marker exists.
    fn add(&self, blob_id: &BlobId) -> Result<(), StorageError>;

    /// Forget `blob_id`, deleting every marker recorded for it
    ///
    /// Removing an id that is not present succeeds and changes nothing.
    fn remove(&self, blob_id: &BlobId) -> Result<(), StorageError>;

    /// Enumerate every soft-deleted id as of a single snapshot
    ///
    /// The sequence is lazy and holds the snapshot open until it is
    /// exhausted or dropped. One id is yielded per stored marker. If an
    /// `Err` is yielded the sequence ends there, and a reclamation pass
    /// relying on it must abort.
    fn browse(&self) -> Result<Self::Browse, StorageError>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    /// Test that the DeletedBlobIndex trait is object-safe
    fn _assert_object_safe(
        _: &dyn DeletedBlobIndex<Browse = BrowseIter<<InMemoryRecordStore as RecordStore>::Read>>,
    ) {
    }

    #[test]
    fn test_in_memory_index() {
        let store = Arc::new(InMemoryRecordStore::new());
        let index = StoreDeletedBlobIndex::new(store, RetryPolicy::default());
        index.start().unwrap();

        // Initially empty
        assert_eq!(index.browse().unwrap().count(), 0);

        // Add some ids
        for i in 1..=5 {
            index.add(&BlobId::new(format!("sha1:{i:03}")).unwrap()).unwrap();
        }
        assert_eq!(index.browse().unwrap().count(), 5);

        // Remove one
        index.remove(&BlobId::new("sha1:003").unwrap()).unwrap();
        let ids: Vec<BlobId> = index.browse().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(ids.len(), 4);
        assert!(!ids.contains(&BlobId::new("sha1:003").unwrap()));
    }

    #[test]
    fn test_redb_index() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let index = RedbDeletedBlobIndex::open(&IndexConfig::new(temp_dir.path().join("idx.redb")))
            .unwrap();
        index.start().unwrap();

        let id = BlobId::for_content(b"payload");
        index.add(&id).unwrap();

        let ids: Vec<BlobId> = index.browse().unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(ids, vec![id]);
    }
}
