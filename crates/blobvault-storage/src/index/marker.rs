//! Deleted blob marker record and its store adapter

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::browse::BrowseIter;
use crate::blob_id::BlobId;
use crate::error::StorageError;
use crate::store::{ReadTransaction, RecordKey, RecordStore, TableSchema, WriteTransaction};

/// Table holding one record per soft-deleted blob marker, filed by blob id
pub const MARKER_TABLE: TableSchema = TableSchema::new("deleted_blob_markers_v1")
    .with_lookup("deleted_blob_markers_v1_by_blob_id");

/// Persisted record saying "this blob id has been soft-deleted"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedBlobMarker {
    /// The soft-deleted blob
    pub blob_id: BlobId,
    /// When the marker was created (Unix millis, UTC)
    pub deleted_at_millis: i64,
}

impl DeletedBlobMarker {
    /// Create a marker stamped with the current time
    pub fn new(blob_id: BlobId) -> Self {
        Self {
            blob_id,
            deleted_at_millis: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Maps [`DeletedBlobMarker`]s to and from store records
#[derive(Debug, Clone, Copy)]
pub struct MarkerAdapter {
    schema: TableSchema,
}

impl Default for MarkerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerAdapter {
    /// Adapter for the default marker table
    pub fn new() -> Self {
        Self {
            schema: MARKER_TABLE,
        }
    }

    /// Table this adapter reads and writes
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Declare the marker table. Safe to call on every startup.
    pub fn register<S: RecordStore>(&self, store: &S) -> Result<(), StorageError> {
        store.register(&self.schema)?;
        debug!(table = self.schema.name(), "Registered marker table");
        Ok(())
    }

    /// Build a new marker for `blob_id`
    pub fn new_marker(&self, blob_id: BlobId) -> DeletedBlobMarker {
        DeletedBlobMarker::new(blob_id)
    }

    /// Encode a marker for storage
    pub fn encode(&self, marker: &DeletedBlobMarker) -> Result<Vec<u8>, StorageError> {
        postcard::to_allocvec(marker).map_err(|e| StorageError::serialization(e.to_string()))
    }

    /// Decode a stored marker
    pub fn decode(&self, bytes: &[u8]) -> Result<DeletedBlobMarker, StorageError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Persist `marker` as a new record
    pub fn add_marker<W: WriteTransaction>(
        &self,
        tx: &mut W,
        marker: &DeletedBlobMarker,
    ) -> Result<RecordKey, StorageError> {
        let bytes = self.encode(marker)?;
        tx.create_with_lookup(&self.schema, marker.blob_id.as_unique_str(), &bytes)
    }

    /// Delete every marker for `blob_id`, returning how many were removed
    ///
    /// Only records filed under `blob_id` are visited. A record that fails to
    /// decode is logged and left in place.
    pub fn delete_by_blob_id<W: WriteTransaction>(
        &self,
        tx: &mut W,
        blob_id: &BlobId,
    ) -> Result<usize, StorageError> {
        tx.delete_matching(&self.schema, Some(blob_id.as_unique_str()), &mut |bytes| {
            match self.decode(bytes) {
                Ok(marker) => Ok(marker.blob_id == *blob_id),
                Err(e) => {
                    warn!(blob_id = %blob_id, error = %e, "Skipping undecodable marker");
                    Ok(false)
                }
            }
        })
    }

    /// Lazily iterate all markers visible to `tx`
    pub fn browse<R: ReadTransaction>(&self, tx: R, page_size: usize) -> BrowseIter<R> {
        BrowseIter::new(tx, *self, page_size)
    }
}
