//! Lazy marker enumeration bound to a read transaction

use std::collections::VecDeque;
use std::iter::FusedIterator;

use tracing::{trace, warn};

use super::marker::MarkerAdapter;
use crate::blob_id::BlobId;
use crate::error::StorageError;
use crate::store::{ReadTransaction, RecordKey, StoredRecord};

/// Iterator over the blob ids of every marker in one snapshot
///
/// Owns the read transaction it was created from, so every page comes from
/// the same snapshot no matter how slowly the caller consumes it. The
/// snapshot is released when the iterator is exhausted, fails, is closed,
/// or is dropped. Holding a partially consumed iterator keeps the snapshot
/// open.
///
/// The first error ends the sequence: it is yielded once and every later
/// call to `next` returns `None`. A caller that sees `Err` must treat the
/// ids received so far as incomplete.
pub struct BrowseIter<R> {
    tx: Option<R>,
    adapter: MarkerAdapter,
    page_size: usize,
    cursor: Option<RecordKey>,
    buffer: VecDeque<StoredRecord>,
    yielded: usize,
}

impl<R: ReadTransaction> BrowseIter<R> {
    pub(crate) fn new(tx: R, adapter: MarkerAdapter, page_size: usize) -> Self {
        Self {
            tx: Some(tx),
            adapter,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            yielded: 0,
        }
    }

    /// Release the snapshot without reading the remaining markers
    pub fn close(mut self) {
        self.finish();
    }

    /// Whether the snapshot is still held
    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    fn finish(&mut self) {
        if self.tx.take().is_some() {
            trace!(yielded = self.yielded, "Released browse snapshot");
        }
        self.buffer.clear();
    }

    fn fail(&mut self, error: StorageError) -> Option<Result<BlobId, StorageError>> {
        warn!(yielded = self.yielded, error = %error, "Browse aborted");
        self.finish();
        Some(Err(error))
    }
}

impl<R: ReadTransaction> Iterator for BrowseIter<R> {
    type Item = Result<BlobId, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return match self.adapter.decode(&record.bytes) {
                    Ok(marker) => {
                        self.yielded += 1;
                        Some(Ok(marker.blob_id))
                    }
                    Err(e) => self.fail(e),
                };
            }

            let tx = self.tx.as_ref()?;
            match tx.scan(self.adapter.schema(), self.cursor, self.page_size) {
                Ok(page) if page.is_empty() => {
                    self.finish();
                    return None;
                }
                Ok(page) => {
                    self.cursor = page.last().map(|record| record.key);
                    self.buffer.extend(page);
                }
                Err(e) => return self.fail(e),
            }
        }
    }
}

impl<R: ReadTransaction> FusedIterator for BrowseIter<R> {}

impl<R> std::fmt::Debug for BrowseIter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowseIter")
            .field("open", &self.tx.is_some())
            .field("page_size", &self.page_size)
            .field("cursor", &self.cursor)
            .field("buffered", &self.buffer.len())
            .field("yielded", &self.yielded)
            .finish()
    }
}
