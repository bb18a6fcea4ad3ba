//! Behavioural tests for the deleted blob index
//!
//! Every property is checked against both the redb store and the in-memory
//! store so the two backends stay interchangeable.

use std::collections::BTreeSet;
use std::sync::Arc;

use blobvault_storage::{
    BlobId, DeletedBlobIndex, InMemoryRecordStore, IndexConfig, RedbDeletedBlobIndex,
    RetryPolicy, StorageError, StoreDeletedBlobIndex,
};
use tempfile::TempDir;

fn id(s: &str) -> BlobId {
    BlobId::new(s).unwrap()
}

fn browse_set<I: DeletedBlobIndex>(index: &I) -> BTreeSet<String> {
    index
        .browse()
        .expect("browse should open")
        .map(|r| r.expect("browse should not fail").into_string())
        .collect()
}

fn in_memory_index() -> StoreDeletedBlobIndex<InMemoryRecordStore> {
    blobvault_logging::init_testing();
    let index = StoreDeletedBlobIndex::new(
        Arc::new(InMemoryRecordStore::new()),
        RetryPolicy::default(),
    );
    index.start().unwrap();
    index
}

fn redb_index() -> (RedbDeletedBlobIndex, TempDir) {
    blobvault_logging::init_testing();
    let temp_dir = TempDir::new().unwrap();
    let index =
        RedbDeletedBlobIndex::open(&IndexConfig::new(temp_dir.path().join("deleted.redb")))
            .unwrap();
    index.start().unwrap();
    (index, temp_dir)
}

/// A fresh started index of every backend
fn backends() -> Vec<Box<dyn IndexUnderTest>> {
    let memory: Box<dyn IndexUnderTest> = Box::new(MemoryUnderTest {
        index: in_memory_index(),
    });
    let (index, temp) = redb_index();
    let redb: Box<dyn IndexUnderTest> = Box::new(RedbUnderTest { index, _temp: temp });
    vec![memory, redb]
}

/// Object-safe view over the two concrete index types
trait IndexUnderTest {
    fn add(&self, id: &BlobId) -> Result<(), StorageError>;
    fn remove(&self, id: &BlobId) -> Result<(), StorageError>;
    fn ids(&self) -> BTreeSet<String>;
}

struct MemoryUnderTest {
    index: StoreDeletedBlobIndex<InMemoryRecordStore>,
}

impl IndexUnderTest for MemoryUnderTest {
    fn add(&self, id: &BlobId) -> Result<(), StorageError> {
        self.index.add(id)
    }
    fn remove(&self, id: &BlobId) -> Result<(), StorageError> {
        self.index.remove(id)
    }
    fn ids(&self) -> BTreeSet<String> {
        browse_set(&self.index)
    }
}

struct RedbUnderTest {
    index: RedbDeletedBlobIndex,
    _temp: TempDir,
}

impl IndexUnderTest for RedbUnderTest {
    fn add(&self, id: &BlobId) -> Result<(), StorageError> {
        self.index.add(id)
    }
    fn remove(&self, id: &BlobId) -> Result<(), StorageError> {
        self.index.remove(id)
    }
    fn ids(&self) -> BTreeSet<String> {
        browse_set(&self.index)
    }
}

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_add_then_browse_contains_id() {
    for index in backends() {
        for name in ["sha1:aaa", "sha1:bbb", "blake3:ccc"] {
            index.add(&id(name)).unwrap();
            assert!(index.ids().contains(name));
        }
    }
}

#[test]
fn test_add_remove_then_browse_excludes_id() {
    for index in backends() {
        index.add(&id("sha1:aaa")).unwrap();
        index.remove(&id("sha1:aaa")).unwrap();
        assert!(!index.ids().contains("sha1:aaa"));
    }
}

#[test]
fn test_scenario_add_add_remove() {
    for index in backends() {
        index.add(&id("sha1:aaa")).unwrap();
        index.add(&id("sha1:bbb")).unwrap();
        index.remove(&id("sha1:aaa")).unwrap();
        assert_eq!(index.ids(), set(&["sha1:bbb"]));
    }
}

#[test]
fn test_reclamation_pass_empties_index() {
    for index in backends() {
        let names: Vec<String> = (0..300).map(|i| format!("blake3:{i:04x}")).collect();
        for name in &names {
            index.add(&id(name)).unwrap();
        }
        index.add(&id(&names[7])).unwrap();

        // Browse then remove everything seen, as a collector would
        for name in index.ids() {
            index.remove(&id(&name)).unwrap();
        }
        assert!(index.ids().is_empty());

        // Re-adding after reclamation is visible again
        index.add(&id(&names[7])).unwrap();
        assert_eq!(index.ids(), set(&[names[7].as_str()]));
    }
}

// ============================================================================
// Idempotence
// ============================================================================

#[test]
fn test_browse_empty_index() {
    for index in backends() {
        assert!(index.ids().is_empty());
    }
}

#[test]
fn test_remove_unknown_id_is_noop() {
    for index in backends() {
        index.add(&id("sha1:bbb")).unwrap();
        let before = index.ids();

        index.remove(&id("sha1:zzz")).unwrap();
        index.remove(&id("sha1:zzz")).unwrap();

        assert_eq!(index.ids(), before);
    }
}

#[test]
fn test_duplicate_adds_removed_by_single_remove() {
    for index in backends() {
        index.add(&id("sha1:aaa")).unwrap();
        index.add(&id("sha1:aaa")).unwrap();
        index.add(&id("sha1:bbb")).unwrap();

        index.remove(&id("sha1:aaa")).unwrap();
        assert_eq!(index.ids(), set(&["sha1:bbb"]));
    }
}

#[test]
fn test_browse_yields_one_item_per_marker() {
    let index = in_memory_index();
    index.add(&id("sha1:aaa")).unwrap();
    index.add(&id("sha1:aaa")).unwrap();

    let items: Vec<BlobId> = index.browse().unwrap().collect::<Result<_, _>>().unwrap();
    assert_eq!(items, vec![id("sha1:aaa"), id("sha1:aaa")]);
}

// ============================================================================
// Lifecycle & persistence
// ============================================================================

#[test]
fn test_not_started_fails_fast() {
    let temp_dir = TempDir::new().unwrap();
    let index =
        RedbDeletedBlobIndex::open(&IndexConfig::new(temp_dir.path().join("deleted.redb")))
            .unwrap();

    assert!(matches!(index.add(&id("sha1:aaa")), Err(StorageError::NotStarted)));
    assert!(matches!(index.remove(&id("sha1:aaa")), Err(StorageError::NotStarted)));
    assert!(matches!(index.browse(), Err(StorageError::NotStarted)));
}

#[test]
fn test_markers_survive_restart() {
    blobvault_logging::init_testing();
    let temp_dir = TempDir::new().unwrap();
    let config = IndexConfig::new(temp_dir.path().join("nested/dir/deleted.redb"));

    {
        let index = RedbDeletedBlobIndex::open(&config).unwrap();
        index.start().unwrap();
        index.add(&id("sha1:aaa")).unwrap();
        index.add(&id("sha1:bbb")).unwrap();
        index.remove(&id("sha1:bbb")).unwrap();
    }

    let index = RedbDeletedBlobIndex::open(&config).unwrap();
    // Schema already exists; registering again must not fail or wipe data
    index.start().unwrap();
    assert_eq!(browse_set(&index), set(&["sha1:aaa"]));

    index.add(&id("sha1:ccc")).unwrap();
    assert_eq!(browse_set(&index), set(&["sha1:aaa", "sha1:ccc"]));
}

#[test]
fn test_open_rejects_invalid_config() {
    let config = IndexConfig::new("unused.redb").with_browse_page_size(0);
    assert!(matches!(
        RedbDeletedBlobIndex::open(&config),
        Err(StorageError::Config(_))
    ));
}

// ============================================================================
// Snapshot visibility
// ============================================================================

#[test]
fn test_browse_does_not_see_later_commits() {
    let (index, _temp) = redb_index();
    index.add(&id("sha1:aaa")).unwrap();

    let mut browse = index.browse().unwrap();
    index.add(&id("sha1:bbb")).unwrap();
    index.remove(&id("sha1:aaa")).unwrap();

    let first = browse.next().unwrap().unwrap();
    assert_eq!(first, id("sha1:aaa"));
    assert!(browse.next().is_none());

    assert_eq!(browse_set(&index), set(&["sha1:bbb"]));
}

#[test]
fn test_in_memory_browse_is_snapshot() {
    let store = Arc::new(InMemoryRecordStore::new());
    let index = StoreDeletedBlobIndex::new(Arc::clone(&store), RetryPolicy::default())
        .with_browse_page_size(1);
    index.start().unwrap();

    for name in ["a", "b", "c"] {
        index.add(&id(name)).unwrap();
    }

    let browse = index.browse().unwrap();
    index.remove(&id("b")).unwrap();
    index.add(&id("d")).unwrap();

    let seen: Vec<String> = browse.map(|r| r.unwrap().into_string()).collect();
    assert_eq!(seen, vec!["a", "b", "c"]);
}

// ============================================================================
// Error propagation
// ============================================================================

#[test]
fn test_browse_fails_when_store_unavailable() {
    let store = Arc::new(InMemoryRecordStore::new());
    let index = StoreDeletedBlobIndex::new(Arc::clone(&store), RetryPolicy::default());
    index.start().unwrap();

    store.set_unavailable(true);
    assert!(matches!(index.browse(), Err(StorageError::Unavailable(_))));

    store.set_unavailable(false);
    assert!(index.browse().is_ok());
}

#[test]
fn test_conflicts_exhaust_into_error() {
    let store = Arc::new(InMemoryRecordStore::new());
    let index = StoreDeletedBlobIndex::new(Arc::clone(&store), RetryPolicy::immediate(4));
    index.start().unwrap();

    store.inject_conflicts(4);
    let err = index.add(&id("sha1:aaa")).unwrap_err();
    assert!(matches!(err, StorageError::RetriesExhausted { attempts: 4, .. }));
    assert!(browse_set(&index).is_empty());

    // Budget is per call: the next add succeeds
    index.add(&id("sha1:aaa")).unwrap();
    assert_eq!(browse_set(&index), set(&["sha1:aaa"]));
}
