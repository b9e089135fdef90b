//! Cross-store cascade and sharing behavior that no single store's unit
//! tests can exercise on its own.

use std::sync::Arc;

use bookvault_store::clock::{Clock, TestClock, Timestamp};
use bookvault_store::engine::Engine;
use bookvault_store::error::StoreError;
use bookvault_store::id::SequentialIdGenerator;
use bookvault_store::models::{SharePermission, Syncable};
use bookvault_store::stores::collection::{Collection, CollectionShare};
use bookvault_store::stores::library::Library;
use bookvault_store::Store;

fn store() -> (Store, Arc<TestClock>) {
    let engine = Engine::open_in_memory().unwrap();
    let clock = Arc::new(TestClock::new(Timestamp::ZERO));
    let ids = Arc::new(SequentialIdGenerator::default());
    (Store::open_with(engine, clock.clone() as Arc<dyn Clock>, ids), clock)
}

fn new_library(name: &str) -> Library {
    Library {
        id: String::new(),
        name: name.to_string(),
        scan_paths: Default::default(),
        sync: Syncable::new(Timestamp::ZERO),
    }
}

fn new_collection(library_id: &str, owner_id: &str, name: &str) -> Collection {
    Collection {
        id: String::new(),
        library_id: library_id.to_string(),
        owner_id: owner_id.to_string(),
        name: name.to_string(),
        is_system: false,
        book_ids: Vec::new(),
        sync: Syncable::new(Timestamp::ZERO),
    }
}

/// Deleting a library soft-deletes every collection it owns, and every
/// share on those collections is removed along with them.
#[test]
fn deleting_a_library_cascades_into_its_collections_and_shares() {
    let (store, _clock) = store();

    let mut library = new_library("Main Library");
    store.libraries.create(&mut library).unwrap();

    let mut collection = new_collection(&library.id, "user-1", "Favorites");
    store.collections.create(&mut collection).unwrap();

    let mut share = CollectionShare {
        id: String::new(),
        collection_id: collection.id.clone(),
        shared_with_user_id: "user-2".to_string(),
        shared_by_user_id: "user-1".to_string(),
        permission: SharePermission::Read,
        sync: Syncable::new(Timestamp::ZERO),
    };
    store.collections.create_share(&mut share).unwrap();

    store.delete_library(&library.id).unwrap();

    assert!(matches!(store.libraries.get(&library.id), Err(StoreError::NotFound { .. })));
    assert!(matches!(store.collections.get(&collection.id), Err(StoreError::NotFound { .. })));
    assert!(store.collections.list_shares(&collection.id).unwrap().is_empty());
}

/// A second share for the same (collection, user) pair is rejected, but a
/// different user can still be shared with.
#[test]
fn sharing_a_collection_twice_with_the_same_user_is_rejected() {
    let (store, _clock) = store();

    let mut library = new_library("Main Library");
    store.libraries.create(&mut library).unwrap();

    let mut collection = new_collection(&library.id, "user-1", "Favorites");
    store.collections.create(&mut collection).unwrap();

    let mut first = CollectionShare {
        id: String::new(),
        collection_id: collection.id.clone(),
        shared_with_user_id: "user-2".to_string(),
        shared_by_user_id: "user-1".to_string(),
        permission: SharePermission::Read,
        sync: Syncable::new(Timestamp::ZERO),
    };
    store.collections.create_share(&mut first).unwrap();

    let mut duplicate = CollectionShare {
        id: String::new(),
        collection_id: collection.id.clone(),
        shared_with_user_id: "user-2".to_string(),
        shared_by_user_id: "user-1".to_string(),
        permission: SharePermission::Write,
        sync: Syncable::new(Timestamp::ZERO),
    };
    let err = store.collections.create_share(&mut duplicate);
    assert!(matches!(err, Err(StoreError::ShareAlreadyExists)));

    let mut other_user = CollectionShare {
        id: String::new(),
        collection_id: collection.id.clone(),
        shared_with_user_id: "user-3".to_string(),
        shared_by_user_id: "user-1".to_string(),
        permission: SharePermission::Read,
        sync: Syncable::new(Timestamp::ZERO),
    };
    store.collections.create_share(&mut other_user).unwrap();

    assert_eq!(store.collections.list_shares(&collection.id).unwrap().len(), 2);
}

/// System collections can't be deleted directly through the single-
/// collection delete path, even by their owner.
#[test]
fn system_collections_reject_direct_deletion() {
    let (store, _clock) = store();

    let mut library = new_library("Main Library");
    store.libraries.create(&mut library).unwrap();

    let mut collection = new_collection(&library.id, "user-1", "All Books");
    collection.is_system = true;
    store.collections.create(&mut collection).unwrap();

    let err = store.delete_collection(&collection);
    assert!(matches!(err, Err(StoreError::InvalidInput { .. })));
}
