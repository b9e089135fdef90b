//! Collection (owned by a user, scoped to a library, holds ordered book
//! IDs) and CollectionShare (grants another user read/write access).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::engine::{Engine, WriteTxCtx};
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::{StoreError, StoreResult};
use crate::id::IdGenerator;
use crate::keycodec::build_key;
use crate::models::{SharePermission, Syncable};
use crate::syncindex;

pub const ENTITY: &str = "collection";
pub const SHARE_ENTITY: &str = "collection_share";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub library_id: String,
    pub owner_id: String,
    pub name: String,
    pub is_system: bool,
    pub book_ids: Vec<String>,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Collection {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionShare {
    pub id: String,
    pub collection_id: String,
    pub shared_with_user_id: String,
    pub shared_by_user_id: String,
    pub permission: SharePermission,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for CollectionShare {
    fn id(&self) -> &str {
        &self.id
    }
}

static COLLECTION_INDEXES: &[IndexDef<Collection>] = &[];

const TABLE: EntityTable<Collection> = EntityTable {
    entity: ENTITY,
    indexes: COLLECTION_INDEXES,
};

static SHARE_INDEXES: &[IndexDef<CollectionShare>] = &[];

const SHARE_TABLE: EntityTable<CollectionShare> = EntityTable {
    entity: SHARE_ENTITY,
    indexes: SHARE_INDEXES,
};

fn collection_by_library_key(library_id: &str, collection_id: &str) -> Vec<u8> {
    build_key(&["idx", "collection", "library", library_id, collection_id])
}

fn collection_by_library_prefix(library_id: &str) -> Vec<u8> {
    let mut p = collection_by_library_key(library_id, "");
    p.pop();
    p
}

fn share_by_collection_key(collection_id: &str, share_id: &str) -> Vec<u8> {
    build_key(&["idx", "share", "collection", collection_id, share_id])
}

fn share_by_collection_prefix(collection_id: &str) -> Vec<u8> {
    let mut p = share_by_collection_key(collection_id, "");
    p.pop();
    p
}

/// Unique (collection, shared_with_user) membership key — doubles as the
/// uniqueness check `CreateShare` scans.
fn share_by_user_key(collection_id: &str, shared_with_user_id: &str) -> Vec<u8> {
    build_key(&["idx", "share", "user", collection_id, shared_with_user_id])
}

pub struct CollectionStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl CollectionStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, collection: &mut Collection) -> StoreResult<()> {
        if collection.id.is_empty() {
            collection.id = self.ids.generate(crate::models::CollectionId::TYPE_PREFIX);
        }
        collection.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| {
            TABLE.create(tx, collection)?;
            tx.set(&collection_by_library_key(&collection.library_id, &collection.id), collection.id.as_bytes())?;
            syncindex::touch_updated(tx, ENTITY, &collection.id, None, collection.sync.updated_at)
        })
    }

    pub fn get(&self, id: &str) -> StoreResult<Collection> {
        self.engine
            .write_retrying(|tx| TABLE.get_live_or_not_found(tx, id, |c| c.sync.is_deleted()))
    }

    pub fn list_for_library(&self, library_id: &str) -> StoreResult<Vec<Collection>> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&collection_by_library_prefix(library_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            ids.into_iter()
                .filter_map(|id| TABLE.get(tx, &id).transpose())
                .filter(|r| !matches!(r, Ok(c) if c.sync.is_deleted()))
                .collect()
        })
    }

    /// Owner may read/write; a share grants the matching permission (Write
    /// implies Read).
    pub fn check_access(&self, collection: &Collection, user_id: &str, need_write: bool) -> StoreResult<()> {
        if collection.owner_id == user_id {
            return Ok(());
        }
        let shares = self.list_shares(&collection.id)?;
        let grants = shares.iter().find(|s| s.shared_with_user_id == user_id);
        match grants {
            Some(s) if !need_write || s.permission.allows_write() => Ok(()),
            _ => Err(StoreError::permission_denied("insufficient access to collection")),
        }
    }

    pub fn add_book(&self, collection_id: &str, book_id: &str) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            let mut c = TABLE.get_or_not_found(tx, collection_id)?;
            if c.book_ids.iter().any(|b| b == book_id) {
                return Ok(());
            }
            c.book_ids.push(book_id.to_string());
            let old_updated = c.sync.updated_at;
            c.sync.touch(self.clock.now());
            TABLE.update(tx, &c)?;
            syncindex::touch_updated(tx, ENTITY, collection_id, Some(old_updated), c.sync.updated_at)
        })
    }

    pub fn remove_book(&self, collection_id: &str, book_id: &str) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            let mut c = TABLE.get_or_not_found(tx, collection_id)?;
            if !c.book_ids.iter().any(|b| b == book_id) {
                return Ok(());
            }
            c.book_ids.retain(|b| b != book_id);
            let old_updated = c.sync.updated_at;
            c.sync.touch(self.clock.now());
            TABLE.update(tx, &c)?;
            syncindex::touch_updated(tx, ENTITY, collection_id, Some(old_updated), c.sync.updated_at)
        })
    }

    /// Best-effort: called by the facade's book-delete cascade for every
    /// collection that references the book.
    pub fn remove_book_from_all(&self, tx: &WriteTxCtx, book_id: &str) -> StoreResult<()> {
        for mut c in TABLE.list(tx)? {
            if c.book_ids.iter().any(|b| b == book_id) {
                c.book_ids.retain(|b| b != book_id);
                let old_updated = c.sync.updated_at;
                c.sync.touch(self.clock.now());
                TABLE.update(tx, &c)?;
                syncindex::touch_updated(tx, ENTITY, &c.id, Some(old_updated), c.sync.updated_at)?;
            }
        }
        Ok(())
    }

    pub fn delete(&self, collection: &Collection) -> StoreResult<()> {
        if collection.is_system {
            return Err(StoreError::InvalidInput {
                message: "cannot delete system collection".to_string(),
            });
        }
        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            self.delete_tx(tx, &collection.id, now)?;
            Ok(())
        })
    }

    fn delete_tx(&self, tx: &WriteTxCtx, collection_id: &str, now: Timestamp) -> StoreResult<()> {
        let Some(mut c) = TABLE.get(tx, collection_id)? else {
            return Ok(());
        };
        if c.sync.is_deleted() {
            return Ok(());
        }
        let old_updated = c.sync.updated_at;
        c.sync.soft_delete(now);
        TABLE.update(tx, &c)?;
        syncindex::touch_updated(tx, ENTITY, collection_id, Some(old_updated), c.sync.updated_at)?;
        syncindex::record_deleted(tx, ENTITY, collection_id, now)?;
        self.delete_shares_for_collection_tx(tx, collection_id)?;
        Ok(())
    }

    /// Hard-deletes every collection belonging to a library (library
    /// deletion cascade). Used within the same transaction as the library's
    /// own deletion.
    pub fn delete_all_for_library_tx(&self, tx: &WriteTxCtx, library_id: &str, now: Timestamp) -> StoreResult<()> {
        let ids: Vec<String> = tx
            .scan_prefix(&collection_by_library_prefix(library_id))?
            .into_iter()
            .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
            .collect();
        for id in ids {
            self.delete_tx(tx, &id, now)?;
            tx.delete(&collection_by_library_key(library_id, &id))?;
        }
        Ok(())
    }

    pub fn create_share(&self, share: &mut CollectionShare) -> StoreResult<()> {
        if share.id.is_empty() {
            share.id = self.ids.generate(crate::models::ShareId::TYPE_PREFIX);
        }
        share.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| {
            let member_key = share_by_user_key(&share.collection_id, &share.shared_with_user_id);
            if tx.exists(&member_key)? {
                return Err(StoreError::ShareAlreadyExists);
            }
            SHARE_TABLE.create(tx, share)?;
            tx.set(&share_by_collection_key(&share.collection_id, &share.id), share.id.as_bytes())?;
            tx.set(&member_key, share.id.as_bytes())?;
            Ok(())
        })
    }

    pub fn list_shares(&self, collection_id: &str) -> StoreResult<Vec<CollectionShare>> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&share_by_collection_prefix(collection_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            ids.into_iter().filter_map(|id| SHARE_TABLE.get(tx, &id).transpose()).collect()
        })
    }

    pub fn delete_shares_for_collection_tx(&self, tx: &WriteTxCtx, collection_id: &str) -> StoreResult<()> {
        let shares: Vec<CollectionShare> = {
            let ids: Vec<String> = tx
                .scan_prefix(&share_by_collection_prefix(collection_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            ids.into_iter().filter_map(|id| SHARE_TABLE.get(tx, &id).transpose()).collect::<StoreResult<Vec<_>>>()?
        };
        for share in shares {
            SHARE_TABLE.delete(tx, &share.id)?;
            tx.delete(&share_by_collection_key(collection_id, &share.id))?;
            tx.delete(&share_by_user_key(collection_id, &share.shared_with_user_id))?;
        }
        Ok(())
    }

    pub fn delete_shares_for_collection(&self, collection_id: &str) -> StoreResult<()> {
        self.engine
            .write_retrying(|tx| self.delete_shares_for_collection_tx(tx, collection_id))
    }

    pub fn list_deleted_after(&self, since: Timestamp) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| syncindex::list_deleted_after(tx, ENTITY, since))
    }
}
