//! Shelf: a per-owner curated book set, simpler than Collection — no
//! library scoping, no sharing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::engine::Engine;
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::StoreResult;
use crate::id::IdGenerator;
use crate::keycodec::build_key;
use crate::models::Syncable;
use crate::syncindex;

pub const ENTITY: &str = "shelf";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shelf {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub book_ids: Vec<String>,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Shelf {
    fn id(&self) -> &str {
        &self.id
    }
}

static SHELF_INDEXES: &[IndexDef<Shelf>] = &[];

const TABLE: EntityTable<Shelf> = EntityTable {
    entity: ENTITY,
    indexes: SHELF_INDEXES,
};

fn by_owner_key(owner_id: &str, shelf_id: &str) -> Vec<u8> {
    build_key(&["idx", "shelf", "owner", owner_id, shelf_id])
}

fn by_owner_prefix(owner_id: &str) -> Vec<u8> {
    let mut p = by_owner_key(owner_id, "");
    p.pop();
    p
}

pub struct ShelfStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl ShelfStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, shelf: &mut Shelf) -> StoreResult<()> {
        if shelf.id.is_empty() {
            shelf.id = self.ids.generate(crate::models::ShelfId::TYPE_PREFIX);
        }
        shelf.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| {
            TABLE.create(tx, shelf)?;
            tx.set(&by_owner_key(&shelf.owner_id, &shelf.id), shelf.id.as_bytes())?;
            syncindex::touch_updated(tx, ENTITY, &shelf.id, None, shelf.sync.updated_at)
        })
    }

    pub fn get(&self, id: &str) -> StoreResult<Shelf> {
        self.engine
            .write_retrying(|tx| TABLE.get_live_or_not_found(tx, id, |s| s.sync.is_deleted()))
    }

    pub fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<Shelf>> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&by_owner_prefix(owner_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            ids.into_iter()
                .filter_map(|id| TABLE.get(tx, &id).transpose())
                .filter(|r| !matches!(r, Ok(s) if s.sync.is_deleted()))
                .collect()
        })
    }

    pub fn add_book(&self, shelf_id: &str, book_id: &str) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            let mut s = TABLE.get_or_not_found(tx, shelf_id)?;
            if s.book_ids.iter().any(|b| b == book_id) {
                return Ok(());
            }
            s.book_ids.push(book_id.to_string());
            let old_updated = s.sync.updated_at;
            s.sync.touch(self.clock.now());
            TABLE.update(tx, &s)?;
            syncindex::touch_updated(tx, ENTITY, shelf_id, Some(old_updated), s.sync.updated_at)
        })
    }

    pub fn remove_book(&self, shelf_id: &str, book_id: &str) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            let mut s = TABLE.get_or_not_found(tx, shelf_id)?;
            if !s.book_ids.iter().any(|b| b == book_id) {
                return Ok(());
            }
            s.book_ids.retain(|b| b != book_id);
            let old_updated = s.sync.updated_at;
            s.sync.touch(self.clock.now());
            TABLE.update(tx, &s)?;
            syncindex::touch_updated(tx, ENTITY, shelf_id, Some(old_updated), s.sync.updated_at)
        })
    }

    pub fn soft_delete(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            let mut s = TABLE.get_or_not_found(tx, id)?;
            if s.sync.is_deleted() {
                return Ok(());
            }
            let old_updated = s.sync.updated_at;
            s.sync.soft_delete(now);
            TABLE.update(tx, &s)?;
            syncindex::touch_updated(tx, ENTITY, id, Some(old_updated), s.sync.updated_at)?;
            syncindex::record_deleted(tx, ENTITY, id, now)?;
            Ok(())
        })
    }

    pub fn list_deleted_after(&self, since: Timestamp) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| syncindex::list_deleted_after(tx, ENTITY, since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::id::SequentialIdGenerator;

    fn store() -> ShelfStore {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock = Arc::new(TestClock::new(Timestamp::ZERO));
        let ids = Arc::new(SequentialIdGenerator::default());
        ShelfStore::new(engine, clock, ids)
    }

    #[test]
    fn add_book_is_idempotent() {
        let store = store();
        let mut shelf = Shelf {
            id: String::new(),
            owner_id: "user-1".to_string(),
            name: "Favorites".to_string(),
            book_ids: vec![],
            sync: Syncable::new(Timestamp::ZERO),
        };
        store.create(&mut shelf).unwrap();
        store.add_book(&shelf.id, "book-1").unwrap();
        store.add_book(&shelf.id, "book-1").unwrap();
        let reloaded = store.get(&shelf.id).unwrap();
        assert_eq!(reloaded.book_ids, vec!["book-1".to_string()]);
    }

    #[test]
    fn list_for_owner_excludes_deleted() {
        let store = store();
        let mut a = Shelf {
            id: String::new(),
            owner_id: "user-1".to_string(),
            name: "A".to_string(),
            book_ids: vec![],
            sync: Syncable::new(Timestamp::ZERO),
        };
        let mut b = Shelf {
            id: String::new(),
            owner_id: "user-1".to_string(),
            name: "B".to_string(),
            book_ids: vec![],
            sync: Syncable::new(Timestamp::ZERO),
        };
        store.create(&mut a).unwrap();
        store.create(&mut b).unwrap();
        store.soft_delete(&a.id).unwrap();
        let remaining = store.list_for_owner("user-1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, b.id);
    }
}
