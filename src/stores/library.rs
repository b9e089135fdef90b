//! Library: owns scan paths and exclusively owns its Collections.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::engine::Engine;
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::StoreResult;
use crate::id::IdGenerator;
use crate::models::Syncable;
use crate::stores::collection::CollectionStore;
use crate::syncindex;

pub const ENTITY: &str = "library";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    pub id: String,
    pub name: String,
    pub scan_paths: BTreeSet<String>,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Library {
    fn id(&self) -> &str {
        &self.id
    }
}

static LIBRARY_INDEXES: &[IndexDef<Library>] = &[];

const TABLE: EntityTable<Library> = EntityTable {
    entity: ENTITY,
    indexes: LIBRARY_INDEXES,
};

pub struct LibraryStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl LibraryStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, library: &mut Library) -> StoreResult<()> {
        if library.id.is_empty() {
            library.id = self.ids.generate(crate::models::LibraryId::TYPE_PREFIX);
        }
        library.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| {
            TABLE.create(tx, library)?;
            syncindex::touch_updated(tx, ENTITY, &library.id, None, library.sync.updated_at)
        })
    }

    pub fn get(&self, id: &str) -> StoreResult<Library> {
        self.engine
            .write_retrying(|tx| TABLE.get_live_or_not_found(tx, id, |l| l.sync.is_deleted()))
    }

    pub fn list(&self) -> StoreResult<Vec<Library>> {
        self.engine
            .write_retrying(|tx| Ok(TABLE.list(tx)?.into_iter().filter(|l| !l.sync.is_deleted()).collect()))
    }

    pub fn update(&self, library: &mut Library) -> StoreResult<()> {
        library.sync.touch(self.clock.now());
        self.engine.write_retrying(|tx| {
            let old = TABLE.get_or_not_found(tx, &library.id)?;
            TABLE.update(tx, library)?;
            syncindex::touch_updated(tx, ENTITY, &library.id, Some(old.sync.updated_at), library.sync.updated_at)
        })
    }

    /// Soft-deletes the library and, in the same transaction, every
    /// Collection it owns.
    pub fn delete(&self, collections: &CollectionStore, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            let mut l = TABLE.get_or_not_found(tx, id)?;
            if l.sync.is_deleted() {
                return Ok(());
            }
            let old_updated = l.sync.updated_at;
            l.sync.soft_delete(now);
            TABLE.update(tx, &l)?;
            syncindex::touch_updated(tx, ENTITY, id, Some(old_updated), l.sync.updated_at)?;
            syncindex::record_deleted(tx, ENTITY, id, now)?;
            collections.delete_all_for_library_tx(tx, id, now)
        })
    }

    pub fn list_deleted_after(&self, since: Timestamp) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| syncindex::list_deleted_after(tx, ENTITY, since))
    }
}
