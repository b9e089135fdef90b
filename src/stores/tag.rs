//! Tag: unique by slug, M-to-N with Book.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::engine::Engine;
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::StoreResult;
use crate::id::IdGenerator;
use crate::models::{slugify, Syncable};
use crate::syncindex;

pub const ENTITY: &str = "tag";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub slug: String,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Tag {
    fn id(&self) -> &str {
        &self.id
    }
}

static TAG_INDEXES: &[IndexDef<Tag>] = &[IndexDef {
    name: "slug",
    key_values: |t| vec![t.slug.clone()],
    lookup_transform: None,
}];

const TABLE: EntityTable<Tag> = EntityTable {
    entity: ENTITY,
    indexes: TAG_INDEXES,
};

pub struct TagStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl TagStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, tag: &mut Tag) -> StoreResult<()> {
        if tag.id.is_empty() {
            tag.id = self.ids.generate(crate::models::TagId::TYPE_PREFIX);
        }
        tag.slug = slugify(&tag.name);
        tag.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| {
            TABLE.create(tx, tag)?;
            syncindex::touch_updated(tx, ENTITY, &tag.id, None, tag.sync.updated_at)
        })
    }

    pub fn get(&self, id: &str) -> StoreResult<Tag> {
        self.engine
            .write_retrying(|tx| TABLE.get_live_or_not_found(tx, id, |t| t.sync.is_deleted()))
    }

    pub fn get_by_slug(&self, slug: &str) -> StoreResult<Option<Tag>> {
        self.engine
            .write_retrying(|tx| TABLE.get_by_index_live(tx, "slug", slug, |t| t.sync.is_deleted()))
    }

    pub fn list(&self) -> StoreResult<Vec<Tag>> {
        self.engine
            .write_retrying(|tx| Ok(TABLE.list(tx)?.into_iter().filter(|t| !t.sync.is_deleted()).collect()))
    }

    pub fn soft_delete(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            let mut t = TABLE.get_or_not_found(tx, id)?;
            if t.sync.is_deleted() {
                return Ok(());
            }
            let old_updated = t.sync.updated_at;
            t.sync.soft_delete(now);
            TABLE.update(tx, &t)?;
            syncindex::touch_updated(tx, ENTITY, id, Some(old_updated), t.sync.updated_at)?;
            syncindex::record_deleted(tx, ENTITY, id, now)?;
            Ok(())
        })
    }

    pub fn list_deleted_after(&self, since: Timestamp) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| syncindex::list_deleted_after(tx, ENTITY, since))
    }
}
