//! Series: unique by normalized name, 1-to-N with Book via `BookSeriesRef`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{Clock, Timestamp};
use crate::engine::Engine;
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::StoreResult;
use crate::id::IdGenerator;
use crate::models::{normalize_lookup, Syncable};
use crate::stores::book::BookStore;
use crate::syncindex;

pub const ENTITY: &str = "series";
const LOG_TARGET: &str = "bookvault::store::series";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub id: String,
    pub name: String,
    pub asin: Option<String>,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Series {
    fn id(&self) -> &str {
        &self.id
    }
}

static SERIES_INDEXES: &[IndexDef<Series>] = &[IndexDef {
    name: "name",
    key_values: |s| vec![s.name.clone()],
    lookup_transform: Some(normalize_lookup),
}];

const TABLE: EntityTable<Series> = EntityTable {
    entity: ENTITY,
    indexes: SERIES_INDEXES,
};

pub struct SeriesStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl SeriesStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, series: &mut Series) -> StoreResult<()> {
        if series.id.is_empty() {
            series.id = self.ids.generate(crate::models::SeriesId::TYPE_PREFIX);
        }
        series.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| {
            TABLE.create(tx, series)?;
            syncindex::touch_updated(tx, ENTITY, &series.id, None, series.sync.updated_at)
        })
    }

    pub fn get(&self, id: &str) -> StoreResult<Series> {
        self.engine
            .write_retrying(|tx| TABLE.get_live_or_not_found(tx, id, |s| s.sync.is_deleted()))
    }

    pub fn get_by_name(&self, name: &str) -> StoreResult<Option<Series>> {
        self.engine
            .write_retrying(|tx| TABLE.get_by_index_live(tx, "name", name, |s| s.sync.is_deleted()))
    }

    pub fn list(&self) -> StoreResult<Vec<Series>> {
        self.engine
            .write_retrying(|tx| Ok(TABLE.list(tx)?.into_iter().filter(|s| !s.sync.is_deleted()).collect()))
    }

    /// Writes the new record, then runs `CascadeSeriesUpdate`: every book
    /// referencing this series has its `updated_at` bumped so sync clients
    /// pick up the (denormalized, read-time-joined) name change. Cascade
    /// failures are logged and do not fail the surrounding update.
    pub fn update(&self, series: &mut Series, books: &BookStore) -> StoreResult<()> {
        series.sync.touch(self.clock.now());
        self.engine.write_retrying(|tx| {
            let old = TABLE.get_or_not_found(tx, &series.id)?;
            TABLE.update(tx, series)?;
            syncindex::touch_updated(tx, ENTITY, &series.id, Some(old.sync.updated_at), series.sync.updated_at)
        })?;

        let book_ids = books.list_book_ids_for_series(&series.id)?;
        for bid in book_ids {
            if let Err(err) = self.engine.write_retrying(|tx| books.cascade_series_sequence_noop_touch(tx, &bid)) {
                warn!(target: LOG_TARGET, series_id = %series.id, book_id = %bid, err = %err, "cascade series update failed for book");
            }
        }
        Ok(())
    }

    pub fn soft_delete(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            let mut series = TABLE.get_or_not_found(tx, id)?;
            if series.sync.is_deleted() {
                return Ok(());
            }
            let old_updated = series.sync.updated_at;
            series.sync.soft_delete(now);
            TABLE.update(tx, &series)?;
            syncindex::touch_updated(tx, ENTITY, id, Some(old_updated), series.sync.updated_at)?;
            syncindex::record_deleted(tx, ENTITY, id, now)?;
            Ok(())
        })
    }

    pub fn list_deleted_after(&self, since: Timestamp) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| syncindex::list_deleted_after(tx, ENTITY, since))
    }
}
