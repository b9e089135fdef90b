//! Contributor (author/narrator/editor/translator): unique by normalized
//! name, plus alias records left behind by `MergeContributors`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{Clock, Timestamp};
use crate::engine::{Engine, WriteTxCtx};
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::StoreResult;
use crate::id::IdGenerator;
use crate::keycodec::primary_key;
use crate::models::{normalize_lookup, ContributorRole, Syncable};
use crate::stores::book::BookStore;
use crate::syncindex;

pub const ENTITY: &str = "contributor";
const LOG_TARGET: &str = "bookvault::store::contributor";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contributor {
    pub id: String,
    pub name: String,
    pub asin: Option<String>,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Contributor {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Alias left behind after a merge: `source name (normalized) -> target id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributorAlias {
    pub source_name: String,
    pub target_id: String,
}

static CONTRIBUTOR_INDEXES: &[IndexDef<Contributor>] = &[IndexDef {
    name: "name",
    key_values: |c| vec![c.name.clone()],
    lookup_transform: Some(normalize_lookup),
}];

const TABLE: EntityTable<Contributor> = EntityTable {
    entity: ENTITY,
    indexes: CONTRIBUTOR_INDEXES,
};

pub struct ContributorStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl ContributorStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, contributor: &mut Contributor) -> StoreResult<()> {
        if contributor.id.is_empty() {
            contributor.id = self.ids.generate(crate::models::ContributorId::TYPE_PREFIX);
        }
        contributor.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| {
            TABLE.create(tx, contributor)?;
            syncindex::touch_updated(tx, ENTITY, &contributor.id, None, contributor.sync.updated_at)
        })
    }

    pub fn get(&self, id: &str) -> StoreResult<Contributor> {
        self.engine
            .write_retrying(|tx| TABLE.get_live_or_not_found(tx, id, |c| c.sync.is_deleted()))
    }

    pub fn get_by_name(&self, name: &str) -> StoreResult<Option<Contributor>> {
        self.engine
            .write_retrying(|tx| TABLE.get_by_index_live(tx, "name", name, |c| c.sync.is_deleted()))
    }

    pub fn list(&self) -> StoreResult<Vec<Contributor>> {
        self.engine
            .write_retrying(|tx| Ok(TABLE.list(tx)?.into_iter().filter(|c| !c.sync.is_deleted()).collect()))
    }

    pub fn update(&self, contributor: &mut Contributor) -> StoreResult<()> {
        contributor.sync.touch(self.clock.now());
        self.engine.write_retrying(|tx| {
            let old = TABLE.get_or_not_found(tx, &contributor.id)?;
            TABLE.update(tx, contributor)?;
            syncindex::touch_updated(tx, ENTITY, &contributor.id, Some(old.sync.updated_at), contributor.sync.updated_at)
        })
    }

    pub fn soft_delete(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            let mut c = TABLE.get_or_not_found(tx, id)?;
            if c.sync.is_deleted() {
                return Ok(());
            }
            let old_updated = c.sync.updated_at;
            c.sync.soft_delete(now);
            TABLE.update(tx, &c)?;
            syncindex::touch_updated(tx, ENTITY, id, Some(old_updated), c.sync.updated_at)?;
            syncindex::record_deleted(tx, ENTITY, id, now)?;
            Ok(())
        })
    }

    pub fn list_deleted_after(&self, since: Timestamp) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| syncindex::list_deleted_after(tx, ENTITY, since))
    }

    fn alias_key(source_name_normalized: &str) -> Vec<u8> {
        primary_key("contributor_alias", source_name_normalized)
    }

    /// Reassigns every book's `source` contributor reference to `target`
    /// (same role), records an alias from source's name to target, and
    /// soft-deletes `source`. Book rewrites are best-effort: a failure on
    /// one book is logged and the merge continues with the rest.
    pub fn merge(&self, books: &BookStore, source_id: &str, target_id: &str) -> StoreResult<()> {
        let source = self.get(source_id)?;
        let _ = self.get(target_id)?;

        for role in [
            ContributorRole::Author,
            ContributorRole::Narrator,
            ContributorRole::Editor,
            ContributorRole::Translator,
        ] {
            for bid in books.list_book_ids_for_contributor(source_id, role)? {
                if let Err(err) = self.reassign_book_contributor(books, &bid, source_id, target_id, role) {
                    warn!(target: LOG_TARGET, book_id = %bid, err = %err, "failed to reassign book during contributor merge");
                }
            }
        }

        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            tx.set(
                &Self::alias_key(&normalize_lookup(&source.name)),
                serde_json::to_vec(&ContributorAlias {
                    source_name: source.name.clone(),
                    target_id: target_id.to_string(),
                })
                .map_err(|e| crate::error::StoreError::Internal { message: e.to_string() })?
                .as_slice(),
            )?;
            Ok(())
        })?;

        self.soft_delete(source_id)?;
        let _ = now;
        Ok(())
    }

    fn reassign_book_contributor(
        &self,
        books: &BookStore,
        book_id: &str,
        source_id: &str,
        target_id: &str,
        role: ContributorRole,
    ) -> StoreResult<()> {
        let mut book = books.get(book_id)?;
        for cref in &mut book.contributors {
            if cref.contributor_id == source_id && cref.role == role {
                cref.contributor_id = target_id.to_string();
            }
        }
        books.update(&mut book)
    }

    pub fn resolve_alias(&self, normalized_name: &str) -> StoreResult<Option<String>> {
        self.engine.write_retrying(|tx: &WriteTxCtx| {
            let Some(bytes) = tx.get(&Self::alias_key(normalized_name))? else {
                return Ok(None);
            };
            let alias: ContributorAlias =
                serde_json::from_slice(&bytes).map_err(|e| crate::error::StoreError::Internal { message: e.to_string() })?;
            Ok(Some(alias.target_id))
        })
    }
}
