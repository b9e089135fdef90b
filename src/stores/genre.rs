//! Genre tree: parent/path/depth, slug-unique, with move/merge and an
//! in-memory cache invalidated on every mutation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{Clock, Timestamp};
use crate::engine::Engine;
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::{StoreError, StoreResult};
use crate::id::IdGenerator;
use crate::keycodec::build_key;
use crate::models::{slugify, Syncable};
use crate::stores::book::BookStore;
use crate::syncindex;

pub const ENTITY: &str = "genre";
const LOG_TARGET: &str = "bookvault::store::genre";
const ROOT_MARKER: &str = "root";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Genre {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub parent_id: Option<String>,
    pub path: String,
    pub depth: u32,
    pub is_system: bool,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Genre {
    fn id(&self) -> &str {
        &self.id
    }
}

static GENRE_INDEXES: &[IndexDef<Genre>] = &[IndexDef {
    name: "slug",
    key_values: |g| vec![g.slug.clone()],
    lookup_transform: None,
}];

const TABLE: EntityTable<Genre> = EntityTable {
    entity: ENTITY,
    indexes: GENRE_INDEXES,
};

fn parent_key(parent_id: Option<&str>, child_id: &str) -> Vec<u8> {
    build_key(&["idx", "genre", "parent", parent_id.unwrap_or(ROOT_MARKER), child_id])
}

fn parent_prefix(parent_id: Option<&str>) -> Vec<u8> {
    let mut p = parent_key(parent_id, "");
    p.pop();
    p
}

#[derive(Default)]
struct GenreCache {
    all: Vec<Genre>,
    by_id: HashMap<String, Genre>,
}

pub struct GenreStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    cache: RwLock<Option<GenreCache>>,
}

impl GenreStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            engine,
            clock,
            ids,
            cache: RwLock::new(None),
        }
    }

    pub fn invalidate_cache(&self) {
        *self.cache.write().expect("genre cache poisoned") = None;
    }

    pub fn create(&self, genre: &mut Genre) -> StoreResult<()> {
        if genre.id.is_empty() {
            genre.id = self.ids.generate(crate::models::GenreId::TYPE_PREFIX);
        }
        genre.slug = slugify(&genre.name);
        genre.sync = Syncable::new(self.clock.now());

        let (path, depth) = self.compute_path(genre.parent_id.as_deref(), &genre.slug)?;
        genre.path = path;
        genre.depth = depth;

        self.engine.write_retrying(|tx| {
            TABLE.create(tx, genre)?;
            tx.set(&parent_key(genre.parent_id.as_deref(), &genre.id), genre.id.as_bytes())?;
            syncindex::touch_updated(tx, ENTITY, &genre.id, None, genre.sync.updated_at)
        })?;
        self.invalidate_cache();
        Ok(())
    }

    fn compute_path(&self, parent_id: Option<&str>, slug: &str) -> StoreResult<(String, u32)> {
        match parent_id {
            None => Ok((slug.to_string(), 0)),
            Some(pid) => {
                let parent = self.get(pid)?;
                Ok((format!("{}/{}", parent.path, slug), parent.depth + 1))
            }
        }
    }

    pub fn get(&self, id: &str) -> StoreResult<Genre> {
        self.engine
            .write_retrying(|tx| TABLE.get_live_or_not_found(tx, id, |g| g.sync.is_deleted()))
    }

    pub fn get_by_slug(&self, slug: &str) -> StoreResult<Option<Genre>> {
        self.engine
            .write_retrying(|tx| TABLE.get_by_index_live(tx, "slug", slug, |g| g.sync.is_deleted()))
    }

    /// Populates the in-memory cache on first call; reused until the next
    /// mutation invalidates it.
    pub fn list(&self) -> StoreResult<Vec<Genre>> {
        if let Some(cache) = self.cache.read().expect("genre cache poisoned").as_ref() {
            return Ok(cache.all.clone());
        }
        let all: Vec<Genre> = self
            .engine
            .write_retrying(|tx| Ok(TABLE.list(tx)?.into_iter().filter(|g| !g.sync.is_deleted()).collect()))?;
        let by_id = all.iter().map(|g| (g.id.clone(), g.clone())).collect();
        *self.cache.write().expect("genre cache poisoned") = Some(GenreCache { all: all.clone(), by_id });
        Ok(all)
    }

    pub fn list_child_ids(&self, parent_id: Option<&str>) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| {
            Ok(tx
                .scan_prefix(&parent_prefix(parent_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect())
        })
    }

    /// Recomputes `path` from the (possibly new) parent, writes the record,
    /// then recursively rewrites every descendant's `path`/`depth` by
    /// replacing the old path prefix with the new one exactly once.
    pub fn move_genre(&self, id: &str, new_parent_id: Option<&str>) -> StoreResult<()> {
        let old = self.get(id)?;
        let (new_path, new_depth) = self.compute_path(new_parent_id, &old.slug)?;
        let old_path = old.path.clone();

        self.engine.write_retrying(|tx| {
            let mut g = TABLE.get_or_not_found(tx, id)?;
            if g.parent_id.as_deref() != new_parent_id {
                tx.delete(&parent_key(g.parent_id.as_deref(), id))?;
                tx.set(&parent_key(new_parent_id, id), id.as_bytes())?;
            }
            g.parent_id = new_parent_id.map(str::to_string);
            g.path = new_path.clone();
            g.depth = new_depth;
            let old_updated = g.sync.updated_at;
            g.sync.touch(self.clock.now());
            TABLE.update(tx, &g)?;
            syncindex::touch_updated(tx, ENTITY, id, Some(old_updated), g.sync.updated_at)
        })?;

        self.rewrite_descendant_paths(&old_path, &new_path)?;
        self.invalidate_cache();
        Ok(())
    }

    fn rewrite_descendant_paths(&self, old_prefix: &str, new_prefix: &str) -> StoreResult<()> {
        let all = self.engine.write_retrying(|tx| TABLE.list(tx))?;
        let descendants: Vec<Genre> = all
            .into_iter()
            .filter(|g| g.path != old_prefix && g.path.starts_with(&format!("{old_prefix}/")))
            .collect();

        for mut g in descendants {
            let rewritten = format!("{new_prefix}{}", &g.path[old_prefix.len()..]);
            g.path = rewritten;
            g.depth = g.path.split('/').count() as u32 - 1;
            if let Err(err) = self.engine.write_retrying(|tx| {
                let old_updated = g.sync.updated_at;
                g.sync.touch(self.clock.now());
                TABLE.update(tx, &g)?;
                syncindex::touch_updated(tx, ENTITY, &g.id, Some(old_updated), g.sync.updated_at)
            }) {
                warn!(target: LOG_TARGET, genre_id = %g.id, err = %err, "failed to rewrite descendant genre path");
            }
        }
        Ok(())
    }

    /// Moves every book from `source` to `target`, recursively reparents
    /// `source`'s children onto `target`, then soft-deletes `source`.
    pub fn merge(&self, books: &BookStore, source_id: &str, target_id: &str) -> StoreResult<()> {
        let _ = self.get(target_id)?;

        for bid in books.list_book_ids_for_genre(source_id)? {
            if let Err(err) = self.reassign_book_genre(books, &bid, source_id, target_id) {
                warn!(target: LOG_TARGET, book_id = %bid, err = %err, "failed to reassign book during genre merge");
            }
        }

        for child_id in self.list_child_ids(Some(source_id))? {
            if let Err(err) = self.move_genre(&child_id, Some(target_id)) {
                warn!(target: LOG_TARGET, child_id = %child_id, err = %err, "failed to reparent genre during merge");
            }
        }

        self.soft_delete(source_id)
    }

    fn reassign_book_genre(&self, books: &BookStore, book_id: &str, source_id: &str, target_id: &str) -> StoreResult<()> {
        let mut book = books.get(book_id)?;
        book.genre_ids.retain(|g| g != source_id);
        if !book.genre_ids.iter().any(|g| g == target_id) {
            book.genre_ids.push(target_id.to_string());
        }
        books.update(&mut book)
    }

    /// Refuses to delete system genres or genres with children.
    pub fn soft_delete(&self, id: &str) -> StoreResult<()> {
        if !self.list_child_ids(Some(id))?.is_empty() {
            return Err(StoreError::InvalidInput {
                message: "cannot delete genre with children".to_string(),
            });
        }
        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            let mut g = TABLE.get_or_not_found(tx, id)?;
            if g.is_system {
                return Err(StoreError::InvalidInput {
                    message: "cannot delete system genre".to_string(),
                });
            }
            if g.sync.is_deleted() {
                return Ok(());
            }
            let old_updated = g.sync.updated_at;
            g.sync.soft_delete(now);
            TABLE.update(tx, &g)?;
            syncindex::touch_updated(tx, ENTITY, id, Some(old_updated), g.sync.updated_at)?;
            syncindex::record_deleted(tx, ENTITY, id, now)?;
            Ok(())
        })?;
        self.invalidate_cache();
        Ok(())
    }

    /// Every genre ID whose path is `path_of(gid)` or has it as a slash-
    /// segment prefix, i.e. `gid` and every descendant.
    pub fn book_ids_for_genre_tree(&self, books: &BookStore, gid: &str) -> StoreResult<Vec<String>> {
        let target = self.get(gid)?;
        let all = self.list()?;
        let mut book_ids = std::collections::HashSet::new();
        for g in all.iter().filter(|g| g.path == target.path || g.path.starts_with(&format!("{}/", target.path))) {
            for bid in books.list_book_ids_for_genre(&g.id)? {
                book_ids.insert(bid);
            }
        }
        Ok(book_ids.into_iter().collect())
    }

    pub fn list_deleted_after(&self, since: Timestamp) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| syncindex::list_deleted_after(tx, ENTITY, since))
    }
}
