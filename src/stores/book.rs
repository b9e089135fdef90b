//! Book store: the hub of the entity graph — contributors (with role),
//! series (with sequence), genres, and tags all hang off it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::engine::{Engine, WriteTxCtx};
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::StoreResult;
use crate::id::IdGenerator;
use crate::keycodec::build_key;
use crate::models::{ContributorRole, Syncable};
use crate::syncindex;

pub const ENTITY: &str = "book";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSeriesRef {
    pub series_id: String,
    pub sequence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookContributorRef {
    pub contributor_id: String,
    pub role: ContributorRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub path: String,
    pub inode: u64,
    pub asin: Option<String>,
    pub isbn: Option<String>,
    pub series: Vec<BookSeriesRef>,
    pub contributors: Vec<BookContributorRef>,
    pub genre_ids: Vec<String>,
    pub tag_ids: Vec<String>,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Book {
    fn id(&self) -> &str {
        &self.id
    }
}

static BOOK_INDEXES: &[IndexDef<Book>] = &[
    IndexDef {
        name: "path",
        key_values: |b| vec![b.path.clone()],
        lookup_transform: None,
    },
    IndexDef {
        name: "inode",
        key_values: |b| vec![b.inode.to_string()],
        lookup_transform: None,
    },
    IndexDef {
        name: "asin",
        key_values: |b| b.asin.iter().cloned().collect(),
        lookup_transform: None,
    },
    IndexDef {
        name: "isbn",
        key_values: |b| b.isbn.iter().cloned().collect(),
        lookup_transform: None,
    },
];

const TABLE: EntityTable<Book> = EntityTable {
    entity: ENTITY,
    indexes: BOOK_INDEXES,
};

fn contributor_key(cid: &str, role: ContributorRole, bid: &str) -> Vec<u8> {
    build_key(&["idx", "books", "contributor", cid, &role.to_string(), bid])
}

fn contributor_prefix(cid: &str, role: ContributorRole) -> Vec<u8> {
    let mut p = contributor_key(cid, role, "");
    p.pop();
    p
}

fn series_key(sid: &str, bid: &str) -> Vec<u8> {
    build_key(&["idx", "books", "series", sid, bid])
}

fn series_prefix(sid: &str) -> Vec<u8> {
    let mut p = series_key(sid, "");
    p.pop();
    p
}

fn book_genre_key(bid: &str, gid: &str) -> Vec<u8> {
    build_key(&["idx", "book", "genre", bid, gid])
}

fn genre_book_key(gid: &str, bid: &str) -> Vec<u8> {
    build_key(&["idx", "genre", "book", gid, bid])
}

fn genre_book_prefix(gid: &str) -> Vec<u8> {
    let mut p = genre_book_key(gid, "");
    p.pop();
    p
}

fn book_tag_key(bid: &str, tid: &str) -> Vec<u8> {
    build_key(&["idx", "book", "tag", bid, tid])
}

fn tag_book_key(tid: &str, bid: &str) -> Vec<u8> {
    build_key(&["idx", "tag", "book", tid, bid])
}

fn tag_book_prefix(tid: &str) -> Vec<u8> {
    let mut p = tag_book_key(tid, "");
    p.pop();
    p
}

/// Per-entity store wrapping the generic table with Book's hand-rolled
/// reverse indexes and sync indexes.
pub struct BookStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl BookStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, book: &mut Book) -> StoreResult<()> {
        if book.id.is_empty() {
            book.id = self.ids.generate(crate::models::BookId::TYPE_PREFIX);
        }
        let now = self.clock.now();
        book.sync = Syncable::new(now);
        self.engine.write_retrying(|tx| self.create_tx(tx, book))
    }

    fn create_tx(&self, tx: &WriteTxCtx, book: &Book) -> StoreResult<()> {
        TABLE.create(tx, book)?;
        for cref in &book.contributors {
            tx.set(&contributor_key(&cref.contributor_id, cref.role, &book.id), book.id.as_bytes())?;
        }
        for sref in &book.series {
            tx.set(&series_key(&sref.series_id, &book.id), book.id.as_bytes())?;
        }
        for gid in &book.genre_ids {
            tx.set(&book_genre_key(&book.id, gid), gid.as_bytes())?;
            tx.set(&genre_book_key(gid, &book.id), book.id.as_bytes())?;
        }
        for tid in &book.tag_ids {
            tx.set(&book_tag_key(&book.id, tid), tid.as_bytes())?;
            tx.set(&tag_book_key(tid, &book.id), book.id.as_bytes())?;
        }
        syncindex::touch_updated(tx, ENTITY, &book.id, None, book.sync.updated_at)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> StoreResult<Book> {
        self.engine
            .write_retrying(|tx| TABLE.get_live_or_not_found(tx, id, |b| b.sync.is_deleted()))
    }

    pub fn get_by_path(&self, path: &str) -> StoreResult<Option<Book>> {
        self.engine
            .write_retrying(|tx| TABLE.get_by_index_live(tx, "path", path, |b| b.sync.is_deleted()))
    }

    pub fn get_by_inode(&self, inode: u64) -> StoreResult<Option<Book>> {
        self.engine
            .write_retrying(|tx| TABLE.get_by_index_live(tx, "inode", &inode.to_string(), |b| b.sync.is_deleted()))
    }

    pub fn get_by_asin(&self, asin: &str) -> StoreResult<Option<Book>> {
        self.engine
            .write_retrying(|tx| TABLE.get_by_index_live(tx, "asin", asin, |b| b.sync.is_deleted()))
    }

    pub fn get_by_isbn(&self, isbn: &str) -> StoreResult<Option<Book>> {
        self.engine
            .write_retrying(|tx| TABLE.get_by_index_live(tx, "isbn", isbn, |b| b.sync.is_deleted()))
    }

    /// Replaces the record, diffing contributor/series/genre/tag memberships
    /// the same way the generic table diffs unique indexes.
    pub fn update(&self, book: &mut Book) -> StoreResult<()> {
        book.sync.touch(self.clock.now());
        self.engine.write_retrying(|tx| self.update_tx(tx, book))
    }

    fn update_tx(&self, tx: &WriteTxCtx, book: &Book) -> StoreResult<()> {
        let old = TABLE.get_or_not_found(tx, &book.id)?;
        TABLE.update(tx, book)?;

        for cref in &old.contributors {
            tx.delete(&contributor_key(&cref.contributor_id, cref.role, &book.id))?;
        }
        for cref in &book.contributors {
            tx.set(&contributor_key(&cref.contributor_id, cref.role, &book.id), book.id.as_bytes())?;
        }

        for sref in &old.series {
            tx.delete(&series_key(&sref.series_id, &book.id))?;
        }
        for sref in &book.series {
            tx.set(&series_key(&sref.series_id, &book.id), book.id.as_bytes())?;
        }

        for gid in &old.genre_ids {
            tx.delete(&book_genre_key(&book.id, gid))?;
            tx.delete(&genre_book_key(gid, &book.id))?;
        }
        for gid in &book.genre_ids {
            tx.set(&book_genre_key(&book.id, gid), gid.as_bytes())?;
            tx.set(&genre_book_key(gid, &book.id), book.id.as_bytes())?;
        }

        for tid in &old.tag_ids {
            tx.delete(&book_tag_key(&book.id, tid))?;
            tx.delete(&tag_book_key(tid, &book.id))?;
        }
        for tid in &book.tag_ids {
            tx.set(&book_tag_key(&book.id, tid), tid.as_bytes())?;
            tx.set(&tag_book_key(tid, &book.id), book.id.as_bytes())?;
        }

        syncindex::touch_updated(tx, ENTITY, &book.id, Some(old.sync.updated_at), book.sync.updated_at)?;
        Ok(())
    }

    /// Soft-deletes: flips `deleted_at`, moves the `updated_at` index entry,
    /// and records a tombstone. Reverse indexes are left untouched here —
    /// the owning cascades (collections, listening history, transcodes) are
    /// the caller's (`Store`'s) responsibility, since they span stores.
    pub fn soft_delete(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            let mut book = TABLE.get_or_not_found(tx, id)?;
            if book.sync.is_deleted() {
                return Ok(());
            }
            let old_updated = book.sync.updated_at;
            book.sync.soft_delete(now);
            TABLE.update(tx, &book)?;
            syncindex::touch_updated(tx, ENTITY, id, Some(old_updated), book.sync.updated_at)?;
            syncindex::record_deleted(tx, ENTITY, id, now)?;
            Ok(())
        })
    }

    /// Hard-deletes the primary record, its unique indexes, and every
    /// reverse-index entry known from the stored record. Used internally by
    /// cascades once a book has already been tombstoned and is being purged.
    pub fn purge_tx(&self, tx: &WriteTxCtx, id: &str) -> StoreResult<()> {
        let Some(book) = TABLE.get(tx, id)? else {
            return Ok(());
        };
        for cref in &book.contributors {
            tx.delete(&contributor_key(&cref.contributor_id, cref.role, id))?;
        }
        for sref in &book.series {
            tx.delete(&series_key(&sref.series_id, id))?;
        }
        for gid in &book.genre_ids {
            tx.delete(&book_genre_key(id, gid))?;
            tx.delete(&genre_book_key(gid, id))?;
        }
        for tid in &book.tag_ids {
            tx.delete(&book_tag_key(id, tid))?;
            tx.delete(&tag_book_key(tid, id))?;
        }
        TABLE.delete(tx, id)?;
        syncindex::remove_all(tx, ENTITY, id, book.sync.updated_at, book.sync.deleted_at)?;
        Ok(())
    }

    pub fn list(&self) -> StoreResult<Vec<Book>> {
        self.engine
            .write_retrying(|tx| Ok(TABLE.list(tx)?.into_iter().filter(|b| !b.sync.is_deleted()).collect()))
    }

    pub fn list_updated_after(&self, since: Timestamp) -> StoreResult<Vec<Book>> {
        self.engine.write_retrying(|tx| {
            let ids = syncindex::list_updated_after(tx, ENTITY, since)?;
            ids.into_iter().filter_map(|id| TABLE.get(tx, &id).transpose()).collect()
        })
    }

    pub fn list_deleted_after(&self, since: Timestamp) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| syncindex::list_deleted_after(tx, ENTITY, since))
    }

    pub fn list_book_ids_for_contributor(&self, cid: &str, role: ContributorRole) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| {
            let prefix = contributor_prefix(cid, role);
            Ok(tx
                .scan_prefix(&prefix)?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect())
        })
    }

    pub fn list_book_ids_for_series(&self, sid: &str) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| {
            let prefix = series_prefix(sid);
            Ok(tx
                .scan_prefix(&prefix)?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect())
        })
    }

    pub fn list_book_ids_for_genre(&self, gid: &str) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| {
            let prefix = genre_book_prefix(gid);
            Ok(tx
                .scan_prefix(&prefix)?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect())
        })
    }

    pub fn list_book_ids_for_tag(&self, tid: &str) -> StoreResult<Vec<String>> {
        self.engine.write_retrying(|tx| {
            let prefix = tag_book_prefix(tid);
            Ok(tx
                .scan_prefix(&prefix)?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect())
        })
    }

    /// Rewrites denormalized series display fields on every book in
    /// `series_id` (the non-transactional half of a series rename). Called
    /// by the facade outside the series-update transaction; failures for
    /// individual books are logged and skipped, never propagated.
    pub fn cascade_series_sequence_noop_touch(&self, tx: &WriteTxCtx, book_id: &str) -> StoreResult<()> {
        // Series name/display fields are looked up by ID at read time, not
        // denormalized onto Book, so a series rename needs only to bump
        // `updated_at` on every referencing book for sync purposes.
        let mut book = TABLE.get_or_not_found(tx, book_id)?;
        let old_updated = book.sync.updated_at;
        book.sync.touch(self.clock.now());
        TABLE.update(tx, &book)?;
        syncindex::touch_updated(tx, ENTITY, book_id, Some(old_updated), book.sync.updated_at)?;
        Ok(())
    }
}
