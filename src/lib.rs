//! `bookvault-store`: typed, index-maintaining persistence for an audiobook
//! server, built on an embedded ordered KV engine.
//!
//! [`Store`] is the single entry point: it owns the [`engine::Engine`]
//! handle and every per-entity store, and is the one place that knows how
//! to stitch cross-entity cascades (book deletion touching collections,
//! listening history, and transcode jobs) into a single call.

pub mod backup;
pub mod cache_store;
pub mod clock;
pub mod collaborators;
pub mod engine;
pub mod entity;
pub mod error;
pub mod id;
pub mod keycodec;
pub mod models;
pub mod pagination;
pub mod stores;
pub mod syncindex;
pub mod views;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

use clock::{Clock, SystemClock};
use collaborators::{DomainEvent, DomainEventKind, EventEmitter, Logger, NoopEventEmitter, NoopLogger, SearchIndexer, TranscodeDeleter};
use engine::Engine;
use error::{DbResult, StoreResult};
use id::{IdGenerator, SortableIdGenerator};

use stores::activity::ActivityStore;
use stores::book::{Book, BookStore};
use stores::collection::{Collection, CollectionStore};
use stores::contributor::{Contributor, ContributorStore};
use stores::genre::GenreStore;
use stores::library::LibraryStore;
use stores::listening::{BookPreferencesStore, ListeningEventStore, PlaybackStateStore};
use stores::misc::{InstanceStore, ProfileStore, ServerSettingsStore, UserMilestoneStore, UserSettingsStore, UserStatsStore};
use stores::series::{Series, SeriesStore};
use stores::session::{InviteStore, ReadingSessionStore, SessionStore};
use stores::shelf::ShelfStore;
use stores::tag::TagStore;
use stores::transcode::TranscodeJobStore;

const LOG_TARGET: &str = "bookvault::store";

/// Collaborators installed after construction. Each slot defaults to a
/// no-op (or `None`, for the two cascade hooks that have none) so `Store`
/// is fully usable before a host application wires anything in.
struct Collaborators {
    logger: RwLock<Arc<dyn Logger>>,
    events: RwLock<Arc<dyn EventEmitter>>,
    search: RwLock<Option<Arc<dyn SearchIndexer>>>,
    transcode_deleter: RwLock<Option<Arc<dyn TranscodeDeleter>>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            logger: RwLock::new(Arc::new(NoopLogger)),
            events: RwLock::new(Arc::new(NoopEventEmitter)),
            search: RwLock::new(None),
            transcode_deleter: RwLock::new(None),
        }
    }
}

/// The persistence layer's single entry point.
///
/// Most entities are exposed as plain public store fields — callers use
/// `store.tags.create(...)`, `store.shelves.get(...)`, etc. directly. A
/// handful of operations that fan out across stores (book/series/contributor
/// mutation, library deletion, the bulk-scan flag, and the data-wipe
/// operation) are instead exposed as methods on `Store` itself, since they
/// need to coordinate more than one store's transaction.
pub struct Store {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
    bulk_mode: AtomicBool,

    pub books: BookStore,
    pub series: SeriesStore,
    pub contributors: ContributorStore,
    pub genres: GenreStore,
    pub tags: TagStore,
    pub libraries: LibraryStore,
    pub collections: CollectionStore,
    pub shelves: ShelfStore,
    pub activities: ActivityStore,
    pub listening_events: ListeningEventStore,
    pub playback_states: PlaybackStateStore,
    pub book_preferences: BookPreferencesStore,
    pub transcode_jobs: TranscodeJobStore,
    pub sessions: SessionStore,
    pub reading_sessions: ReadingSessionStore,
    pub invites: InviteStore,
    pub user_stats: UserStatsStore,
    pub user_settings: UserSettingsStore,
    pub profiles: ProfileStore,
    pub milestones: UserMilestoneStore,
    pub instance: InstanceStore,
    pub server_settings: ServerSettingsStore,

    pub cache: cache_store::CacheStore,
}

impl Store {
    /// Opens (creating if absent) the on-disk database at `path`, using the
    /// real system clock and a sortable random ID generator. Collaborators
    /// start as no-ops; wire them in afterward with
    /// [`Store::set_logger`]/[`Store::set_event_emitter`]/
    /// [`Store::set_search_indexer`]/[`Store::set_transcode_deleter`].
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let engine = Engine::open(path)?;
        Ok(Self::from_engine(engine, Arc::new(SystemClock), Arc::new(SortableIdGenerator)))
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let engine = Engine::open_in_memory()?;
        Ok(Self::from_engine(engine, Arc::new(SystemClock), Arc::new(SortableIdGenerator)))
    }

    /// Test/embedding constructor: caller supplies the clock and ID
    /// generator, for deterministic fixtures.
    pub fn open_with(engine: Engine, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self::from_engine(engine, clock, ids)
    }

    fn from_engine(engine: Engine, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        let engine = Arc::new(engine);
        Self {
            engine: engine.clone(),
            clock: clock.clone(),
            collaborators: Collaborators::default(),
            bulk_mode: AtomicBool::new(false),

            books: BookStore::new(engine.clone(), clock.clone(), ids.clone()),
            series: SeriesStore::new(engine.clone(), clock.clone(), ids.clone()),
            contributors: ContributorStore::new(engine.clone(), clock.clone(), ids.clone()),
            genres: GenreStore::new(engine.clone(), clock.clone(), ids.clone()),
            tags: TagStore::new(engine.clone(), clock.clone(), ids.clone()),
            libraries: LibraryStore::new(engine.clone(), clock.clone(), ids.clone()),
            collections: CollectionStore::new(engine.clone(), clock.clone(), ids.clone()),
            shelves: ShelfStore::new(engine.clone(), clock.clone(), ids.clone()),
            activities: ActivityStore::new(engine.clone(), clock.clone(), ids.clone()),
            listening_events: ListeningEventStore::new(engine.clone(), clock.clone(), ids.clone()),
            playback_states: PlaybackStateStore::new(engine.clone()),
            book_preferences: BookPreferencesStore::new(engine.clone()),
            transcode_jobs: TranscodeJobStore::new(engine.clone(), clock.clone(), ids.clone()),
            sessions: SessionStore::new(engine.clone(), clock.clone(), ids.clone()),
            reading_sessions: ReadingSessionStore::new(engine.clone(), ids.clone()),
            invites: InviteStore::new(engine.clone(), clock.clone(), ids.clone()),
            user_stats: UserStatsStore::new(engine.clone(), clock.clone()),
            user_settings: UserSettingsStore::new(engine.clone(), clock.clone()),
            profiles: ProfileStore::new(engine.clone(), clock.clone()),
            milestones: UserMilestoneStore::new(engine.clone(), clock.clone()),
            instance: InstanceStore::new(engine.clone(), clock.clone()),
            server_settings: ServerSettingsStore::new(engine.clone(), clock.clone()),

            cache: cache_store::CacheStore::new(engine.clone(), clock.clone()),
        }
    }

    /// Compacts and releases the underlying database file. Every other
    /// `Arc<Engine>` handle (one per per-entity store) is dropped along with
    /// `self` before this tries to reclaim sole ownership, so the unwrap
    /// only fails if a caller is holding some other clone of the engine
    /// handle directly — in which case compaction is simply skipped.
    pub fn close(self) -> DbResult<()> {
        let Store { engine, .. } = self;
        match Arc::try_unwrap(engine) {
            Ok(engine) => engine.compact_and_close(),
            Err(_) => Ok(()),
        }
    }

    pub fn set_logger(&self, logger: Arc<dyn Logger>) {
        *self.collaborators.logger.write().expect("logger lock poisoned") = logger;
    }

    pub fn set_event_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.collaborators.events.write().expect("events lock poisoned") = emitter;
    }

    pub fn set_search_indexer(&self, indexer: Arc<dyn SearchIndexer>) {
        *self.collaborators.search.write().expect("search lock poisoned") = Some(indexer);
    }

    pub fn set_transcode_deleter(&self, deleter: Arc<dyn TranscodeDeleter>) {
        *self.collaborators.transcode_deleter.write().expect("transcode deleter lock poisoned") = Some(deleter);
    }

    /// Toggles bulk-import mode. Callers check [`Store::is_bulk_mode`] around
    /// large batch operations (a library scan importing thousands of books)
    /// to suppress per-record event emission and defer search indexing to a
    /// trailing bulk pass instead of one call per record.
    pub fn set_bulk_mode(&self, enabled: bool) {
        self.bulk_mode.store(enabled, Ordering::Relaxed);
        self.collaborators
            .events
            .read()
            .expect("events lock poisoned")
            .set_scanning(enabled);
    }

    pub fn is_bulk_mode(&self) -> bool {
        self.bulk_mode.load(Ordering::Relaxed)
    }

    fn emit(&self, entity: &'static str, id: String, kind: DomainEventKind) {
        if self.is_bulk_mode() {
            return;
        }
        self.collaborators
            .events
            .read()
            .expect("events lock poisoned")
            .emit(DomainEvent { entity, id, kind });
    }

    // -----------------------------------------------------------------
    // Book
    // -----------------------------------------------------------------

    pub fn create_book(&self, book: &mut Book) -> StoreResult<()> {
        self.books.create(book)?;
        self.emit(stores::book::ENTITY, book.id.clone(), DomainEventKind::Created);
        if !self.is_bulk_mode() {
            if let Some(indexer) = self.collaborators.search.read().expect("search lock poisoned").as_ref() {
                indexer.index_book(&book.id);
            }
        }
        Ok(())
    }

    pub fn update_book(&self, book: &mut Book) -> StoreResult<()> {
        self.books.update(book)?;
        self.emit(stores::book::ENTITY, book.id.clone(), DomainEventKind::Updated);
        if !self.is_bulk_mode() {
            if let Some(indexer) = self.collaborators.search.read().expect("search lock poisoned").as_ref() {
                indexer.index_book(&book.id);
            }
        }
        Ok(())
    }

    /// Soft-deletes a book and cascades into every store that references it.
    /// The cascade is best-effort: each step is logged on failure and does
    /// not abort the rest, since the book itself is already gone from the
    /// caller's perspective once `soft_delete` commits.
    pub fn delete_book(&self, id: &str) -> StoreResult<()> {
        self.books.soft_delete(id)?;

        if let Err(err) = self.engine.write_retrying(|tx| self.collections.remove_book_from_all(tx, id)) {
            warn!(target: LOG_TARGET, book_id = %id, err = %err, "failed to remove deleted book from collections");
        }
        if let Err(err) = self.listening_events.delete_events_for_book(id) {
            warn!(target: LOG_TARGET, book_id = %id, err = %err, "failed to delete listening events for deleted book");
        }
        if let Err(err) = self.playback_states.delete_for_book(id) {
            warn!(target: LOG_TARGET, book_id = %id, err = %err, "failed to delete playback states for deleted book");
        }
        if let Err(err) = self.book_preferences.delete_for_book(id) {
            warn!(target: LOG_TARGET, book_id = %id, err = %err, "failed to delete book preferences for deleted book");
        }
        if let Err(err) = self.transcode_jobs.delete_for_book(id) {
            warn!(target: LOG_TARGET, book_id = %id, err = %err, "failed to delete transcode jobs for deleted book");
        }
        if let Some(deleter) = self.collaborators.transcode_deleter.read().expect("transcode deleter lock poisoned").as_ref() {
            deleter.delete_transcodes_for_book(id);
        }

        self.emit(stores::book::ENTITY, id.to_string(), DomainEventKind::Deleted);
        if let Some(indexer) = self.collaborators.search.read().expect("search lock poisoned").as_ref() {
            indexer.delete_book(id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Series
    // -----------------------------------------------------------------

    pub fn create_series(&self, series: &mut Series) -> StoreResult<()> {
        self.series.create(series)?;
        self.emit(stores::series::ENTITY, series.id.clone(), DomainEventKind::Created);
        if !self.is_bulk_mode() {
            if let Some(indexer) = self.collaborators.search.read().expect("search lock poisoned").as_ref() {
                indexer.index_series(&series.id);
            }
        }
        Ok(())
    }

    /// Writes the series, then cascades the touch-every-referencing-book
    /// update. Reindexing is skipped in bulk mode like every other
    /// per-record search hook.
    pub fn update_series(&self, series: &mut Series) -> StoreResult<()> {
        self.series.update(series, &self.books)?;
        self.emit(stores::series::ENTITY, series.id.clone(), DomainEventKind::Updated);
        if !self.is_bulk_mode() {
            if let Some(indexer) = self.collaborators.search.read().expect("search lock poisoned").as_ref() {
                indexer.index_series(&series.id);
            }
        }
        Ok(())
    }

    pub fn delete_series(&self, id: &str) -> StoreResult<()> {
        self.series.soft_delete(id)?;
        self.emit(stores::series::ENTITY, id.to_string(), DomainEventKind::Deleted);
        if let Some(indexer) = self.collaborators.search.read().expect("search lock poisoned").as_ref() {
            indexer.delete_series(id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Contributor
    // -----------------------------------------------------------------

    pub fn create_contributor(&self, contributor: &mut Contributor) -> StoreResult<()> {
        self.contributors.create(contributor)?;
        self.emit(stores::contributor::ENTITY, contributor.id.clone(), DomainEventKind::Created);
        if !self.is_bulk_mode() {
            if let Some(indexer) = self.collaborators.search.read().expect("search lock poisoned").as_ref() {
                indexer.index_contributor(&contributor.id);
            }
        }
        Ok(())
    }

    pub fn update_contributor(&self, contributor: &mut Contributor) -> StoreResult<()> {
        self.contributors.update(contributor)?;
        self.emit(stores::contributor::ENTITY, contributor.id.clone(), DomainEventKind::Updated);
        if !self.is_bulk_mode() {
            if let Some(indexer) = self.collaborators.search.read().expect("search lock poisoned").as_ref() {
                indexer.index_contributor(&contributor.id);
            }
        }
        Ok(())
    }

    pub fn merge_contributors(&self, source_id: &str, target_id: &str) -> StoreResult<()> {
        self.contributors.merge(&self.books, source_id, target_id)?;
        self.emit(stores::contributor::ENTITY, source_id.to_string(), DomainEventKind::Deleted);
        if let Some(indexer) = self.collaborators.search.read().expect("search lock poisoned").as_ref() {
            indexer.delete_contributor(source_id);
            indexer.index_contributor(target_id);
        }
        Ok(())
    }

    pub fn delete_contributor(&self, id: &str) -> StoreResult<()> {
        self.contributors.soft_delete(id)?;
        self.emit(stores::contributor::ENTITY, id.to_string(), DomainEventKind::Deleted);
        if let Some(indexer) = self.collaborators.search.read().expect("search lock poisoned").as_ref() {
            indexer.delete_contributor(id);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Library / Collection
    // -----------------------------------------------------------------

    /// Soft-deletes a library and, transitively, every collection it owns
    /// (and every share on those collections).
    pub fn delete_library(&self, id: &str) -> StoreResult<()> {
        self.libraries.delete(&self.collections, id)?;
        self.emit(stores::library::ENTITY, id.to_string(), DomainEventKind::Deleted);
        Ok(())
    }

    pub fn delete_collection(&self, collection: &Collection) -> StoreResult<()> {
        self.collections.delete(collection)?;
        self.emit(stores::collection::ENTITY, collection.id.clone(), DomainEventKind::Deleted);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Bulk data management
    // -----------------------------------------------------------------

    /// Deletes every entity's data and invalidates the genre cache. Used by
    /// the restore path: a backup is always applied to an empty store, but
    /// a host application re-running a restore against a live instance
    /// needs this to clear out stale state first.
    pub fn clear_all_data(&self) -> StoreResult<()> {
        backup::clear_all_data(&self.engine)?;
        self.genres.invalidate_cache();
        Ok(())
    }
}
