//! Listening history: immutable `ListeningEvent`s plus the two small
//! per-(user,book) singletons derived from them, `PlaybackState` and
//! `BookPreferences`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::engine::{Engine, WriteTxCtx};
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::StoreResult;
use crate::id::IdGenerator;
use crate::keycodec::build_key;
use crate::models::{user_book_key, Syncable};

pub const EVENT_ENTITY: &str = "evt";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListeningEvent {
    pub id: String,
    pub user_id: String,
    pub book_id: String,
    pub start_position_ms: i64,
    pub end_position_ms: i64,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for ListeningEvent {
    fn id(&self) -> &str {
        &self.id
    }
}

static EVENT_INDEXES: &[IndexDef<ListeningEvent>] = &[];

const EVENT_TABLE: EntityTable<ListeningEvent> = EntityTable {
    entity: EVENT_ENTITY,
    indexes: EVENT_INDEXES,
};

fn by_user_key(uid: &str, id: &str) -> Vec<u8> {
    build_key(&[EVENT_ENTITY, "idx", "user", uid, id])
}
fn by_user_prefix(uid: &str) -> Vec<u8> {
    let mut p = by_user_key(uid, "");
    p.pop();
    p
}
fn by_book_key(bid: &str, id: &str) -> Vec<u8> {
    build_key(&[EVENT_ENTITY, "idx", "book", bid, id])
}
fn by_book_prefix(bid: &str) -> Vec<u8> {
    let mut p = by_book_key(bid, "");
    p.pop();
    p
}
fn by_user_book_key(uid: &str, bid: &str, id: &str) -> Vec<u8> {
    build_key(&[EVENT_ENTITY, "idx", "userbook", uid, bid, id])
}
fn by_user_book_prefix(uid: &str, bid: &str) -> Vec<u8> {
    let mut p = by_user_book_key(uid, bid, "");
    p.pop();
    p
}
/// `evt:idx:user:time:<uid>:<endedAtMs:020d>:<id>` — the range index behind
/// `GetEventsForUserInRange`.
fn time_key(uid: &str, ended_at: Timestamp, id: &str) -> Vec<u8> {
    build_key(&[EVENT_ENTITY, "idx", "user", "time", uid, &ended_at.forward_millis_key(), id])
}
fn time_bound(uid: &str, ended_at: Timestamp) -> Vec<u8> {
    build_key(&[EVENT_ENTITY, "idx", "user", "time", uid, &ended_at.forward_millis_key()])
}

pub struct ListeningEventStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl ListeningEventStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    /// Writes the primary record plus all four reverse/range indexes in one
    /// transaction.
    pub fn create(&self, event: &mut ListeningEvent) -> StoreResult<()> {
        if event.id.is_empty() {
            event.id = self.ids.generate(crate::models::ListeningEventId::TYPE_PREFIX);
        }
        event.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| {
            EVENT_TABLE.create(tx, event)?;
            tx.set(&by_user_key(&event.user_id, &event.id), event.id.as_bytes())?;
            tx.set(&by_book_key(&event.book_id, &event.id), event.id.as_bytes())?;
            tx.set(&by_user_book_key(&event.user_id, &event.book_id, &event.id), event.id.as_bytes())?;
            tx.set(&time_key(&event.user_id, event.ended_at, &event.id), event.id.as_bytes())?;
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> StoreResult<ListeningEvent> {
        self.engine.write_retrying(|tx| EVENT_TABLE.get_or_not_found(tx, id))
    }

    /// Seeks the `[start, end)` millisecond range of the user's time index,
    /// then batch-fetches the matching events in the same read transaction.
    pub fn get_events_for_user_in_range(&self, user_id: &str, start: Timestamp, end: Timestamp) -> StoreResult<Vec<ListeningEvent>> {
        self.engine.write_retrying(|tx| {
            let lower = time_bound(user_id, start);
            let upper = time_bound(user_id, end);
            let mut out = Vec::new();
            for (_, value) in tx.scan_range(&lower, &upper)? {
                let id = String::from_utf8_lossy(&value).into_owned();
                if let Some(event) = EVENT_TABLE.get(tx, &id)? {
                    out.push(event);
                }
            }
            Ok(out)
        })
    }

    fn delete_tx(&self, tx: &WriteTxCtx, event: &ListeningEvent) -> StoreResult<()> {
        EVENT_TABLE.delete(tx, &event.id)?;
        tx.delete(&by_user_key(&event.user_id, &event.id))?;
        tx.delete(&by_book_key(&event.book_id, &event.id))?;
        tx.delete(&by_user_book_key(&event.user_id, &event.book_id, &event.id))?;
        tx.delete(&time_key(&event.user_id, event.ended_at, &event.id))?;
        Ok(())
    }

    pub fn delete_events_for_user_book(&self, user_id: &str, book_id: &str) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&by_user_book_prefix(user_id, book_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            for id in ids {
                if let Some(event) = EVENT_TABLE.get(tx, &id)? {
                    self.delete_tx(tx, &event)?;
                }
            }
            Ok(())
        })
    }

    pub fn delete_events_for_book(&self, book_id: &str) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&by_book_prefix(book_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            for id in ids {
                if let Some(event) = EVENT_TABLE.get(tx, &id)? {
                    self.delete_tx(tx, &event)?;
                }
            }
            Ok(())
        })
    }

    pub fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<ListeningEvent>> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&by_user_prefix(user_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            ids.into_iter().filter_map(|id| EVENT_TABLE.get(tx, &id).transpose()).collect()
        })
    }
}

// ---------------------------------------------------------------------
// PlaybackState
// ---------------------------------------------------------------------

pub const PROGRESS_ENTITY: &str = "progress";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackState {
    pub id: String,
    pub user_id: String,
    pub book_id: String,
    pub current_position_ms: i64,
    pub is_finished: bool,
    pub finished_at: Option<Timestamp>,
    pub last_played_at: Timestamp,
}

impl Record for PlaybackState {
    fn id(&self) -> &str {
        &self.id
    }
}

static PROGRESS_INDEXES: &[IndexDef<PlaybackState>] = &[];

const PROGRESS_TABLE: EntityTable<PlaybackState> = EntityTable {
    entity: PROGRESS_ENTITY,
    indexes: PROGRESS_INDEXES,
};

fn progress_by_user_key(uid: &str, state_id: &str) -> Vec<u8> {
    build_key(&[PROGRESS_ENTITY, "idx", "user", uid, state_id])
}
fn progress_by_user_prefix(uid: &str) -> Vec<u8> {
    let mut p = progress_by_user_key(uid, "");
    p.pop();
    p
}

pub struct PlaybackStateStore {
    engine: Arc<Engine>,
}

impl PlaybackStateStore {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn get(&self, user_id: &str, book_id: &str) -> StoreResult<Option<PlaybackState>> {
        let id = user_book_key(user_id, book_id);
        self.engine.write_retrying(|tx| PROGRESS_TABLE.get(tx, &id))
    }

    /// Upsert: creates the state (and its by-user index entry) on first
    /// write, overwrites in place thereafter.
    pub fn upsert(&self, state: &mut PlaybackState) -> StoreResult<()> {
        state.id = user_book_key(&state.user_id, &state.book_id);
        self.engine.write_retrying(|tx| {
            if PROGRESS_TABLE.get(tx, &state.id)?.is_none() {
                PROGRESS_TABLE.create(tx, state)?;
                tx.set(&progress_by_user_key(&state.user_id, &state.id), state.id.as_bytes())?;
            } else {
                PROGRESS_TABLE.update(tx, state)?;
            }
            Ok(())
        })
    }

    pub fn delete(&self, user_id: &str, book_id: &str) -> StoreResult<()> {
        let id = user_book_key(user_id, book_id);
        self.engine.write_retrying(|tx| {
            PROGRESS_TABLE.delete(tx, &id)?;
            tx.delete(&progress_by_user_key(user_id, &id))?;
            Ok(())
        })
    }

    pub fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<PlaybackState>> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&progress_by_user_prefix(user_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            ids.into_iter().filter_map(|id| PROGRESS_TABLE.get(tx, &id).transpose()).collect()
        })
    }

    /// Filters to not-finished, `current_position_ms > 0`, not hidden per
    /// `BookPreferences`, sorts DESC by `last_played_at`, applies `limit`.
    pub fn get_continue_listening(&self, preferences: &BookPreferencesStore, user_id: &str, limit: usize) -> StoreResult<Vec<PlaybackState>> {
        let hidden = preferences.hidden_book_ids(user_id)?;
        let mut states: Vec<PlaybackState> = self
            .list_for_user(user_id)?
            .into_iter()
            .filter(|s| !s.is_finished && s.current_position_ms > 0 && !hidden.contains(&s.book_id))
            .collect();
        states.sort_by(|a, b| b.last_played_at.cmp(&a.last_played_at));
        states.truncate(limit);
        Ok(states)
    }

    pub fn get_state_finished_in_range(&self, user_id: &str, start: Timestamp, end: Timestamp) -> StoreResult<Vec<PlaybackState>> {
        Ok(self
            .list_for_user(user_id)?
            .into_iter()
            .filter(|s| s.is_finished && s.finished_at.is_some_and(|f| f >= start && f < end))
            .collect())
    }

    /// Best-effort: full-table scan for states referencing `book_id`. There's
    /// no by-book reverse index on this per-user table, so a book-delete
    /// cascade has no cheaper path than walking every state.
    pub fn delete_for_book(&self, book_id: &str) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            for state in PROGRESS_TABLE.list(tx)? {
                if state.book_id == book_id {
                    PROGRESS_TABLE.delete(tx, &state.id)?;
                    tx.delete(&progress_by_user_key(&state.user_id, &state.id))?;
                }
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------
// BookPreferences
// ---------------------------------------------------------------------

pub const PREFERENCES_ENTITY: &str = "bookprefs";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookPreferences {
    pub id: String,
    pub user_id: String,
    pub book_id: String,
    pub hide_from_continue: bool,
}

impl Record for BookPreferences {
    fn id(&self) -> &str {
        &self.id
    }
}

static PREFERENCES_INDEXES: &[IndexDef<BookPreferences>] = &[];

const PREFERENCES_TABLE: EntityTable<BookPreferences> = EntityTable {
    entity: PREFERENCES_ENTITY,
    indexes: PREFERENCES_INDEXES,
};

fn prefs_by_user_key(uid: &str, pref_id: &str) -> Vec<u8> {
    build_key(&[PREFERENCES_ENTITY, "idx", "user", uid, pref_id])
}
fn prefs_by_user_prefix(uid: &str) -> Vec<u8> {
    let mut p = prefs_by_user_key(uid, "");
    p.pop();
    p
}

pub struct BookPreferencesStore {
    engine: Arc<Engine>,
}

impl BookPreferencesStore {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn get(&self, user_id: &str, book_id: &str) -> StoreResult<Option<BookPreferences>> {
        let id = user_book_key(user_id, book_id);
        self.engine.write_retrying(|tx| PREFERENCES_TABLE.get(tx, &id))
    }

    pub fn upsert(&self, prefs: &mut BookPreferences) -> StoreResult<()> {
        prefs.id = user_book_key(&prefs.user_id, &prefs.book_id);
        self.engine.write_retrying(|tx| {
            if PREFERENCES_TABLE.get(tx, &prefs.id)?.is_none() {
                PREFERENCES_TABLE.create(tx, prefs)?;
                tx.set(&prefs_by_user_key(&prefs.user_id, &prefs.id), prefs.id.as_bytes())?;
            } else {
                PREFERENCES_TABLE.update(tx, prefs)?;
            }
            Ok(())
        })
    }

    pub fn hidden_book_ids(&self, user_id: &str) -> StoreResult<std::collections::HashSet<String>> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&prefs_by_user_prefix(user_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            let mut hidden = std::collections::HashSet::new();
            for id in ids {
                if let Some(p) = PREFERENCES_TABLE.get(tx, &id)? {
                    if p.hide_from_continue {
                        hidden.insert(p.book_id);
                    }
                }
            }
            Ok(hidden)
        })
    }

    /// Best-effort: full-table scan, same rationale as
    /// [`PlaybackStateStore::delete_for_book`].
    pub fn delete_for_book(&self, book_id: &str) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            for prefs in PREFERENCES_TABLE.list(tx)? {
                if prefs.book_id == book_id {
                    PREFERENCES_TABLE.delete(tx, &prefs.id)?;
                    tx.delete(&prefs_by_user_key(&prefs.user_id, &prefs.id))?;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::id::SequentialIdGenerator;

    fn event_store() -> (ListeningEventStore, Arc<TestClock>) {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock = Arc::new(TestClock::new(Timestamp::ZERO));
        let ids = Arc::new(SequentialIdGenerator::default());
        (ListeningEventStore::new(engine, clock.clone(), ids), clock)
    }

    fn event(user_id: &str, ended_at: Timestamp) -> ListeningEvent {
        ListeningEvent {
            id: String::new(),
            user_id: user_id.to_string(),
            book_id: "book-1".to_string(),
            start_position_ms: 0,
            end_position_ms: 1000,
            started_at: ended_at,
            ended_at,
            sync: Syncable::new(Timestamp::ZERO),
        }
    }

    #[test]
    fn range_query_returns_exactly_events_in_window() {
        let (store, _clock) = event_store();
        let now_ms = 10 * 86_400_000i64;
        let mut events: Vec<ListeningEvent> = [now_ms - 3 * 86_400_000, now_ms - 2 * 86_400_000, now_ms - 86_400_000, now_ms]
            .into_iter()
            .map(|ms| event("user-A", Timestamp::from_millis(ms)))
            .collect();
        for e in events.iter_mut() {
            store.create(e).unwrap();
        }

        let start = Timestamp::from_millis(now_ms - 2 * 86_400_000 + 3_600_000);
        let end = Timestamp::from_millis(now_ms + 3_600_000);
        let found = store.get_events_for_user_in_range("user-A", start, end).unwrap();
        let mut ids: Vec<String> = found.into_iter().map(|e| e.id).collect();
        ids.sort();
        let mut expected: Vec<String> = vec![events[2].id.clone(), events[3].id.clone()];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn continue_listening_excludes_finished_and_hidden() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let progress = PlaybackStateStore::new(engine.clone());
        let prefs = BookPreferencesStore::new(engine);

        let mut finished = PlaybackState {
            id: String::new(),
            user_id: "user-A".to_string(),
            book_id: "book-1".to_string(),
            current_position_ms: 500,
            is_finished: true,
            finished_at: Some(Timestamp::from_millis(1)),
            last_played_at: Timestamp::from_millis(1),
        };
        let mut hidden = PlaybackState {
            id: String::new(),
            user_id: "user-A".to_string(),
            book_id: "book-2".to_string(),
            current_position_ms: 500,
            is_finished: false,
            finished_at: None,
            last_played_at: Timestamp::from_millis(2),
        };
        let mut visible = PlaybackState {
            id: String::new(),
            user_id: "user-A".to_string(),
            book_id: "book-3".to_string(),
            current_position_ms: 500,
            is_finished: false,
            finished_at: None,
            last_played_at: Timestamp::from_millis(3),
        };
        progress.upsert(&mut finished).unwrap();
        progress.upsert(&mut hidden).unwrap();
        progress.upsert(&mut visible).unwrap();

        let mut hidden_pref = BookPreferences {
            id: String::new(),
            user_id: "user-A".to_string(),
            book_id: "book-2".to_string(),
            hide_from_continue: true,
        };
        prefs.upsert(&mut hidden_pref).unwrap();

        let result = progress.get_continue_listening(&prefs, "user-A", 10).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].book_id, "book-3");
    }
}
