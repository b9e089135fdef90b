//! Activity: an append-only, time-indexed feed. No update operation —
//! activities are immutable once recorded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::engine::Engine;
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::StoreResult;
use crate::id::IdGenerator;
use crate::keycodec::build_key;
use crate::models::Syncable;

pub const ENTITY: &str = "activity";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub user_id: String,
    pub book_id: Option<String>,
    pub kind: String,
    pub message: String,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Activity {
    fn id(&self) -> &str {
        &self.id
    }
}

static ACTIVITY_INDEXES: &[IndexDef<Activity>] = &[];

const TABLE: EntityTable<Activity> = EntityTable {
    entity: ENTITY,
    indexes: ACTIVITY_INDEXES,
};

fn time_key(ts: Timestamp, id: &str) -> Vec<u8> {
    build_key(&[ENTITY, "idx", "time", &ts.inverted_key(), id])
}

fn time_prefix() -> Vec<u8> {
    let mut p = time_key(Timestamp::ZERO, "");
    p.pop();
    p
}

fn user_time_key(uid: &str, ts: Timestamp, id: &str) -> Vec<u8> {
    build_key(&[ENTITY, "idx", "user", uid, &ts.inverted_key(), id])
}

fn user_time_prefix(uid: &str) -> Vec<u8> {
    let mut p = user_time_key(uid, Timestamp::ZERO, "");
    p.pop();
    p
}

fn book_time_key(bid: &str, ts: Timestamp, id: &str) -> Vec<u8> {
    build_key(&[ENTITY, "idx", "book", bid, &ts.inverted_key(), id])
}

fn book_time_prefix(bid: &str) -> Vec<u8> {
    let mut p = book_time_key(bid, Timestamp::ZERO, "");
    p.pop();
    p
}

/// Pagination cursor for the activity feed: the `(created_at, id)` pair of
/// the last item on the previous page. Carrying the id alongside the
/// timestamp breaks ties between activities recorded in the same instant,
/// which a bare timestamp cursor cannot.
#[derive(Debug, Clone)]
pub struct ActivityCursor {
    pub created_at: Timestamp,
    pub id: String,
}

pub struct ActivityStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl ActivityStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, activity: &mut Activity) -> StoreResult<()> {
        if activity.id.is_empty() {
            activity.id = self.ids.generate(crate::models::ActivityId::TYPE_PREFIX);
        }
        activity.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| {
            TABLE.create(tx, activity)?;
            tx.set(&time_key(activity.sync.created_at, &activity.id), activity.id.as_bytes())?;
            tx.set(
                &user_time_key(&activity.user_id, activity.sync.created_at, &activity.id),
                activity.id.as_bytes(),
            )?;
            if let Some(bid) = &activity.book_id {
                tx.set(&book_time_key(bid, activity.sync.created_at, &activity.id), activity.id.as_bytes())?;
            }
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> StoreResult<Activity> {
        self.engine.write_retrying(|tx| TABLE.get_or_not_found(tx, id))
    }

    fn feed_from_prefix(&self, prefix: &[u8], limit: usize, before: Option<&ActivityCursor>) -> StoreResult<Vec<Activity>> {
        self.engine.write_retrying(|tx| {
            let mut out = Vec::new();
            for (_, value) in tx.scan_prefix(prefix)? {
                let id = String::from_utf8_lossy(&value).into_owned();
                let Some(a) = TABLE.get(tx, &id)? else {
                    // Primary vanished (hard-deleted elsewhere); skip rather
                    // than fail the whole feed.
                    continue;
                };
                if let Some(cursor) = before {
                    let newer_or_tied = a.sync.created_at > cursor.created_at
                        || (a.sync.created_at == cursor.created_at && a.id >= cursor.id);
                    if newer_or_tied {
                        continue;
                    }
                }
                out.push(a);
                if out.len() >= limit {
                    break;
                }
            }
            Ok(out)
        })
    }

    pub fn get_feed(&self, limit: usize, before: Option<&ActivityCursor>) -> StoreResult<Vec<Activity>> {
        self.feed_from_prefix(&time_prefix(), limit, before)
    }

    pub fn get_feed_for_user(&self, user_id: &str, limit: usize, before: Option<&ActivityCursor>) -> StoreResult<Vec<Activity>> {
        self.feed_from_prefix(&user_time_prefix(user_id), limit, before)
    }

    pub fn get_feed_for_book(&self, book_id: &str, limit: usize, before: Option<&ActivityCursor>) -> StoreResult<Vec<Activity>> {
        self.feed_from_prefix(&book_time_prefix(book_id), limit, before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::id::SequentialIdGenerator;

    fn store_with_clock() -> (ActivityStore, Arc<TestClock>) {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock = Arc::new(TestClock::new(Timestamp::ZERO));
        let ids = Arc::new(SequentialIdGenerator::default());
        (ActivityStore::new(engine, clock.clone(), ids), clock)
    }

    fn activity(user_id: &str) -> Activity {
        Activity {
            id: String::new(),
            user_id: user_id.to_string(),
            book_id: None,
            kind: "note".to_string(),
            message: "hi".to_string(),
            sync: Syncable::new(Timestamp::ZERO),
        }
    }

    #[test]
    fn feed_returns_newest_first_and_supports_before_cursor() {
        let (store, clock) = store_with_clock();
        let mut a1 = activity("u1");
        store.create(&mut a1).unwrap();
        clock.advance(std::time::Duration::from_secs(1));
        let mut a2 = activity("u1");
        store.create(&mut a2).unwrap();
        clock.advance(std::time::Duration::from_secs(1));
        let mut a3 = activity("u1");
        store.create(&mut a3).unwrap();

        let first_page = store.get_feed(10, None).unwrap();
        assert_eq!(first_page.iter().map(|a| a.id.clone()).collect::<Vec<_>>(), vec![a3.id.clone(), a2.id.clone(), a1.id.clone()]);

        let cursor = ActivityCursor {
            created_at: a2.sync.created_at,
            id: a2.id.clone(),
        };
        let second_page = store.get_feed(10, Some(&cursor)).unwrap();
        assert_eq!(second_page.iter().map(|a| a.id.clone()).collect::<Vec<_>>(), vec![a1.id.clone()]);
    }

    #[test]
    fn per_book_feed_only_includes_tagged_activities() {
        let (store, _clock) = store_with_clock();
        let mut tagged = activity("u1");
        tagged.book_id = Some("book-1".to_string());
        store.create(&mut tagged).unwrap();
        let mut untagged = activity("u1");
        store.create(&mut untagged).unwrap();

        let feed = store.get_feed_for_book("book-1", 10, None).unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].id, tagged.id);
    }
}
