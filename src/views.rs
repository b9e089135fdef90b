//! Cross-store aggregations: queries that need more than one store's data to
//! answer, sitting alongside (not replacing) the single-store views that
//! already live on their owning stores (e.g.
//! [`crate::stores::listening::PlaybackStateStore::get_continue_listening`],
//! [`crate::stores::genre::GenreStore::book_ids_for_genre_tree`]).

use std::collections::HashMap;

use crate::backup::ENTITY_PREFIXES;
use crate::clock::Timestamp;
use crate::engine::Engine;
use crate::error::StoreResult;
use crate::keycodec::{entity_prefix, is_index_key};
use crate::stores::listening::{ListeningEventStore, PlaybackStateStore};
use crate::stores::misc::{UserStats, UserStatsStore};
use crate::stores::{book, collection, contributor, genre, library, series, shelf, tag};
use crate::syncindex;

/// What changed for one entity since a delta-sync checkpoint.
#[derive(Debug, Clone, Default)]
pub struct EntityDelta {
    pub upserted_ids: Vec<String>,
    pub deleted_ids: Vec<String>,
}

/// Every syncable entity's upserts and tombstones since `since`, in one
/// shot. Entities with no soft-delete lifecycle (activity, transcode jobs,
/// the singleton/natural-key stores) aren't part of delta sync and are
/// omitted.
#[derive(Debug, Clone, Default)]
pub struct DeltaSyncSnapshot {
    pub entities: HashMap<&'static str, EntityDelta>,
}

const SYNCABLE_ENTITIES: &[&str] = &[
    book::ENTITY,
    series::ENTITY,
    contributor::ENTITY,
    genre::ENTITY,
    tag::ENTITY,
    library::ENTITY,
    collection::ENTITY,
    shelf::ENTITY,
];

/// Builds a [`DeltaSyncSnapshot`] across every syncable entity in one write
/// transaction (the sync indexes are only ever read through `WriteTxCtx`, so
/// a read-only snapshot across all of them still has to go through
/// `write_retrying` rather than `Engine::read`).
pub fn delta_sync_snapshot(engine: &Engine, since: Timestamp) -> StoreResult<DeltaSyncSnapshot> {
    engine.write_retrying(|tx| {
        let mut entities = HashMap::new();
        for &entity in SYNCABLE_ENTITIES {
            let upserted_ids = syncindex::list_updated_after(tx, entity, since)?;
            let deleted_ids = syncindex::list_deleted_after(tx, entity, since)?;
            entities.insert(entity, EntityDelta { upserted_ids, deleted_ids });
        }
        Ok(DeltaSyncSnapshot { entities })
    })
}

/// Live primary-record counts per entity prefix, for a cheap "how big is
/// this database" checkpoint. Doesn't decode records, just counts primary
/// keys, so an undecodable record never makes this fail the way
/// `EntityTable::list` could for a typed caller.
pub fn checkpoint_counts(engine: &Engine) -> StoreResult<HashMap<&'static str, usize>> {
    let mut counts = HashMap::new();
    for &entity in ENTITY_PREFIXES {
        let prefix = entity_prefix(entity);
        let tx = engine.read()?;
        let count = tx
            .scan_prefix(&prefix)?
            .into_iter()
            .filter(|(key, _)| !is_index_key(&prefix, key))
            .count();
        counts.insert(entity, count);
    }
    Ok(counts)
}

/// Recomputes a user's aggregate listening stats from the authoritative
/// event log and playback states, overwriting whatever drift accumulated
/// from the best-effort incremental updates those stores normally apply.
/// Intended as an occasional reconciliation pass, not the steady-state write
/// path.
pub fn recompute_user_stats(
    events: &ListeningEventStore,
    progress: &PlaybackStateStore,
    stats: &UserStatsStore,
    user_id: &str,
) -> StoreResult<UserStats> {
    let total_listening_ms: i64 = events
        .list_for_user(user_id)?
        .iter()
        .map(|e| (e.end_position_ms - e.start_position_ms).max(0))
        .sum();

    let states = progress.list_for_user(user_id)?;
    let books_started = states.len() as i64;
    let books_completed = states.iter().filter(|s| s.is_finished).count() as i64;

    stats.update_with(user_id, move |s| {
        s.total_listening_ms = total_listening_ms;
        s.books_started = books_started;
        s.books_completed = books_completed;
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, TestClock};
    use crate::id::SequentialIdGenerator;
    use crate::models::Syncable;
    use crate::stores::tag::{Tag, TagStore};

    #[test]
    fn delta_sync_snapshot_reports_upserts_and_tombstones_since_checkpoint() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock = Arc::new(TestClock::new(Timestamp::from_millis(0)));
        let ids = Arc::new(SequentialIdGenerator::default());
        let tags = TagStore::new(engine.clone(), clock.clone() as Arc<dyn Clock>, ids);

        let mut before = Tag {
            id: String::new(),
            name: "Before".to_string(),
            slug: String::new(),
            sync: Syncable::new(Timestamp::ZERO),
        };
        tags.create(&mut before).unwrap();

        clock.advance(std::time::Duration::from_secs(10));
        let checkpoint = clock.now();

        clock.advance(std::time::Duration::from_secs(10));
        let mut after = Tag {
            id: String::new(),
            name: "After".to_string(),
            slug: String::new(),
            sync: Syncable::new(Timestamp::ZERO),
        };
        tags.create(&mut after).unwrap();
        tags.soft_delete(&before.id).unwrap();

        let snapshot = delta_sync_snapshot(&engine, checkpoint).unwrap();
        let tag_delta = &snapshot.entities[tag::ENTITY];
        assert!(tag_delta.upserted_ids.contains(&after.id));
        assert!(tag_delta.deleted_ids.contains(&before.id));
    }

    #[test]
    fn checkpoint_counts_reflects_live_records() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new(Timestamp::ZERO));
        let ids = Arc::new(SequentialIdGenerator::default());
        let tags = TagStore::new(engine.clone(), clock, ids);

        tags.create(&mut Tag {
            id: String::new(),
            name: "Fiction".to_string(),
            slug: String::new(),
            sync: Syncable::new(Timestamp::ZERO),
        })
        .unwrap();

        let counts = checkpoint_counts(&engine).unwrap();
        assert_eq!(counts[tag::ENTITY], 1);
    }
}
