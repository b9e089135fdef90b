//! Whole-database streaming and data-wipe support.
//!
//! [`stream`] hands back a lazy-looking iterator over every live record of
//! one entity, for export/backup jobs that want to walk the whole table
//! without holding a write transaction open for the duration.
//! [`clear_all_data`] is the blunt counterpart: drop every key belonging to
//! every known entity, for "reset this instance" tooling.

use std::sync::Arc;

use crate::engine::Engine;
use crate::entity::Record;
use crate::error::{CancellationToken, StoreError, StoreResult};
use crate::keycodec::{entity_prefix, is_index_key};

/// Every primary-record prefix the store manages, in no particular order.
/// Used by [`clear_all_data`] so a wipe never has to be kept in sync by hand
/// with whatever entities happen to exist — this list is the source of
/// truth for "what entities exist" at the storage layer.
pub const ENTITY_PREFIXES: &[&str] = &[
    "book",
    "series",
    "contributor",
    "genre",
    "tag",
    "library",
    "collection",
    "collection_share",
    "shelf",
    "activity",
    "listening_event",
    "progress",
    "bookprefs",
    "transcode_job",
    "session",
    "reading_session",
    "invite",
    "user_stats",
    "user_settings",
    "profile",
    "user_milestones",
    "instance",
    "server_settings",
    "metadata",
];

/// Deletes every key under every entry of [`ENTITY_PREFIXES`], each prefix
/// in its own retried write transaction so one oversized entity never forces
/// the whole wipe to retry from scratch on a conflict.
pub fn clear_all_data(engine: &Engine) -> StoreResult<()> {
    for prefix in ENTITY_PREFIXES {
        let key_prefix = entity_prefix(prefix);
        engine.write_retrying(|tx| {
            tx.delete_prefix(&key_prefix)?;
            Ok(())
        })?;
    }
    Ok(())
}

/// Lazily-decoded walk over one entity's live records in primary-key order.
///
/// The underlying scan is still eager at the storage layer (the engine
/// facade returns materialized `Vec`s, not a true cursor) but decoding is
/// deferred to `next()`, and every step checks `cancel` before decoding the
/// next item so a canceled export stops promptly instead of finishing a scan
/// already in flight.
pub struct EntityStream<T> {
    entity: &'static str,
    cancel: CancellationToken,
    remaining: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Record> EntityStream<T> {
    fn decode(bytes: &[u8]) -> StoreResult<T> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Internal { message: e.to_string() })
    }
}

impl<T: Record> Iterator for EntityStream<T> {
    type Item = StoreResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.cancel.check() {
            return Some(Err(e));
        }
        let prefix = entity_prefix(self.entity);
        loop {
            let (key, value) = self.remaining.next()?;
            if is_index_key(&prefix, &key) {
                continue;
            }
            return Some(Self::decode(&value));
        }
    }
}

/// Builds an [`EntityStream`] over every key under `entity`'s primary
/// prefix. `cancel` is checked once per yielded item.
pub fn stream<T: Record>(engine: &Arc<Engine>, entity: &'static str, cancel: CancellationToken) -> StoreResult<EntityStream<T>> {
    let prefix = entity_prefix(entity);
    let tx = engine.read()?;
    let entries = tx.scan_prefix(&prefix)?;
    Ok(EntityStream {
        entity,
        cancel,
        remaining: entries.into_iter(),
        _marker: std::marker::PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SystemClock};
    use crate::id::SequentialIdGenerator;
    use crate::models::Syncable;
    use crate::stores::tag::{Tag, TagStore};

    fn setup() -> (Arc<Engine>, TagStore) {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids = Arc::new(SequentialIdGenerator::default());
        let store = TagStore::new(engine.clone(), clock, ids);
        (engine, store)
    }

    fn new_tag(name: &str) -> Tag {
        Tag {
            id: String::new(),
            name: name.to_string(),
            slug: String::new(),
            sync: Syncable::new(crate::clock::Timestamp::ZERO),
        }
    }

    #[test]
    fn stream_yields_every_record_and_skips_index_entries() {
        let (engine, tags) = setup();
        tags.create(&mut new_tag("Fiction")).unwrap();
        tags.create(&mut new_tag("Nonfiction")).unwrap();

        let collected: Vec<Tag> = stream::<Tag>(&engine, "tag", CancellationToken::new())
            .unwrap()
            .collect::<StoreResult<Vec<_>>>()
            .unwrap();
        assert_eq!(collected.len(), 2);
    }

    #[test]
    fn stream_respects_cancellation() {
        let (engine, tags) = setup();
        tags.create(&mut new_tag("Fiction")).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut it = stream::<Tag>(&engine, "tag", cancel).unwrap();
        assert!(matches!(it.next(), Some(Err(StoreError::Canceled))));
    }

    #[test]
    fn clear_all_data_wipes_every_prefix() {
        let (engine, tags) = setup();
        tags.create(&mut new_tag("Fiction")).unwrap();
        clear_all_data(&engine).unwrap();
        let remaining: Vec<Tag> = stream::<Tag>(&engine, "tag", CancellationToken::new())
            .unwrap()
            .collect::<StoreResult<Vec<_>>>()
            .unwrap();
        assert!(remaining.is_empty());
    }
}
