//! TranscodeJob: one per (audio_file, variant), scanned by status and
//! drained by priority.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
#[cfg(test)]
use crate::clock::Timestamp;
use crate::engine::{Engine, WriteTxCtx};
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::{StoreError, StoreResult};
use crate::id::IdGenerator;
use crate::keycodec::build_key;
use crate::models::{Syncable, TranscodeStatus};

pub const ENTITY: &str = "transcode";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeJob {
    pub id: String,
    pub book_id: String,
    pub audio_file_id: String,
    pub variant: String,
    pub status: TranscodeStatus,
    pub priority: i32,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for TranscodeJob {
    fn id(&self) -> &str {
        &self.id
    }
}

static TRANSCODE_INDEXES: &[IndexDef<TranscodeJob>] = &[];

const TABLE: EntityTable<TranscodeJob> = EntityTable {
    entity: ENTITY,
    indexes: TRANSCODE_INDEXES,
};

fn by_book_key(bid: &str, id: &str) -> Vec<u8> {
    build_key(&[ENTITY, "idx", "book", bid, id])
}
fn by_book_prefix(bid: &str) -> Vec<u8> {
    let mut p = by_book_key(bid, "");
    p.pop();
    p
}
fn by_audiofile_variant_key(afid: &str, variant: &str) -> Vec<u8> {
    build_key(&[ENTITY, "idx", "audiofile", afid, variant])
}
fn by_audiofile_prefix(afid: &str) -> Vec<u8> {
    let mut p = build_key(&[ENTITY, "idx", "audiofile", afid, ""]);
    p.pop();
    p
}
fn by_status_key(status: TranscodeStatus, id: &str) -> Vec<u8> {
    build_key(&[ENTITY, "idx", "status", &status.to_string(), id])
}
fn by_status_prefix(status: TranscodeStatus) -> Vec<u8> {
    let mut p = by_status_key(status, "");
    p.pop();
    p
}

pub struct TranscodeJobStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl TranscodeJobStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, job: &mut TranscodeJob) -> StoreResult<()> {
        if job.id.is_empty() {
            job.id = self.ids.generate(crate::models::TranscodeJobId::TYPE_PREFIX);
        }
        job.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| {
            let unique_key = by_audiofile_variant_key(&job.audio_file_id, &job.variant);
            if tx.exists(&unique_key)? {
                return Err(StoreError::already_exists(ENTITY, format!("{}:{}", job.audio_file_id, job.variant)));
            }
            TABLE.create(tx, job)?;
            tx.set(&unique_key, job.id.as_bytes())?;
            tx.set(&by_book_key(&job.book_id, &job.id), job.id.as_bytes())?;
            tx.set(&by_status_key(job.status, &job.id), job.id.as_bytes())?;
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> StoreResult<TranscodeJob> {
        self.engine.write_retrying(|tx| TABLE.get_or_not_found(tx, id))
    }

    pub fn get_by_audio_file(&self, audio_file_id: &str) -> StoreResult<Option<TranscodeJob>> {
        self.engine.write_retrying(|tx| {
            let Some((_, id_bytes)) = tx.scan_prefix(&by_audiofile_prefix(audio_file_id))?.into_iter().next() else {
                return Ok(None);
            };
            TABLE.get(tx, &String::from_utf8_lossy(&id_bytes))
        })
    }

    pub fn get_by_audio_file_and_variant(&self, audio_file_id: &str, variant: &str) -> StoreResult<Option<TranscodeJob>> {
        self.engine.write_retrying(|tx| {
            let Some(id_bytes) = tx.get(&by_audiofile_variant_key(audio_file_id, variant))? else {
                return Ok(None);
            };
            TABLE.get(tx, &String::from_utf8_lossy(&id_bytes))
        })
    }

    fn update_tx(&self, tx: &WriteTxCtx, job: &TranscodeJob) -> StoreResult<()> {
        let old = TABLE.get_or_not_found(tx, &job.id)?;
        TABLE.update(tx, job)?;
        if old.status != job.status {
            tx.delete(&by_status_key(old.status, &job.id))?;
            tx.set(&by_status_key(job.status, &job.id), job.id.as_bytes())?;
        }
        if old.audio_file_id != job.audio_file_id || old.variant != job.variant {
            tx.delete(&by_audiofile_variant_key(&old.audio_file_id, &old.variant))?;
            tx.set(&by_audiofile_variant_key(&job.audio_file_id, &job.variant), job.id.as_bytes())?;
        }
        if old.book_id != job.book_id {
            tx.delete(&by_book_key(&old.book_id, &job.id))?;
            tx.set(&by_book_key(&job.book_id, &job.id), job.id.as_bytes())?;
        }
        Ok(())
    }

    pub fn update(&self, job: &mut TranscodeJob) -> StoreResult<()> {
        job.sync.touch(self.clock.now());
        self.engine.write_retrying(|tx| self.update_tx(tx, job))
    }

    /// Every job with `status == Pending`, sorted by `priority` descending.
    /// Ties break by `id` ascending — an arbitrary but deterministic and
    /// stable secondary key, since insertion order isn't tracked separately
    /// from `created_at`.
    pub fn list_pending(&self) -> StoreResult<Vec<TranscodeJob>> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&by_status_prefix(TranscodeStatus::Pending))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            let mut jobs: Vec<TranscodeJob> = ids.into_iter().filter_map(|id| TABLE.get(tx, &id).transpose()).collect::<StoreResult<Vec<_>>>()?;
            jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
            Ok(jobs)
        })
    }

    pub fn list_for_book(&self, book_id: &str) -> StoreResult<Vec<TranscodeJob>> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&by_book_prefix(book_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            ids.into_iter().filter_map(|id| TABLE.get(tx, &id).transpose()).collect()
        })
    }

    pub fn delete_for_book(&self, book_id: &str) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&by_book_prefix(book_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            for id in ids {
                if let Some(job) = TABLE.get(tx, &id)? {
                    tx.delete(&by_audiofile_variant_key(&job.audio_file_id, &job.variant))?;
                    tx.delete(&by_book_key(&job.book_id, &job.id))?;
                    tx.delete(&by_status_key(job.status, &job.id))?;
                    TABLE.delete(tx, &job.id)?;
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

    fn store() -> TranscodeJobStore {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock = Arc::new(TestClock::new(Timestamp::ZERO));
        let ids = Arc::new(SequentialIdGenerator::default());
        TranscodeJobStore::new(engine, clock, ids)
    }

    fn job(variant: &str, priority: i32) -> TranscodeJob {
        TranscodeJob {
            id: String::new(),
            book_id: "book-1".to_string(),
            audio_file_id: "afile-1".to_string(),
            variant: variant.to_string(),
            status: TranscodeStatus::Pending,
            priority,
            sync: Syncable::new(Timestamp::ZERO),
        }
    }

    #[test]
    fn pending_list_sorted_by_priority_descending() {
        let store = store();
        for (variant, priority) in [("a", 3), ("b", 1), ("c", 4), ("d", 2)] {
            store.create(&mut job(variant, priority)).unwrap();
        }
        let pending = store.list_pending().unwrap();
        let priorities: Vec<i32> = pending.iter().map(|j| j.priority).collect();
        assert_eq!(priorities, vec![4, 3, 2, 1]);
    }

    #[test]
    fn unique_audio_file_variant_pair_rejects_duplicate() {
        let store = store();
        store.create(&mut job("lofi", 1)).unwrap();
        let err = store.create(&mut job("lofi", 2));
        assert!(matches!(err, Err(StoreError::AlreadyExists { .. })));
    }

    #[test]
    fn non_pending_jobs_excluded_from_pending_list() {
        let store = store();
        let mut j = job("a", 5);
        store.create(&mut j).unwrap();
        j.status = TranscodeStatus::Running;
        store.update(&mut j).unwrap();
        assert!(store.list_pending().unwrap().is_empty());
    }
}
