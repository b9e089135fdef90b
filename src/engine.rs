//! KV Engine Facade: a thin wrapper over `redb`, the
//! embedded ordered KV engine. Every entity's primary records and indexes
//! live in one flat table (`KV_TABLE`) keyed by raw bytes — see
//! [`crate::keycodec`] for how those bytes are built.

use std::ops::Bound;
use std::path::Path;

use backon::{BlockingRetryable as _, ExponentialBuilder};
use redb::{ReadableTable as _, TableDefinition};
use tracing::warn;

use crate::error::{DbError, DbResult, StoreError, StoreResult};

pub const LOG_TARGET: &str = "bookvault::store::engine";

pub(crate) const KV_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");

/// Thin wrapper over a `redb::Database` handle, opened once per process (or
/// per test) and shared behind an `Arc` by [`crate::Store`].
#[derive(Debug)]
pub struct Engine {
    db: redb::Database,
}

impl Engine {
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let db = redb::Database::builder()
            .create(path)
            ?;
        Self::from_db(db)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let db = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            ?;
        Self::from_db(db)
    }

    fn from_db(db: redb::Database) -> DbResult<Self> {
        let engine = Self { db };
        let tx = engine.db.begin_write()?;
        {
            tx.open_table(KV_TABLE)?;
        }
        tx.commit()?;
        Ok(engine)
    }

    /// Close-time compaction.
    pub fn compact_and_close(mut self) -> DbResult<()> {
        let _ = self.db.compact();
        Ok(())
    }

    pub fn read(&self) -> DbResult<ReadTxCtx> {
        let dbtx = self.db.begin_read()?;
        Ok(ReadTxCtx { dbtx })
    }

    /// Begins a write transaction, retrying on transient commit conflicts
    /// with bounded exponential backoff. Callers operate in [`StoreResult`]
    /// throughout; a commit conflict surfaces through the closure as
    /// [`StoreError::Conflict`] (via `DbError`'s `From` conversion) and is
    /// the only condition this loop retries.
    pub fn write_retrying<T>(
        &self,
        mut f: impl FnMut(&WriteTxCtx) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let attempt = || -> StoreResult<T> {
            let dbtx = self.db.begin_write().map_err(DbError::from)?;
            let ctx = WriteTxCtx::from(dbtx);
            let result = f(&ctx)?;
            ctx.commit()?;
            Ok(result)
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(std::time::Duration::from_millis(5))
            .with_max_delay(std::time::Duration::from_millis(40))
            .with_max_times(3);

        attempt
            .retry(backoff)
            .when(|e| matches!(e, StoreError::Conflict { .. }))
            .notify(|err, dur| {
                warn!(target: LOG_TARGET, err = %err, delay_ms = dur.as_millis(), "retrying write transaction after conflict");
            })
            .call()
    }
}

/// Read-only transaction handle. Reads that must observe a single consistent
/// snapshot across multiple lookups share one of these.
pub struct ReadTxCtx {
    dbtx: redb::ReadTransaction,
}

impl ReadTxCtx {
    fn table(&self) -> DbResult<impl redb::ReadableTable<&'static [u8], &'static [u8]> + '_> {
        Ok(self.dbtx.open_table(KV_TABLE)?)
    }

    pub fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let table = self.table()?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    /// Scans every key with the given prefix, in ascending order.
    pub fn scan_prefix(&self, prefix: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = self.table()?;
        let (lower, upper) = crate::keycodec::prefix_range(prefix);
        let bounds = match &upper {
            Some(upper) => (Bound::Included(lower.as_slice()), Bound::Excluded(upper.as_slice())),
            None => (Bound::Included(lower.as_slice()), Bound::Unbounded),
        };
        let mut out = Vec::new();
        for entry in table.range::<&[u8]>(bounds)? {
            let (k, v) = entry?;
            out.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }

    /// Scans keys in the explicit half-open byte range `[lower, upper)`,
    /// ascending. Used by time-range queries.
    pub fn scan_range(&self, lower: &[u8], upper: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = self.table()?;
        let mut out = Vec::new();
        for entry in table
            .range::<&[u8]>((Bound::Included(lower), Bound::Excluded(upper)))
            ?
        {
            let (k, v) = entry?;
            out.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }

    /// Scans a prefix in descending order starting at (and including) the
    /// byte string `from_incl`, stopping once `prefix` no longer matches.
    /// Used for reverse-chronological feeds built on inverted timestamps.
    pub fn scan_prefix_from_rev(&self, prefix: &[u8], from_incl: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = self.table()?;
        let mut out = Vec::new();
        for entry in table
            .range::<&[u8]>((Bound::Included(prefix), Bound::Included(from_incl)))
            ?
            .rev()
        {
            let (k, v) = entry?;
            out.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }
}

/// Write transaction handle with post-commit hooks.
///
/// Mirrors `redb`'s transaction lifecycle: operations register
/// fire-and-forget callbacks (event emission, async search indexing) via
/// [`WriteTxCtx::on_commit`] that run strictly after `commit()` succeeds,
/// never inside the transaction.
pub struct WriteTxCtx {
    dbtx: redb::WriteTransaction,
    on_commit: std::sync::Mutex<Vec<Box<dyn FnOnce() + Send + 'static>>>,
}

impl From<redb::WriteTransaction> for WriteTxCtx {
    fn from(dbtx: redb::WriteTransaction) -> Self {
        Self {
            dbtx,
            on_commit: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl WriteTxCtx {
    pub fn on_commit(&self, f: impl FnOnce() + Send + 'static) {
        self.on_commit
            .lock()
            .expect("on_commit hooks poisoned")
            .push(Box::new(f));
    }

    fn commit(self) -> DbResult<()> {
        let Self { dbtx, on_commit } = self;
        dbtx.commit()?;
        for hook in on_commit.lock().expect("on_commit hooks poisoned").drain(..) {
            hook();
        }
        Ok(())
    }

    fn table(&self) -> DbResult<redb::Table<'_, &'static [u8], &'static [u8]>> {
        Ok(self.dbtx.open_table(KV_TABLE)?)
    }

    pub fn get(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let table = self.table()?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        let mut table = self.table()?;
        table.insert(key, value)?;
        Ok(())
    }

    /// Returns `true` if the key existed.
    pub fn delete(&self, key: &[u8]) -> DbResult<bool> {
        let mut table = self.table()?;
        let existed = table.remove(key)?.is_some();
        Ok(existed)
    }

    pub fn exists(&self, key: &[u8]) -> DbResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = self.table()?;
        let (lower, upper) = crate::keycodec::prefix_range(prefix);
        let bounds = match &upper {
            Some(upper) => (Bound::Included(lower.as_slice()), Bound::Excluded(upper.as_slice())),
            None => (Bound::Included(lower.as_slice()), Bound::Unbounded),
        };
        let mut out = Vec::new();
        for entry in table.range::<&[u8]>(bounds)? {
            let (k, v) = entry?;
            out.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }

    /// Scans keys in the explicit half-open byte range `[lower, upper)`,
    /// ascending. Used by time-range queries.
    pub fn scan_range(&self, lower: &[u8], upper: &[u8]) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = self.table()?;
        let mut out = Vec::new();
        for entry in table.range::<&[u8]>((Bound::Included(lower), Bound::Excluded(upper)))? {
            let (k, v) = entry?;
            out.push((k.value().to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }

    /// Deletes every key under `prefix`. Used by cascades and
    /// `ClearAllData`.
    pub fn delete_prefix(&self, prefix: &[u8]) -> DbResult<usize> {
        let keys: Vec<Vec<u8>> = self.scan_prefix(prefix)?.into_iter().map(|(k, _)| k).collect();
        let mut table = self.table()?;
        let mut n = 0;
        for k in keys {
            if table.remove(k.as_slice())?.is_some() {
                n += 1;
            }
        }
        Ok(n)
    }
}
