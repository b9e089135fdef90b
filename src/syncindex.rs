//! Shared `updated_at`/`deleted_at` delta-sync indexes.
//!
//! Nearly every entity needs the same pair of time-ordered indexes so a
//! client can ask "what changed since t0" and "what was removed since t0".
//! Keyed by RFC3339Nano string (fixed-width components sort lexicographically
//! in chronological order) rather than the inverted/forward-millis encodings
//! used by the feed-style indexes in [`crate::keycodec`] — those are read
//! forward for ascending delta scans, never as a top-K/recency query.

use crate::clock::Timestamp;
use crate::engine::WriteTxCtx;
use crate::error::StoreResult;
use crate::keycodec::build_key;

fn updated_key(entity: &str, ts: Timestamp, id: &str) -> Vec<u8> {
    build_key(&[entity, "idx", "updated", &ts.to_rfc3339_nanos(), id])
}

fn deleted_key(entity: &str, ts: Timestamp, id: &str) -> Vec<u8> {
    build_key(&[entity, "idx", "deleted", &ts.to_rfc3339_nanos(), id])
}

/// Moves the `updated_at` index entry from `old_updated` (if any) to
/// `new_updated`. Called on both create (`old_updated = None`) and update.
pub fn touch_updated(
    tx: &WriteTxCtx,
    entity: &str,
    id: &str,
    old_updated: Option<Timestamp>,
    new_updated: Timestamp,
) -> StoreResult<()> {
    if let Some(old) = old_updated {
        tx.delete(&updated_key(entity, old, id))?;
    }
    tx.set(&updated_key(entity, new_updated, id), id.as_bytes())?;
    Ok(())
}

/// Records a tombstone in the `deleted_at` index. Left in place permanently
/// (delta-sync clients rely on it staying queryable).
pub fn record_deleted(tx: &WriteTxCtx, entity: &str, id: &str, deleted_at: Timestamp) -> StoreResult<()> {
    tx.set(&deleted_key(entity, deleted_at, id), id.as_bytes())?;
    Ok(())
}

/// Removes every sync-index trace of a record (used when a record is
/// hard-deleted rather than soft-deleted, e.g. cascades).
pub fn remove_all(tx: &WriteTxCtx, entity: &str, id: &str, updated_at: Timestamp, deleted_at: Option<Timestamp>) -> StoreResult<()> {
    tx.delete(&updated_key(entity, updated_at, id))?;
    if let Some(d) = deleted_at {
        tx.delete(&deleted_key(entity, d, id))?;
    }
    Ok(())
}

fn list_after(tx: &WriteTxCtx, entity: &str, marker: &str, since: Timestamp) -> StoreResult<Vec<String>> {
    let prefix = build_key(&[entity, "idx", marker]);
    let since_str = since.to_rfc3339_nanos();
    let mut out = Vec::new();
    for (key, value) in tx.scan_prefix(&prefix)? {
        let rest = &key[prefix.len() + 1..];
        let rest_str = String::from_utf8_lossy(rest);
        let Some((ts_part, _id_part)) = rest_str.split_once(':') else {
            continue;
        };
        if ts_part > since_str.as_str() {
            out.push(String::from_utf8_lossy(&value).into_owned());
        }
    }
    Ok(out)
}

/// IDs of records whose `updated_at` is strictly greater than `since`
/// (upsert half of delta sync).
pub fn list_updated_after(tx: &WriteTxCtx, entity: &str, since: Timestamp) -> StoreResult<Vec<String>> {
    list_after(tx, entity, "updated", since)
}

/// IDs tombstoned (soft-deleted) strictly after `since` (delete half of
/// delta sync).
pub fn list_deleted_after(tx: &WriteTxCtx, entity: &str, since: Timestamp) -> StoreResult<Vec<String>> {
    list_after(tx, entity, "deleted", since)
}
