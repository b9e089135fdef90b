//! Cursor-based pagination.
//!
//! Modeled on a `paginate_table`/`paginate_table_rev`-style family
//! (`paginate.rs`): collect up to `limit` items from a range scan, and
//! report whether more remain by peeking one step further.

use crate::engine::{ReadTxCtx, WriteTxCtx};
use crate::error::StoreResult;
use crate::keycodec::{decode_cursor, encode_cursor, prefix_range};

/// Default and maximum page sizes.
pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

impl PageRequest {
    pub fn normalized_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Scans the prefix `entity_prefix`, decoding each non-index primary record
/// with `decode`, skipping soft-deleted records unless `include_deleted`,
/// and collecting up to `limit` items. After filling the page it peeks
/// forward (skipping soft-deleted entries) to determine `has_more` without
/// including that item in the page.
pub fn paginate_prefix<T>(
    tx: &WriteTxCtx,
    prefix: &[u8],
    request: &PageRequest,
    is_index_entry: impl Fn(&[u8]) -> bool,
    decode: impl Fn(&[u8]) -> StoreResult<Option<T>>,
    is_deleted: impl Fn(&T) -> bool,
) -> StoreResult<Page<T>> {
    let limit = request.normalized_limit();
    let cursor_key = match &request.cursor {
        Some(c) if !c.is_empty() => Some(decode_cursor(c)?),
        _ => None,
    };

    let (lower, upper) = prefix_range(prefix);
    let start = cursor_key.unwrap_or(lower);

    let entries = if let Some(upper) = upper {
        tx.scan_prefix(prefix)?
            .into_iter()
            .filter(|(k, _)| k.as_slice() >= start.as_slice() && k.as_slice() < upper.as_slice())
            .collect::<Vec<_>>()
    } else {
        tx.scan_prefix(prefix)?
            .into_iter()
            .filter(|(k, _)| k.as_slice() >= start.as_slice())
            .collect::<Vec<_>>()
    };

    let mut items = Vec::new();
    let mut last_key: Option<Vec<u8>> = None;
    let mut has_more = false;

    for (key, value) in entries {
        if is_index_entry(&key) {
            continue;
        }
        if items.len() >= limit {
            // Peek: is there at least one more non-deleted item?
            if let Some(record) = decode(&value)? {
                if !is_deleted(&record) {
                    has_more = true;
                    break;
                }
            }
            continue;
        }
        let Some(record) = decode(&value)? else { continue };
        if is_deleted(&record) {
            continue;
        }
        last_key = Some(key);
        items.push(record);
    }

    let next_cursor = if has_more {
        last_key.map(|k| encode_cursor(&k))
    } else {
        None
    };

    Ok(Page {
        items,
        next_cursor,
        has_more,
    })
}

/// Read-only variant of [`paginate_prefix`], used by derived views that only
/// need a read transaction.
pub fn paginate_prefix_read<T>(
    tx: &ReadTxCtx,
    prefix: &[u8],
    request: &PageRequest,
    is_index_entry: impl Fn(&[u8]) -> bool,
    decode: impl Fn(&[u8]) -> StoreResult<Option<T>>,
    is_deleted: impl Fn(&T) -> bool,
) -> StoreResult<Page<T>> {
    let limit = request.normalized_limit();
    let cursor_key = match &request.cursor {
        Some(c) if !c.is_empty() => Some(decode_cursor(c)?),
        _ => None,
    };
    let (lower, _upper) = prefix_range(prefix);
    let start = cursor_key.unwrap_or(lower);

    let entries: Vec<_> = tx
        .scan_prefix(prefix)?
        .into_iter()
        .filter(|(k, _)| k.as_slice() >= start.as_slice())
        .collect();

    let mut items = Vec::new();
    let mut last_key: Option<Vec<u8>> = None;
    let mut has_more = false;

    for (key, value) in entries {
        if is_index_entry(&key) {
            continue;
        }
        if items.len() >= limit {
            if let Some(record) = decode(&value)? {
                if !is_deleted(&record) {
                    has_more = true;
                    break;
                }
            }
            continue;
        }
        let Some(record) = decode(&value)? else { continue };
        if is_deleted(&record) {
            continue;
        }
        last_key = Some(key);
        items.push(record);
    }

    let next_cursor = if has_more {
        last_key.map(|k| encode_cursor(&k))
    } else {
        None
    };

    Ok(Page {
        items,
        next_cursor,
        has_more,
    })
}

#[cfg(test)]
mod tests;
