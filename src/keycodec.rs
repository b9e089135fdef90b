//! Key layout, timestamp encodings, and pagination cursors.
//!
//! All primary and index keys for every entity live in one flat ordered
//! keyspace (see [`crate::engine`]). This module is the single place that
//! knows how to turn structured lookups into the byte strings that make up
//! that keyspace, and back.
//!
//! Key layout:
//! - primary: `<entity>:<id>`
//! - index:   `<entity>:idx:<index_name>:<value>[:<id>]`
//!
//! A handful of indexes persisted before this naming scheme settled use
//! `idx:<plural>:<field>:…` instead of `<entity>:idx:…`; those are only ever
//! *read* here (never written), tolerated for backward compatibility with
//! already-persisted data.

use data_encoding::BASE64URL_NOPAD;

use crate::error::{DbError, InvalidCursorSnafu};

/// Reserved marker segment distinguishing index keys from primary keys.
/// `list()` and the backup streamers skip any key whose suffix begins with
/// this segment.
pub const IDX_MARKER: &str = "idx";

/// Joins key segments with `:`, the composite-key separator used throughout
/// the persisted keyspace.
pub fn build_key(segments: &[&str]) -> Vec<u8> {
    segments.join(":").into_bytes()
}

/// Primary key for an entity record: `<entity>:<id>`.
pub fn primary_key(entity: &str, id: &str) -> Vec<u8> {
    build_key(&[entity, id])
}

/// Prefix covering every key belonging to an entity (primary and index).
pub fn entity_prefix(entity: &str) -> Vec<u8> {
    let mut p = entity.as_bytes().to_vec();
    p.push(b':');
    p
}

/// Unique-index key: `<entity>:idx:<index_name>:<value>`.
pub fn index_key(entity: &str, index_name: &str, value: &str) -> Vec<u8> {
    build_key(&[entity, IDX_MARKER, index_name, value])
}

/// Multi-valued (reverse) index key: `<entity>:idx:<index_name>:<value>:<id>`.
pub fn index_member_key(entity: &str, index_name: &str, value: &str, id: &str) -> Vec<u8> {
    build_key(&[entity, IDX_MARKER, index_name, value, id])
}

/// Prefix covering every member of a multi-valued index for a given value:
/// `<entity>:idx:<index_name>:<value>:`.
pub fn index_member_prefix(entity: &str, index_name: &str, value: &str) -> Vec<u8> {
    let mut p = index_key(entity, index_name, value);
    p.push(b':');
    p
}

/// Returns the byte range `[prefix, prefix_upper)` covering every key that
/// starts with `prefix`. `redb` ranges are half-open over `&[u8]`, so the
/// upper bound is `prefix` with its last byte incremented (carrying as
/// needed); `None` only for the pathological all-`0xff` prefix, in which
/// case the range is unbounded above.
pub fn prefix_range(prefix: &[u8]) -> (Vec<u8>, Option<Vec<u8>>) {
    let mut upper = prefix.to_vec();
    for i in (0..upper.len()).rev() {
        if upper[i] != 0xff {
            upper[i] += 1;
            upper.truncate(i + 1);
            return (prefix.to_vec(), Some(upper));
        }
    }
    (prefix.to_vec(), None)
}

/// `true` if `key`, stripped of `prefix`, begins with the `idx:` marker
/// segment — i.e. it is an index entry, not a primary record.
pub fn is_index_key(prefix: &[u8], key: &[u8]) -> bool {
    key.len() > prefix.len() && key[prefix.len()..].starts_with(format!("{IDX_MARKER}:").as_bytes())
}

// ---------------------------------------------------------------------
// Timestamp encodings
// ---------------------------------------------------------------------

/// `i64::MAX`, the basis for inverted-timestamp encoding.
const MAX_I64: i64 = i64::MAX;

/// 19-digit zero-padded decimal of `(i64::MAX - nanos_since_epoch)`.
///
/// Lexicographic ascending order of this string equals chronological
/// descending order, so a forward range scan over keys built from it yields
/// newest-first (used by the activity feed).
pub fn inverted_nanos(nanos_since_epoch: i64) -> String {
    format!("{:019}", MAX_I64 - nanos_since_epoch)
}

/// Inverse of [`inverted_nanos`].
pub fn decode_inverted_nanos(s: &str) -> Option<i64> {
    let inverted: i64 = s.parse().ok()?;
    Some(MAX_I64 - inverted)
}

/// 20-digit zero-padded decimal of milliseconds since epoch. Forward scans
/// over keys built from it are chronologically ascending (used by
/// ListeningEvent and `updated_at`-style sync indexes).
pub fn forward_millis(millis_since_epoch: i64) -> String {
    format!("{millis_since_epoch:020}")
}

pub fn decode_forward_millis(s: &str) -> Option<i64> {
    s.parse().ok()
}

// ---------------------------------------------------------------------
// Pagination cursors
// ---------------------------------------------------------------------

/// Opaque pagination cursor: base64url of the last-emitted primary key.
/// An absent/empty cursor means "begin at the start of the prefix".
pub fn encode_cursor(last_key: &[u8]) -> String {
    BASE64URL_NOPAD.encode(last_key)
}

pub fn decode_cursor(cursor: &str) -> Result<Vec<u8>, DbError> {
    if cursor.is_empty() {
        return Ok(Vec::new());
    }
    BASE64URL_NOPAD
        .decode(cursor.as_bytes())
        .map_err(|_| InvalidCursorSnafu.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_nanos_sorts_descending() {
        let t1 = inverted_nanos(1_000);
        let t2 = inverted_nanos(2_000);
        let t3 = inverted_nanos(3_000);
        let mut sorted = vec![t3.clone(), t1.clone(), t2.clone()];
        sorted.sort();
        // ascending lexicographic order of the encoded strings is
        // descending chronological order
        assert_eq!(sorted, vec![t3, t2, t1]);
    }

    #[test]
    fn inverted_nanos_roundtrip() {
        let nanos = 1_730_000_000_123_456_789i64;
        let encoded = inverted_nanos(nanos);
        assert_eq!(encoded.len(), 19);
        assert_eq!(decode_inverted_nanos(&encoded), Some(nanos));
    }

    #[test]
    fn forward_millis_sorts_ascending() {
        let m1 = forward_millis(1_000);
        let m2 = forward_millis(2_000);
        assert!(m1 < m2);
        assert_eq!(m1.len(), 20);
    }

    #[test]
    fn cursor_roundtrip() {
        let key = primary_key("book", "book-0123456789abcdefghi");
        let cursor = encode_cursor(&key);
        assert_eq!(decode_cursor(&cursor).unwrap(), key);
    }

    #[test]
    fn empty_cursor_means_begin() {
        assert_eq!(decode_cursor("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn malformed_cursor_is_invalid_input() {
        assert!(decode_cursor("not base64url!!").is_err());
    }

    #[test]
    fn is_index_key_detects_idx_marker() {
        let prefix = entity_prefix("book");
        let primary = primary_key("book", "book-1");
        let idx = index_key("book", "path", "/a/b");
        assert!(!is_index_key(&prefix, &primary));
        assert!(is_index_key(&prefix, &idx));
    }

    #[test]
    fn prefix_range_increments_last_byte() {
        let (lower, upper) = prefix_range(b"book:");
        assert_eq!(lower, b"book:");
        assert_eq!(upper.unwrap(), b"book;");
    }
}
