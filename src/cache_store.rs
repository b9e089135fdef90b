//! Bounded TTL caches for externally-fetched metadata, keyed by
//! `(region, identifier)`. The fetch itself (hitting a metadata provider) is
//! out of scope here — this module only remembers the last fetched result
//! long enough to avoid re-fetching it.
//!
//! Three caches share one shape (`fetched_at` + payload, expired-as-miss)
//! but differ in TTL and key: book metadata and chapter lists are keyed by
//! `(region, asin)`, search results by `(region, sha256_prefix16(query))`
//! so an arbitrarily long query string never ends up as a key segment.

use std::sync::Arc;
use std::time::Duration;

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::{Clock, Timestamp};
use crate::engine::Engine;
use crate::error::StoreResult;
use crate::keycodec::build_key;

const BOOK_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const CHAPTERS_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const SEARCH_TTL: Duration = Duration::from_secs(24 * 3600);

/// A cached payload plus the time it was fetched. Expiry is checked against
/// the envelope's TTL at read time; an expired envelope is never deleted
/// here, only treated as absent — whoever refetches overwrites it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEnvelope<T> {
    fetched_at: Timestamp,
    payload: T,
}

impl<T> CacheEnvelope<T> {
    fn is_expired(&self, now: Timestamp, ttl: Duration) -> bool {
        let age_nanos = now.as_nanos().saturating_sub(self.fetched_at.as_nanos());
        age_nanos > ttl.as_nanos() as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedBookMetadata {
    pub title: String,
    pub authors: Vec<String>,
    pub narrators: Vec<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedChapter {
    pub title: String,
    pub start_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedChapterList {
    pub chapters: Vec<CachedChapter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSearchResult {
    pub asin: String,
    pub title: String,
    pub authors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSearchResults {
    pub results: Vec<CachedSearchResult>,
}

/// Truncated hex-SHA256 of `query`, short enough to keep a composite cache
/// key bounded regardless of how long the original query string was.
pub fn sha256_prefix16(query: &str) -> String {
    let digest = Sha256::digest(query.as_bytes());
    HEXLOWER.encode(&digest)[..16].to_string()
}

fn book_key(region: &str, asin: &str) -> Vec<u8> {
    build_key(&["metadata", "book", region, asin])
}

fn chapters_key(region: &str, asin: &str) -> Vec<u8> {
    build_key(&["metadata", "chapters", region, asin])
}

fn search_key(region: &str, query_hash: &str) -> Vec<u8> {
    build_key(&["metadata", "search", region, query_hash])
}

pub struct CacheStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    fn get<T: serde::de::DeserializeOwned>(&self, key: &[u8], ttl: Duration) -> StoreResult<Option<T>> {
        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            let Some(bytes) = tx.get(key)? else {
                return Ok(None);
            };
            let envelope: CacheEnvelope<T> = match serde_json::from_slice(&bytes) {
                Ok(e) => e,
                Err(_) => return Ok(None),
            };
            if envelope.is_expired(now, ttl) {
                return Ok(None);
            }
            Ok(Some(envelope.payload))
        })
    }

    fn put<T: Serialize>(&self, key: &[u8], payload: &T) -> StoreResult<()> {
        let envelope = CacheEnvelope {
            fetched_at: self.clock.now(),
            payload,
        };
        let encoded = serde_json::to_vec(&envelope).map_err(|e| crate::error::StoreError::Internal { message: e.to_string() })?;
        self.engine.write_retrying(|tx| {
            tx.set(key, &encoded)?;
            Ok(())
        })
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            tx.delete(key)?;
            Ok(())
        })
    }

    pub fn get_book(&self, region: &str, asin: &str) -> StoreResult<Option<CachedBookMetadata>> {
        self.get(&book_key(region, asin), BOOK_TTL)
    }

    pub fn put_book(&self, region: &str, asin: &str, metadata: &CachedBookMetadata) -> StoreResult<()> {
        self.put(&book_key(region, asin), metadata)
    }

    pub fn delete_book(&self, region: &str, asin: &str) -> StoreResult<()> {
        self.delete(&book_key(region, asin))
    }

    pub fn get_chapters(&self, region: &str, asin: &str) -> StoreResult<Option<CachedChapterList>> {
        self.get(&chapters_key(region, asin), CHAPTERS_TTL)
    }

    pub fn put_chapters(&self, region: &str, asin: &str, chapters: &CachedChapterList) -> StoreResult<()> {
        self.put(&chapters_key(region, asin), chapters)
    }

    pub fn delete_chapters(&self, region: &str, asin: &str) -> StoreResult<()> {
        self.delete(&chapters_key(region, asin))
    }

    pub fn get_search(&self, region: &str, query: &str) -> StoreResult<Option<CachedSearchResults>> {
        self.get(&search_key(region, &sha256_prefix16(query)), SEARCH_TTL)
    }

    pub fn put_search(&self, region: &str, query: &str, results: &CachedSearchResults) -> StoreResult<()> {
        self.put(&search_key(region, &sha256_prefix16(query)), results)
    }

    pub fn delete_search(&self, region: &str, query: &str) -> StoreResult<()> {
        self.delete(&search_key(region, &sha256_prefix16(query)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn store_with_clock() -> (CacheStore, Arc<TestClock>) {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock = Arc::new(TestClock::new(Timestamp::ZERO));
        (CacheStore::new(engine, clock.clone()), clock)
    }

    fn book() -> CachedBookMetadata {
        CachedBookMetadata {
            title: "Example".to_string(),
            authors: vec!["A. Author".to_string()],
            narrators: vec!["N. Narrator".to_string()],
            description: None,
            cover_url: None,
            duration_ms: Some(3_600_000),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let (store, _clock) = store_with_clock();
        store.put_book("us", "ASIN1", &book()).unwrap();
        let found = store.get_book("us", "ASIN1").unwrap();
        assert_eq!(found.unwrap().title, "Example");
    }

    #[test]
    fn expired_entry_is_a_miss_not_an_error() {
        let (store, clock) = store_with_clock();
        store.put_book("us", "ASIN1", &book()).unwrap();
        clock.advance(BOOK_TTL + Duration::from_secs(1));
        assert!(store.get_book("us", "ASIN1").unwrap().is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let (store, _clock) = store_with_clock();
        store.delete_book("us", "missing").unwrap();
        store.put_book("us", "ASIN1", &book()).unwrap();
        store.delete_book("us", "ASIN1").unwrap();
        store.delete_book("us", "ASIN1").unwrap();
        assert!(store.get_book("us", "ASIN1").unwrap().is_none());
    }

    #[test]
    fn search_cache_is_keyed_by_query_hash() {
        let (store, _clock) = store_with_clock();
        let results = CachedSearchResults {
            results: vec![CachedSearchResult {
                asin: "ASIN1".to_string(),
                title: "Example".to_string(),
                authors: vec!["A. Author".to_string()],
            }],
        };
        store.put_search("us", "example query", &results).unwrap();
        let found = store.get_search("us", "example query").unwrap().unwrap();
        assert_eq!(found.results.len(), 1);
        assert!(store.get_search("us", "different query").unwrap().is_none());
    }
}
