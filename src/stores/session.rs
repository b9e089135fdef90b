//! Auth `Session`, `BookReadingSession`, and `Invite`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::engine::{Engine, WriteTxCtx};
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::{StoreError, StoreResult};
use crate::id::IdGenerator;
use crate::keycodec::build_key;
use crate::models::{user_book_key, Syncable};

// ---------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------

pub const SESSION_ENTITY: &str = "session";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub refresh_token_hash: String,
    pub expires_at: Timestamp,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Session {
    fn id(&self) -> &str {
        &self.id
    }
}

static SESSION_INDEXES: &[IndexDef<Session>] = &[IndexDef {
    name: "refresh_token_hash",
    key_values: |s| vec![s.refresh_token_hash.clone()],
    lookup_transform: None,
}];

const SESSION_TABLE: EntityTable<Session> = EntityTable {
    entity: SESSION_ENTITY,
    indexes: SESSION_INDEXES,
};

pub struct SessionStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl SessionStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, session: &mut Session) -> StoreResult<()> {
        if session.id.is_empty() {
            session.id = self.ids.generate(crate::models::SessionId::TYPE_PREFIX);
        }
        session.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| SESSION_TABLE.create(tx, session))
    }

    fn reject_if_expired(&self, session: Session) -> StoreResult<Session> {
        if session.expires_at <= self.clock.now() {
            return Err(StoreError::Expired {
                entity: SESSION_ENTITY,
                id: session.id,
            });
        }
        Ok(session)
    }

    pub fn get(&self, id: &str) -> StoreResult<Session> {
        let session = self.engine.write_retrying(|tx| SESSION_TABLE.get_or_not_found(tx, id))?;
        self.reject_if_expired(session)
    }

    pub fn get_by_refresh_token_hash(&self, hash: &str) -> StoreResult<Option<Session>> {
        let Some(session) = self.engine.write_retrying(|tx| SESSION_TABLE.get_by_index(tx, "refresh_token_hash", hash))? else {
            return Ok(None);
        };
        match self.reject_if_expired(session) {
            Ok(s) => Ok(Some(s)),
            Err(StoreError::Expired { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn delete(&self, id: &str) -> StoreResult<()> {
        self.engine.write_retrying(|tx| SESSION_TABLE.delete(tx, id))
    }
}

// ---------------------------------------------------------------------
// BookReadingSession
// ---------------------------------------------------------------------

pub const READING_SESSION_ENTITY: &str = "rsession";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookReadingSession {
    pub id: String,
    pub user_id: String,
    pub book_id: String,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

impl BookReadingSession {
    pub fn is_active(&self) -> bool {
        self.finished_at.is_none()
    }
}

impl Record for BookReadingSession {
    fn id(&self) -> &str {
        &self.id
    }
}

static READING_SESSION_INDEXES: &[IndexDef<BookReadingSession>] = &[];

const READING_SESSION_TABLE: EntityTable<BookReadingSession> = EntityTable {
    entity: READING_SESSION_ENTITY,
    indexes: READING_SESSION_INDEXES,
};

/// Marks the currently-active session for a (user, book) pair — the record
/// enforcing "at most one active session per (user, book)".
fn active_key(user_id: &str, book_id: &str) -> Vec<u8> {
    build_key(&[READING_SESSION_ENTITY, "idx", "active", &user_book_key(user_id, book_id)])
}

fn by_book_key(bid: &str, id: &str) -> Vec<u8> {
    build_key(&[READING_SESSION_ENTITY, "idx", "book", bid, id])
}
fn by_book_prefix(bid: &str) -> Vec<u8> {
    let mut p = by_book_key(bid, "");
    p.pop();
    p
}

pub struct ReadingSessionStore {
    engine: Arc<Engine>,
    ids: Arc<dyn IdGenerator>,
}

impl ReadingSessionStore {
    pub fn new(engine: Arc<Engine>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, ids }
    }

    /// Fails with `Conflict` if a session for this (user, book) is already
    /// active.
    pub fn start(&self, session: &mut BookReadingSession) -> StoreResult<()> {
        if session.id.is_empty() {
            session.id = self.ids.generate(crate::models::ReadingSessionId::TYPE_PREFIX);
        }
        session.finished_at = None;
        self.engine.write_retrying(|tx: &WriteTxCtx| {
            let key = active_key(&session.user_id, &session.book_id);
            if tx.exists(&key)? {
                return Err(StoreError::Conflict {
                    message: "a reading session is already active for this user and book".to_string(),
                });
            }
            READING_SESSION_TABLE.create(tx, session)?;
            tx.set(&key, session.id.as_bytes())?;
            tx.set(&by_book_key(&session.book_id, &session.id), session.id.as_bytes())?;
            Ok(())
        })
    }

    pub fn finish(&self, id: &str, finished_at: Timestamp) -> StoreResult<()> {
        self.engine.write_retrying(|tx| {
            let mut s = READING_SESSION_TABLE.get_or_not_found(tx, id)?;
            if s.finished_at.is_none() {
                s.finished_at = Some(finished_at);
                READING_SESSION_TABLE.update(tx, &s)?;
                tx.delete(&active_key(&s.user_id, &s.book_id))?;
            }
            Ok(())
        })
    }

    pub fn get_active(&self, user_id: &str, book_id: &str) -> StoreResult<Option<BookReadingSession>> {
        self.engine.write_retrying(|tx| {
            let Some(id_bytes) = tx.get(&active_key(user_id, book_id))? else {
                return Ok(None);
            };
            READING_SESSION_TABLE.get(tx, &String::from_utf8_lossy(&id_bytes))
        })
    }

    pub fn list_for_book(&self, book_id: &str) -> StoreResult<Vec<BookReadingSession>> {
        self.engine.write_retrying(|tx| {
            let ids: Vec<String> = tx
                .scan_prefix(&by_book_prefix(book_id))?
                .into_iter()
                .map(|(_, v)| String::from_utf8_lossy(&v).into_owned())
                .collect();
            ids.into_iter().filter_map(|id| READING_SESSION_TABLE.get(tx, &id).transpose()).collect()
        })
    }
}

// ---------------------------------------------------------------------
// Invite
// ---------------------------------------------------------------------

pub const INVITE_ENTITY: &str = "invite";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub id: String,
    pub code: String,
    pub created_by: String,
    pub expires_at: Option<Timestamp>,
    pub used_at: Option<Timestamp>,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Invite {
    fn id(&self) -> &str {
        &self.id
    }
}

static INVITE_INDEXES: &[IndexDef<Invite>] = &[IndexDef {
    name: "code",
    key_values: |i| vec![i.code.clone()],
    lookup_transform: None,
}];

const INVITE_TABLE: EntityTable<Invite> = EntityTable {
    entity: INVITE_ENTITY,
    indexes: INVITE_INDEXES,
};

pub struct InviteStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InviteStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { engine, clock, ids }
    }

    pub fn create(&self, invite: &mut Invite) -> StoreResult<()> {
        if invite.id.is_empty() {
            invite.id = self.ids.generate(crate::models::InviteId::TYPE_PREFIX);
        }
        invite.sync = Syncable::new(self.clock.now());
        self.engine.write_retrying(|tx| INVITE_TABLE.create(tx, invite))
    }

    pub fn get_by_code(&self, code: &str) -> StoreResult<Option<Invite>> {
        self.engine.write_retrying(|tx| INVITE_TABLE.get_by_index(tx, "code", code))
    }

    pub fn mark_used(&self, id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        self.engine.write_retrying(|tx| {
            let mut invite = INVITE_TABLE.get_or_not_found(tx, id)?;
            invite.used_at = Some(now);
            INVITE_TABLE.update(tx, &invite)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::id::SequentialIdGenerator;

    #[test]
    fn session_get_rejects_expired() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock = Arc::new(TestClock::new(Timestamp::ZERO));
        let ids = Arc::new(SequentialIdGenerator::default());
        let store = SessionStore::new(engine, clock.clone(), ids);

        let mut session = Session {
            id: String::new(),
            user_id: "user-1".to_string(),
            refresh_token_hash: "hash-1".to_string(),
            expires_at: Timestamp::from_millis(1_000),
            sync: Syncable::new(Timestamp::ZERO),
        };
        store.create(&mut session).unwrap();

        clock.set(Timestamp::from_millis(2_000));
        let err = store.get(&session.id);
        assert!(matches!(err, Err(StoreError::Expired { .. })));
    }

    #[test]
    fn reading_session_rejects_second_active() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let ids = Arc::new(SequentialIdGenerator::default());
        let store = ReadingSessionStore::new(engine, ids);

        let mut first = BookReadingSession {
            id: String::new(),
            user_id: "user-1".to_string(),
            book_id: "book-1".to_string(),
            started_at: Timestamp::ZERO,
            finished_at: None,
        };
        store.start(&mut first).unwrap();

        let mut second = BookReadingSession {
            id: String::new(),
            user_id: "user-1".to_string(),
            book_id: "book-1".to_string(),
            started_at: Timestamp::ZERO,
            finished_at: None,
        };
        assert!(store.start(&mut second).is_err());

        store.finish(&first.id, Timestamp::from_millis(1)).unwrap();
        assert!(store.start(&mut second).is_ok());
    }
}
