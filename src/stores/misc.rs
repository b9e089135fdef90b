//! Naturally-keyed singleton and per-user entities: no id generation, no
//! secondary indexes — the primary key is a fact about the world
//! (a user id, or the literal `"singleton"`) rather than a minted identifier.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Timestamp};
use crate::engine::Engine;
use crate::entity::{EntityTable, IndexDef, Record};
use crate::error::StoreResult;
use crate::models::Syncable;

const SINGLETON_KEY: &str = "singleton";

// ---------------------------------------------------------------------
// UserStats
// ---------------------------------------------------------------------

pub const USER_STATS_ENTITY: &str = "user_stats";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStats {
    pub id: String,
    pub total_listening_ms: i64,
    pub books_started: i64,
    pub books_completed: i64,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for UserStats {
    fn id(&self) -> &str {
        &self.id
    }
}

static USER_STATS_INDEXES: &[IndexDef<UserStats>] = &[];
const USER_STATS_TABLE: EntityTable<UserStats> = EntityTable {
    entity: USER_STATS_ENTITY,
    indexes: USER_STATS_INDEXES,
};

pub struct UserStatsStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
}

impl UserStatsStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    pub fn get(&self, user_id: &str) -> StoreResult<UserStats> {
        self.engine.write_retrying(|tx| {
            Ok(USER_STATS_TABLE.get(tx, user_id)?.unwrap_or_else(|| UserStats {
                id: user_id.to_string(),
                total_listening_ms: 0,
                books_started: 0,
                books_completed: 0,
                sync: Syncable::new(self.clock.now()),
            }))
        })
    }

    /// Applies `f` to the current (or default) stats and persists the
    /// result, creating the record on first use.
    pub fn update_with(&self, user_id: &str, f: impl Fn(&mut UserStats)) -> StoreResult<UserStats> {
        self.engine.write_retrying(|tx| {
            let mut stats = USER_STATS_TABLE.get(tx, user_id)?.unwrap_or_else(|| UserStats {
                id: user_id.to_string(),
                total_listening_ms: 0,
                books_started: 0,
                books_completed: 0,
                sync: Syncable::new(self.clock.now()),
            });
            f(&mut stats);
            stats.sync.touch(self.clock.now());
            if USER_STATS_TABLE.get(tx, user_id)?.is_some() {
                USER_STATS_TABLE.update(tx, &stats)?;
            } else {
                USER_STATS_TABLE.create(tx, &stats)?;
            }
            Ok(stats)
        })
    }
}

// ---------------------------------------------------------------------
// UserSettings
// ---------------------------------------------------------------------

pub const USER_SETTINGS_ENTITY: &str = "user_settings";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub id: String,
    pub locale: String,
    pub playback_speed: f32,
    pub theme: String,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for UserSettings {
    fn id(&self) -> &str {
        &self.id
    }
}

impl UserSettings {
    fn default_for(user_id: &str, now: Timestamp) -> Self {
        Self {
            id: user_id.to_string(),
            locale: "en-US".to_string(),
            playback_speed: 1.0,
            theme: "system".to_string(),
            sync: Syncable::new(now),
        }
    }
}

static USER_SETTINGS_INDEXES: &[IndexDef<UserSettings>] = &[];
const USER_SETTINGS_TABLE: EntityTable<UserSettings> = EntityTable {
    entity: USER_SETTINGS_ENTITY,
    indexes: USER_SETTINGS_INDEXES,
};

pub struct UserSettingsStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
}

impl UserSettingsStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    pub fn get(&self, user_id: &str) -> StoreResult<UserSettings> {
        self.engine
            .write_retrying(|tx| Ok(USER_SETTINGS_TABLE.get(tx, user_id)?.unwrap_or_else(|| UserSettings::default_for(user_id, self.clock.now()))))
    }

    pub fn upsert(&self, settings: &mut UserSettings) -> StoreResult<()> {
        settings.sync.touch(self.clock.now());
        self.engine.write_retrying(|tx| {
            if USER_SETTINGS_TABLE.get(tx, &settings.id)?.is_some() {
                USER_SETTINGS_TABLE.update(tx, settings)
            } else {
                settings.sync.created_at = settings.sync.updated_at;
                USER_SETTINGS_TABLE.create(tx, settings)
            }
        })
    }
}

// ---------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------

pub const PROFILE_ENTITY: &str = "profile";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Keyed by `user_id`, not a minted id — one profile per user.
    pub id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Profile {
    fn id(&self) -> &str {
        &self.id
    }
}

static PROFILE_INDEXES: &[IndexDef<Profile>] = &[];
const PROFILE_TABLE: EntityTable<Profile> = EntityTable {
    entity: PROFILE_ENTITY,
    indexes: PROFILE_INDEXES,
};

pub struct ProfileStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
}

impl ProfileStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    pub fn get(&self, user_id: &str) -> StoreResult<Option<Profile>> {
        self.engine.write_retrying(|tx| PROFILE_TABLE.get(tx, user_id))
    }

    pub fn upsert(&self, profile: &mut Profile) -> StoreResult<()> {
        profile.sync.touch(self.clock.now());
        self.engine.write_retrying(|tx| {
            if PROFILE_TABLE.get(tx, &profile.id)?.is_some() {
                PROFILE_TABLE.update(tx, profile)
            } else {
                profile.sync.created_at = profile.sync.updated_at;
                PROFILE_TABLE.create(tx, profile)
            }
        })
    }
}

// ---------------------------------------------------------------------
// UserMilestoneState
// ---------------------------------------------------------------------

pub const MILESTONE_ENTITY: &str = "user_milestones";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMilestoneState {
    pub id: String,
    pub achieved: HashSet<String>,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for UserMilestoneState {
    fn id(&self) -> &str {
        &self.id
    }
}

static MILESTONE_INDEXES: &[IndexDef<UserMilestoneState>] = &[];
const MILESTONE_TABLE: EntityTable<UserMilestoneState> = EntityTable {
    entity: MILESTONE_ENTITY,
    indexes: MILESTONE_INDEXES,
};

pub struct UserMilestoneStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
}

impl UserMilestoneStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    pub fn get(&self, user_id: &str) -> StoreResult<UserMilestoneState> {
        self.engine.write_retrying(|tx| {
            Ok(MILESTONE_TABLE.get(tx, user_id)?.unwrap_or_else(|| UserMilestoneState {
                id: user_id.to_string(),
                achieved: HashSet::new(),
                sync: Syncable::new(self.clock.now()),
            }))
        })
    }

    /// Records `milestone` as achieved. Returns `true` if it was newly
    /// recorded (callers use this to decide whether to emit a milestone
    /// event).
    pub fn mark_achieved(&self, user_id: &str, milestone: &str) -> StoreResult<bool> {
        self.engine.write_retrying(|tx| {
            let mut state = MILESTONE_TABLE.get(tx, user_id)?.unwrap_or_else(|| UserMilestoneState {
                id: user_id.to_string(),
                achieved: HashSet::new(),
                sync: Syncable::new(self.clock.now()),
            });
            let is_new = state.achieved.insert(milestone.to_string());
            if is_new {
                state.sync.touch(self.clock.now());
                if MILESTONE_TABLE.get(tx, user_id)?.is_some() {
                    MILESTONE_TABLE.update(tx, &state)?;
                } else {
                    MILESTONE_TABLE.create(tx, &state)?;
                }
            }
            Ok(is_new)
        })
    }
}

// ---------------------------------------------------------------------
// Instance (singleton)
// ---------------------------------------------------------------------

pub const INSTANCE_ENTITY: &str = "instance";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub instance_id: String,
    pub version: String,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl Record for Instance {
    fn id(&self) -> &str {
        &self.id
    }
}

static INSTANCE_INDEXES: &[IndexDef<Instance>] = &[];
const INSTANCE_TABLE: EntityTable<Instance> = EntityTable {
    entity: INSTANCE_ENTITY,
    indexes: INSTANCE_INDEXES,
};

pub struct InstanceStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
}

impl InstanceStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    pub fn get(&self) -> StoreResult<Option<Instance>> {
        self.engine.write_retrying(|tx| INSTANCE_TABLE.get(tx, SINGLETON_KEY))
    }

    /// Creates the singleton record if it doesn't exist yet; otherwise
    /// returns the existing one unchanged.
    pub fn get_or_init(&self, instance_id: impl FnOnce() -> String, version: &str) -> StoreResult<Instance> {
        let mut instance_id = Some(instance_id);
        self.engine.write_retrying(move |tx| {
            if let Some(existing) = INSTANCE_TABLE.get(tx, SINGLETON_KEY)? {
                return Ok(existing);
            }
            let instance = Instance {
                id: SINGLETON_KEY.to_string(),
                instance_id: instance_id.take().expect("instance id generator invoked more than once")(),
                version: version.to_string(),
                sync: Syncable::new(self.clock.now()),
            };
            INSTANCE_TABLE.create(tx, &instance)?;
            Ok(instance)
        })
    }
}

// ---------------------------------------------------------------------
// ServerSettings (singleton)
// ---------------------------------------------------------------------

pub const SERVER_SETTINGS_ENTITY: &str = "server_settings";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub id: String,
    pub allow_signup: bool,
    pub scan_interval_secs: i64,
    #[serde(flatten)]
    pub sync: Syncable,
}

impl ServerSettings {
    fn default_at(now: Timestamp) -> Self {
        Self {
            id: SINGLETON_KEY.to_string(),
            allow_signup: true,
            scan_interval_secs: 3600,
            sync: Syncable::new(now),
        }
    }
}

impl Record for ServerSettings {
    fn id(&self) -> &str {
        &self.id
    }
}

static SERVER_SETTINGS_INDEXES: &[IndexDef<ServerSettings>] = &[];
const SERVER_SETTINGS_TABLE: EntityTable<ServerSettings> = EntityTable {
    entity: SERVER_SETTINGS_ENTITY,
    indexes: SERVER_SETTINGS_INDEXES,
};

pub struct ServerSettingsStore {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
}

impl ServerSettingsStore {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    pub fn get(&self) -> StoreResult<ServerSettings> {
        self.engine
            .write_retrying(|tx| Ok(SERVER_SETTINGS_TABLE.get(tx, SINGLETON_KEY)?.unwrap_or_else(|| ServerSettings::default_at(self.clock.now()))))
    }

    pub fn upsert(&self, settings: &mut ServerSettings) -> StoreResult<()> {
        settings.id = SINGLETON_KEY.to_string();
        settings.sync.touch(self.clock.now());
        self.engine.write_retrying(|tx| {
            if SERVER_SETTINGS_TABLE.get(tx, SINGLETON_KEY)?.is_some() {
                SERVER_SETTINGS_TABLE.update(tx, settings)
            } else {
                settings.sync.created_at = settings.sync.updated_at;
                SERVER_SETTINGS_TABLE.create(tx, settings)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    #[test]
    fn user_stats_update_with_creates_on_first_use() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock = Arc::new(TestClock::new(Timestamp::ZERO));
        let store = UserStatsStore::new(engine, clock);

        let stats = store.update_with("user-1", |s| s.books_completed += 1).unwrap();
        assert_eq!(stats.books_completed, 1);
        let stats = store.update_with("user-1", |s| s.books_completed += 1).unwrap();
        assert_eq!(stats.books_completed, 2);
    }

    #[test]
    fn instance_get_or_init_is_stable_across_calls() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock = Arc::new(TestClock::new(Timestamp::ZERO));
        let store = InstanceStore::new(engine, clock);

        let first = store.get_or_init(|| "instance-a".to_string(), "1.0.0").unwrap();
        let second = store.get_or_init(|| "instance-b".to_string(), "1.0.0").unwrap();
        assert_eq!(first.instance_id, second.instance_id);
    }

    #[test]
    fn milestone_mark_achieved_is_idempotent() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let clock = Arc::new(TestClock::new(Timestamp::ZERO));
        let store = UserMilestoneStore::new(engine, clock);

        assert!(store.mark_achieved("user-1", "first-book").unwrap());
        assert!(!store.mark_achieved("user-1", "first-book").unwrap());
        assert_eq!(store.get("user-1").unwrap().achieved.len(), 1);
    }
}
