//! Generic Entity Table: templated CRUD for a record type `T`
//! with a primary-key prefix and a declarative list of unique secondary
//! indexes.
//!
//! Similar in spirit to a `def_table!`-style macro that turns a
//! name + key/value type pair into a typed table handle at compile time.
//! Here the index set is genuinely data, not types — a record can carry any
//! number of unique lookup values — so indexes are declared as a runtime
//! list of [`IndexDef`] closures instead of compile-time table definitions —
//! no runtime type dispatch needed, since index functions close over the
//! concrete record type.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::ResultExt as _;

use crate::engine::WriteTxCtx;
use crate::error::{DbResult, DecodeSnafu, StoreError, StoreResult};
use crate::keycodec::{entity_prefix, index_key, is_index_key, primary_key};

/// A record managed by a [`EntityTable`]. `id()` must match the value used
/// to build the record's primary key.
pub trait Record: Serialize + DeserializeOwned + Clone {
    fn id(&self) -> &str;
}

/// A declarative unique secondary index.
///
/// `key_values` returns every lookup value this record should be found
/// under for this index — usually zero or one, but e.g. a book's tag index
/// could list several if it were declared generically (in practice the
/// generic table is used only for genuinely single-valued unique indexes;
/// multi-valued reverse indexes are hand-rolled).
pub struct IndexDef<T> {
    pub name: &'static str,
    pub key_values: fn(&T) -> Vec<String>,
    /// Normalizes a caller-supplied lookup value the same way the indexed
    /// value was normalized when written.
    pub lookup_transform: Option<fn(&str) -> String>,
}

impl<T> IndexDef<T> {
    fn normalize(&self, value: &str) -> String {
        match self.lookup_transform {
            Some(f) => f(value),
            None => value.to_string(),
        }
    }
}

/// Table definition: entity name + its unique indexes.
pub struct EntityTable<T: 'static> {
    pub entity: &'static str,
    pub indexes: &'static [IndexDef<T>],
}

impl<T: Record + 'static> EntityTable<T> {
    fn encode(value: &T) -> DbResult<Vec<u8>> {
        serde_json::to_vec(value).context(DecodeSnafu)
    }

    fn decode(bytes: &[u8]) -> DbResult<T> {
        serde_json::from_slice(bytes).context(DecodeSnafu)
    }

    fn index_values_for(&self, value: &T) -> Vec<(&'static IndexDef<T>, String)> {
        self.indexes
            .iter()
            .flat_map(|idx| (idx.key_values)(value).into_iter().map(move |v| (idx, v)))
            .collect()
    }

    /// Fails with `AlreadyExists` if the primary key or any unique index
    /// value already exists.
    pub fn create(&self, tx: &WriteTxCtx, value: &T) -> StoreResult<()> {
        let id = value.id().to_string();
        let pkey = primary_key(self.entity, &id);

        if tx.exists(&pkey)? {
            return Err(StoreError::already_exists(self.entity, id));
        }

        let mut new_index_keys = Vec::new();
        for (idx, raw_value) in self.index_values_for(value) {
            let normalized = idx.normalize(&raw_value);
            let ikey = index_key(self.entity, idx.name, &normalized);
            if tx.exists(&ikey)? {
                return Err(StoreError::already_exists(
                    self.entity,
                    format!("{}={}", idx.name, raw_value),
                ));
            }
            new_index_keys.push((ikey, id.clone()));
        }

        let encoded = Self::encode(value)?;
        tx.set(&pkey, &encoded)?;
        for (ikey, id_value) in new_index_keys {
            tx.set(&ikey, id_value.as_bytes())?;
        }
        Ok(())
    }

    pub fn get(&self, tx: &WriteTxCtx, id: &str) -> StoreResult<Option<T>> {
        let pkey = primary_key(self.entity, id);
        match tx.get(&pkey)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_or_not_found(&self, tx: &WriteTxCtx, id: &str) -> StoreResult<T> {
        self.get(tx, id)?
            .ok_or_else(|| StoreError::not_found(self.entity, id))
    }

    pub fn get_by_index(&self, tx: &WriteTxCtx, index_name: &str, value: &str) -> StoreResult<Option<T>> {
        let Some(idx) = self.indexes.iter().find(|i| i.name == index_name) else {
            return Err(StoreError::Internal {
                message: format!("unknown index `{index_name}` on entity `{}`", self.entity),
            });
        };
        let normalized = idx.normalize(value);
        let ikey = index_key(self.entity, idx.name, &normalized);
        let Some(id_bytes) = tx.get(&ikey)? else {
            return Ok(None);
        };
        let id = String::from_utf8_lossy(&id_bytes).into_owned();
        self.get(tx, &id)
    }

    /// Like [`Self::get`], but treats a soft-deleted record as absent — the
    /// record itself still exists (its unique index entries are retained
    /// until a hard delete), but callers outside delta-sync queries must
    /// never see it.
    pub fn get_live(&self, tx: &WriteTxCtx, id: &str, is_deleted: impl Fn(&T) -> bool) -> StoreResult<Option<T>> {
        Ok(self.get(tx, id)?.filter(|r| !is_deleted(r)))
    }

    pub fn get_live_or_not_found(&self, tx: &WriteTxCtx, id: &str, is_deleted: impl Fn(&T) -> bool) -> StoreResult<T> {
        self.get_live(tx, id, is_deleted)?
            .ok_or_else(|| StoreError::not_found(self.entity, id))
    }

    /// Like [`Self::get_by_index`], but treats a soft-deleted match as a
    /// miss.
    pub fn get_by_index_live(
        &self,
        tx: &WriteTxCtx,
        index_name: &str,
        value: &str,
        is_deleted: impl Fn(&T) -> bool,
    ) -> StoreResult<Option<T>> {
        Ok(self.get_by_index(tx, index_name, value)?.filter(|r| !is_deleted(r)))
    }

    /// Loads the old record, diffs old vs new index values per index, and
    /// atomically writes the primary record plus index deltas. Reusing an
    /// identical index value across old/new is a no-op for that value — no
    /// delete-then-insert that would conflict with the record's own entry.
    pub fn update(&self, tx: &WriteTxCtx, value: &T) -> StoreResult<()> {
        let id = value.id().to_string();
        let old = self.get_or_not_found(tx, &id)?;

        for idx in self.indexes {
            let old_values: HashSet<String> = (idx.key_values)(&old)
                .into_iter()
                .map(|v| idx.normalize(&v))
                .collect();
            let new_values: HashSet<String> = (idx.key_values)(value)
                .into_iter()
                .map(|v| idx.normalize(&v))
                .collect();

            for added in new_values.difference(&old_values) {
                let ikey = index_key(self.entity, idx.name, added);
                if tx.exists(&ikey)? {
                    return Err(StoreError::already_exists(
                        self.entity,
                        format!("{}={}", idx.name, added),
                    ));
                }
            }

            for removed in old_values.difference(&new_values) {
                tx.delete(&index_key(self.entity, idx.name, removed))?;
            }
            for added in new_values.difference(&old_values) {
                tx.set(&index_key(self.entity, idx.name, added), id.as_bytes())?;
            }
        }

        let pkey = primary_key(self.entity, &id);
        tx.set(&pkey, &Self::encode(value)?)?;
        Ok(())
    }

    /// Idempotent: deleting a missing record is `Ok(())`.
    pub fn delete(&self, tx: &WriteTxCtx, id: &str) -> StoreResult<()> {
        let Some(old) = self.get(tx, id)? else {
            return Ok(());
        };
        for idx in self.indexes {
            for raw_value in (idx.key_values)(&old) {
                let normalized = idx.normalize(&raw_value);
                tx.delete(&index_key(self.entity, idx.name, &normalized))?;
            }
        }
        tx.delete(&primary_key(self.entity, id))?;
        Ok(())
    }

    /// Lists every record in primary-key order, skipping index entries
    ///.
    /// Decode failures are logged and skip the item rather than failing the
    /// whole scan.
    pub fn list(&self, tx: &WriteTxCtx) -> StoreResult<Vec<T>> {
        let prefix = entity_prefix(self.entity);
        let mut out = Vec::new();
        for (key, value) in tx.scan_prefix(&prefix)? {
            if is_index_key(&prefix, &key) {
                continue;
            }
            match Self::decode(&value) {
                Ok(record) => out.push(record),
                Err(err) => {
                    tracing::warn!(target: "bookvault::store::entity", entity = self.entity, err = %err, "skipping undecodable record during list");
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::engine::Engine;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Widget {
        id: String,
        name: String,
        sku: String,
    }

    impl Record for Widget {
        fn id(&self) -> &str {
            &self.id
        }
    }

    fn name_lower(s: &str) -> String {
        s.trim().to_lowercase()
    }

    static WIDGET_INDEXES: &[IndexDef<Widget>] = &[
        IndexDef {
            name: "name",
            key_values: |w| vec![w.name.clone()],
            lookup_transform: Some(name_lower),
        },
        IndexDef {
            name: "sku",
            key_values: |w| vec![w.sku.clone()],
            lookup_transform: None,
        },
    ];

    const TABLE: EntityTable<Widget> = EntityTable {
        entity: "widget",
        indexes: WIDGET_INDEXES,
    };

    fn widget(id: &str, name: &str, sku: &str) -> Widget {
        Widget {
            id: id.to_string(),
            name: name.to_string(),
            sku: sku.to_string(),
        }
    }

    #[test]
    fn create_get_delete_roundtrip() {
        let engine = Engine::open_in_memory().unwrap();
        engine
            .write_retrying(|tx| {
                TABLE.create(tx, &widget("w-1", "Widget One", "SKU1")).unwrap();
                assert_eq!(TABLE.get(tx, "w-1").unwrap(), Some(widget("w-1", "Widget One", "SKU1")));
                TABLE.delete(tx, "w-1").unwrap();
                assert_eq!(TABLE.get(tx, "w-1").unwrap(), None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn duplicate_create_conflicts_on_unique_index() {
        let engine = Engine::open_in_memory().unwrap();
        engine
            .write_retrying(|tx| {
                TABLE.create(tx, &widget("w-1", "Dup", "SKU1")).unwrap();
                let err = TABLE.create(tx, &widget("w-2", "Dup", "SKU2"));
                assert!(err.is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn lookup_is_case_and_whitespace_insensitive() {
        let engine = Engine::open_in_memory().unwrap();
        engine
            .write_retrying(|tx| {
                TABLE.create(tx, &widget("w-1", "  Mixed Case  ", "SKU1")).unwrap();
                let found = TABLE.get_by_index(tx, "name", "mixed case").unwrap();
                assert_eq!(found.map(|w| w.id), Some("w-1".to_string()));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn update_removes_stale_index_entries() {
        let engine = Engine::open_in_memory().unwrap();
        engine
            .write_retrying(|tx| {
                TABLE.create(tx, &widget("w-1", "Old Name", "SKU1")).unwrap();
                TABLE.update(tx, &widget("w-1", "New Name", "SKU1")).unwrap();
                assert!(TABLE.get_by_index(tx, "name", "Old Name").unwrap().is_none());
                assert!(TABLE.get_by_index(tx, "name", "New Name").unwrap().is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn list_skips_index_entries() {
        let engine = Engine::open_in_memory().unwrap();
        engine
            .write_retrying(|tx| {
                TABLE.create(tx, &widget("w-1", "A", "S1")).unwrap();
                TABLE.create(tx, &widget("w-2", "B", "S2")).unwrap();
                let all = TABLE.list(tx).unwrap();
                assert_eq!(all.len(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_is_idempotent() {
        let engine = Engine::open_in_memory().unwrap();
        engine
            .write_retrying(|tx| {
                TABLE.delete(tx, "missing").unwrap();
                Ok(())
            })
            .unwrap();
    }
}
