//! Entity-group transaction.
//!
//! A [`GroupTxn`] is opened by [`GraphStore::begin`](super::GraphStore::begin) with
//! the group's lock held and a snapshot of the group loaded. Reads see the
//! transaction's own writes. Nothing reaches the store until
//! [`GraphStore::commit`](super::GraphStore::commit); dropping the transaction
//! discards every write and every journaled mutation.

use super::{JournalWrite, NewJournalEntry};
use crate::error::{DmError, DmResult};
use crate::models::{EntityKey, GroupKey, Model};
use std::collections::BTreeMap;

/// Backend-specific state that lives as long as the transaction
pub enum TxnHandle {
    Memory(tokio::sync::OwnedMutexGuard<()>),
    #[cfg(feature = "postgres")]
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
}

pub struct GroupTxn {
    root: GroupKey,
    snapshot: BTreeMap<EntityKey, serde_json::Value>,
    writes: BTreeMap<EntityKey, serde_json::Value>,
    journal: Vec<JournalWrite>,
    handle: TxnHandle,
}

impl std::fmt::Debug for GroupTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupTxn")
            .field("root", &self.root)
            .field("entities", &self.snapshot.len())
            .field("writes", &self.writes.len())
            .field("journal", &self.journal.len())
            .finish()
    }
}

/// What a committed transaction asks the backend to persist
pub struct TxnParts {
    pub root: GroupKey,
    pub writes: BTreeMap<EntityKey, serde_json::Value>,
    pub journal: Vec<JournalWrite>,
    pub handle: TxnHandle,
}

impl GroupTxn {
    pub fn new(
        root: GroupKey,
        snapshot: BTreeMap<EntityKey, serde_json::Value>,
        handle: TxnHandle,
    ) -> Self {
        Self {
            root,
            snapshot,
            writes: BTreeMap::new(),
            journal: Vec::new(),
            handle,
        }
    }

    pub fn root(&self) -> &GroupKey {
        &self.root
    }

    fn check_group(&self, key: &EntityKey) -> DmResult<()> {
        if key.group != self.root {
            return Err(DmError::internal(format!(
                "cross-group access to {key} inside transaction on {}",
                self.root
            )));
        }
        Ok(())
    }

    pub fn get<T: Model>(&self, key: &EntityKey) -> DmResult<Option<T>> {
        self.check_group(key)?;
        match self.writes.get(key).or_else(|| self.snapshot.get(key)) {
            Some(raw) => Ok(Some(serde_json::from_value(raw.clone())?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, key: &EntityKey) -> DmResult<bool> {
        self.check_group(key)?;
        Ok(self.writes.contains_key(key) || self.snapshot.contains_key(key))
    }

    pub fn put<T: Model>(&mut self, entity: &T) -> DmResult<()> {
        let key = entity.key();
        self.check_group(&key)?;
        self.writes.insert(key, serde_json::to_value(entity)?);
        Ok(())
    }

    /// Every entity of `T::KIND` in the group, ordered by key.
    pub fn list<T: Model>(&self) -> DmResult<Vec<T>> {
        let mut merged: BTreeMap<&EntityKey, &serde_json::Value> = self
            .snapshot
            .iter()
            .filter(|(k, _)| k.kind == T::KIND)
            .collect();
        for (k, v) in self.writes.iter().filter(|(k, _)| k.kind == T::KIND) {
            merged.insert(k, v);
        }
        merged
            .into_values()
            .map(|raw| serde_json::from_value::<T>(raw.clone()).map_err(DmError::from))
            .collect()
    }

    /// Journal mutations that become visible only if this transaction commits.
    pub fn journal(&mut self, entries: impl IntoIterator<Item = NewJournalEntry>) {
        self.journal
            .extend(entries.into_iter().map(JournalWrite::Enqueue));
    }

    /// Register a named delayed mutation, replacing any pending one with the same name.
    pub fn put_named(&mut self, name: impl Into<String>, mut entry: NewJournalEntry) {
        entry.name = Some(name.into());
        self.journal.push(JournalWrite::PutNamed(entry));
    }

    /// Cancel a pending named mutation of this group, if any.
    pub fn cancel_named(&mut self, name: impl Into<String>) {
        self.journal.push(JournalWrite::CancelNamed {
            root: self.root.clone(),
            name: name.into(),
        });
    }

    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty() || !self.journal.is_empty()
    }

    pub fn into_parts(self) -> TxnParts {
        TxnParts {
            root: self.root,
            writes: self.writes,
            journal: self.journal,
            handle: self.handle,
        }
    }
}
