//! # Graph Store
//!
//! Persistence for graph entities and the mutation journal.
//!
//! ## Overview
//!
//! Entities are JSON documents addressed by [`EntityKey`] and partitioned into
//! entity groups. A [`GroupTxn`] is the only way to write: it holds the group's
//! lock, so transactions on one group are serialized while different groups
//! proceed independently. Mutations journaled inside a transaction commit
//! atomically with its writes.
//!
//! ## Key Features
//!
//! - **Group-scoped transactions** with read-your-writes
//! - **At-least-once journal** with leases, delayed delivery and dead-lettering
//! - **Named delayed mutations** that can be replaced or cancelled per group
//! - **Backends**: [`MemoryGraphStore`] for tests and embedding, `PgGraphStore` for production

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod txn;

use crate::error::{DmError, DmResult};
use crate::models::{EntityKey, EntityKind, GroupKey, Model};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryGraphStore;
#[cfg(feature = "postgres")]
pub use postgres::PgGraphStore;
pub use txn::{GroupTxn, TxnHandle, TxnParts};

/// A mutation waiting to be journaled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJournalEntry {
    pub root: GroupKey,
    pub name: Option<String>,
    pub body: serde_json::Value,
    /// Earliest delivery time; `None` means immediately
    pub process_after: Option<DateTime<Utc>>,
}

/// A journaled mutation as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub root: GroupKey,
    pub name: Option<String>,
    pub body: serde_json::Value,
    pub process_after: Option<DateTime<Utc>>,
    /// Deliveries so far, including the current one once claimed
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Journal operation recorded inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum JournalWrite {
    Enqueue(NewJournalEntry),
    PutNamed(NewJournalEntry),
    CancelNamed { root: GroupKey, name: String },
}

#[async_trait]
pub trait GraphStore: Send + Sync + std::fmt::Debug {
    /// Lock `root` and snapshot its entities.
    async fn begin(&self, root: &GroupKey) -> DmResult<GroupTxn>;

    /// Apply writes and journal operations atomically, then release the group.
    async fn commit(&self, txn: GroupTxn) -> DmResult<()>;

    /// Read one entity outside any transaction.
    async fn get_raw(&self, key: &EntityKey) -> DmResult<Option<serde_json::Value>>;

    async fn exists(&self, key: &EntityKey) -> DmResult<bool> {
        Ok(self.get_raw(key).await?.is_some())
    }

    /// All entities of `kind` in `group`, outside any transaction.
    async fn scan_group(
        &self,
        group: &GroupKey,
        kind: EntityKind,
    ) -> DmResult<Vec<(EntityKey, serde_json::Value)>>;

    /// Journal mutations without a surrounding transaction.
    async fn enqueue(&self, entries: Vec<NewJournalEntry>) -> DmResult<()>;

    /// Lease up to `limit` entries whose `process_after` has passed.
    async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        limit: usize,
    ) -> DmResult<Vec<JournalEntry>>;

    /// Remove a delivered entry. Unknown ids are ignored.
    async fn complete(&self, id: i64) -> DmResult<()>;

    /// Release the lease and redeliver no earlier than `at`.
    async fn retry_later(&self, id: i64, at: DateTime<Utc>, error: &str) -> DmResult<()>;

    /// Park an entry that must not be redelivered.
    async fn dead_letter(&self, id: i64, error: &str) -> DmResult<()>;

    /// Entries not yet delivered, ready or delayed.
    async fn pending(&self) -> DmResult<Vec<JournalEntry>>;

    async fn dead_letters(&self) -> DmResult<Vec<JournalEntry>>;
}

/// Typed read of one entity outside any transaction.
pub async fn fetch<T: Model>(store: &dyn GraphStore, key: &EntityKey) -> DmResult<Option<T>> {
    match store.get_raw(key).await? {
        Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
        None => Ok(None),
    }
}

/// Typed scan of one entity kind in a group, outside any transaction.
pub async fn fetch_all<T: Model>(store: &dyn GraphStore, group: &GroupKey) -> DmResult<Vec<T>> {
    store
        .scan_group(group, T::KIND)
        .await?
        .into_iter()
        .map(|(_, raw)| serde_json::from_value::<T>(raw).map_err(DmError::from))
        .collect()
}
