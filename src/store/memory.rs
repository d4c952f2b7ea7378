//! In-memory graph store.
//!
//! Per-group `tokio` mutexes serialize transactions; entity maps and the journal
//! sit behind `parking_lot` locks that are never held across an `.await`.

use super::txn::{GroupTxn, TxnHandle};
use super::{GraphStore, JournalEntry, JournalWrite, NewJournalEntry};
use crate::error::{DmError, DmResult};
use crate::models::{EntityKey, EntityKind, GroupKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type GroupMap = BTreeMap<EntityKey, serde_json::Value>;

#[derive(Debug)]
struct StoredEntry {
    entry: JournalEntry,
    leased_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct JournalState {
    next_id: i64,
    entries: BTreeMap<i64, StoredEntry>,
    named: HashMap<(GroupKey, String), i64>,
    dead: Vec<JournalEntry>,
}

impl JournalState {
    fn insert(&mut self, new: NewJournalEntry) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        if let Some(name) = &new.name {
            self.named.insert((new.root.clone(), name.clone()), id);
        }
        self.entries.insert(
            id,
            StoredEntry {
                entry: JournalEntry {
                    id,
                    root: new.root,
                    name: new.name,
                    body: new.body,
                    process_after: new.process_after,
                    attempts: 0,
                    last_error: None,
                },
                leased_until: None,
            },
        );
        id
    }

    fn cancel_named(&mut self, root: &GroupKey, name: &str) {
        if let Some(id) = self.named.remove(&(root.clone(), name.to_string())) {
            self.entries.remove(&id);
        }
    }

    fn remove(&mut self, id: i64) -> Option<JournalEntry> {
        let stored = self.entries.remove(&id)?;
        if let Some(name) = &stored.entry.name {
            let slot = (stored.entry.root.clone(), name.clone());
            if self.named.get(&slot) == Some(&id) {
                self.named.remove(&slot);
            }
        }
        Some(stored.entry)
    }
}

#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    locks: DashMap<GroupKey, Arc<tokio::sync::Mutex<()>>>,
    groups: RwLock<BTreeMap<GroupKey, GroupMap>>,
    journal: Mutex<JournalState>,
    failing_commits: AtomicUsize,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a transient error.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn group_lock(&self, root: &GroupKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(root.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn begin(&self, root: &GroupKey) -> DmResult<GroupTxn> {
        let guard = self.group_lock(root).lock_owned().await;
        let snapshot = self.groups.read().get(root).cloned().unwrap_or_default();
        Ok(GroupTxn::new(root.clone(), snapshot, TxnHandle::Memory(guard)))
    }

    async fn commit(&self, txn: GroupTxn) -> DmResult<()> {
        let parts = txn.into_parts();
        if self.take_injected_failure() {
            return Err(DmError::Transient(format!(
                "injected commit failure on {}",
                parts.root
            )));
        }

        {
            let mut groups = self.groups.write();
            let group = groups.entry(parts.root.clone()).or_default();
            group.extend(parts.writes);
        }
        {
            let mut journal = self.journal.lock();
            for write in parts.journal {
                match write {
                    JournalWrite::Enqueue(entry) => {
                        journal.insert(entry);
                    }
                    JournalWrite::PutNamed(entry) => {
                        if let Some(name) = &entry.name {
                            journal.cancel_named(&entry.root, name);
                        }
                        journal.insert(entry);
                    }
                    JournalWrite::CancelNamed { root, name } => journal.cancel_named(&root, &name),
                }
            }
        }

        debug!(root = %parts.root, "committed group transaction");
        // the group lock is released when the handle drops
        drop(parts.handle);
        Ok(())
    }

    async fn get_raw(&self, key: &EntityKey) -> DmResult<Option<serde_json::Value>> {
        Ok(self
            .groups
            .read()
            .get(&key.group)
            .and_then(|group| group.get(key))
            .cloned())
    }

    async fn scan_group(
        &self,
        group: &GroupKey,
        kind: EntityKind,
    ) -> DmResult<Vec<(EntityKey, serde_json::Value)>> {
        Ok(self
            .groups
            .read()
            .get(group)
            .map(|entities| {
                entities
                    .iter()
                    .filter(|(k, _)| k.kind == kind)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn enqueue(&self, entries: Vec<NewJournalEntry>) -> DmResult<()> {
        let mut journal = self.journal.lock();
        for entry in entries {
            if let Some(name) = &entry.name {
                journal.cancel_named(&entry.root, name);
            }
            journal.insert(entry);
        }
        Ok(())
    }

    async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        limit: usize,
    ) -> DmResult<Vec<JournalEntry>> {
        let mut journal = self.journal.lock();
        let mut ready: Vec<(Option<DateTime<Utc>>, i64)> = journal
            .entries
            .values()
            .filter(|stored| stored.entry.process_after.map_or(true, |at| at <= now))
            .filter(|stored| stored.leased_until.map_or(true, |until| until <= now))
            .map(|stored| (stored.entry.process_after, stored.entry.id))
            .collect();
        ready.sort();

        let mut claimed = Vec::new();
        for (_, id) in ready.into_iter().take(limit) {
            if let Some(stored) = journal.entries.get_mut(&id) {
                stored.leased_until = Some(now + lease);
                stored.entry.attempts += 1;
                claimed.push(stored.entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: i64) -> DmResult<()> {
        self.journal.lock().remove(id);
        Ok(())
    }

    async fn retry_later(&self, id: i64, at: DateTime<Utc>, error: &str) -> DmResult<()> {
        let mut journal = self.journal.lock();
        if let Some(stored) = journal.entries.get_mut(&id) {
            stored.leased_until = None;
            stored.entry.process_after = Some(at);
            stored.entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn dead_letter(&self, id: i64, error: &str) -> DmResult<()> {
        let mut journal = self.journal.lock();
        if let Some(mut entry) = journal.remove(id) {
            entry.last_error = Some(error.to_string());
            journal.dead.push(entry);
        }
        Ok(())
    }

    async fn pending(&self) -> DmResult<Vec<JournalEntry>> {
        Ok(self
            .journal
            .lock()
            .entries
            .values()
            .map(|stored| stored.entry.clone())
            .collect())
    }

    async fn dead_letters(&self) -> DmResult<Vec<JournalEntry>> {
        Ok(self.journal.lock().dead.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Attempt, AttemptId, Model, QuestId};
    use std::time::Duration;

    fn attempt_id(n: u32) -> AttemptId {
        AttemptId::new(QuestId::new("q").unwrap(), n).unwrap()
    }

    fn entry(root: &GroupKey, after: Option<DateTime<Utc>>) -> NewJournalEntry {
        NewJournalEntry {
            root: root.clone(),
            name: None,
            body: serde_json::json!({"type": "noop"}),
            process_after: after,
        }
    }

    #[tokio::test]
    async fn test_commit_applies_writes_and_journal() {
        let store = MemoryGraphStore::new();
        let id = attempt_id(1);
        let root = GroupKey::Attempt(id.clone());
        let attempt = Attempt::new(id.clone(), Utc::now());

        let mut txn = store.begin(&root).await.unwrap();
        txn.put(&attempt).unwrap();
        txn.journal([entry(&root, None)]);
        assert!(store.get_raw(&attempt.key()).await.unwrap().is_none());
        store.commit(txn).await.unwrap();

        assert!(store.exists(&attempt.key()).await.unwrap());
        assert_eq!(store.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_everything() {
        let store = MemoryGraphStore::new();
        let id = attempt_id(1);
        let root = GroupKey::Attempt(id.clone());

        let mut txn = store.begin(&root).await.unwrap();
        txn.put(&Attempt::new(id.clone(), Utc::now())).unwrap();
        txn.journal([entry(&root, None)]);
        drop(txn);

        assert!(!store.exists(&Attempt::key_for(&id)).await.unwrap());
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cross_group_write_rejected() {
        let store = MemoryGraphStore::new();
        let mut txn = store
            .begin(&GroupKey::Attempt(attempt_id(1)))
            .await
            .unwrap();
        let other = Attempt::new(attempt_id(2), Utc::now());
        assert!(matches!(txn.put(&other), Err(DmError::Internal(_))));
    }

    #[tokio::test]
    async fn test_group_transactions_are_serialized() {
        let store = Arc::new(MemoryGraphStore::new());
        let root = GroupKey::Attempt(attempt_id(1));
        let txn = store.begin(&root).await.unwrap();

        let contender = {
            let store = store.clone();
            let root = root.clone();
            tokio::spawn(async move { store.begin(&root).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        store.commit(txn).await.unwrap();
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_claim_respects_delay_and_lease() {
        let store = MemoryGraphStore::new();
        let root = GroupKey::Attempt(attempt_id(1));
        let now = Utc::now();
        store
            .enqueue(vec![
                entry(&root, None),
                entry(&root, Some(now + chrono::Duration::seconds(60))),
            ])
            .await
            .unwrap();

        let lease = chrono::Duration::seconds(30);
        let claimed = store.claim_ready(now, lease, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);

        // leased entries stay invisible until the lease runs out
        assert!(store.claim_ready(now, lease, 10).await.unwrap().is_empty());

        let later = now + chrono::Duration::seconds(61);
        let claimed = store.claim_ready(later, lease, 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_named_entries_replace_and_cancel() {
        let store = MemoryGraphStore::new();
        let root = GroupKey::Attempt(attempt_id(1));

        for _ in 0..2 {
            let mut txn = store.begin(&root).await.unwrap();
            txn.put_named("timeout", entry(&root, None));
            store.commit(txn).await.unwrap();
        }
        assert_eq!(store.pending().await.unwrap().len(), 1);

        let mut txn = store.begin(&root).await.unwrap();
        txn.cancel_named("timeout");
        store.commit(txn).await.unwrap();
        assert!(store.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_and_retry() {
        let store = MemoryGraphStore::new();
        let root = GroupKey::Attempt(attempt_id(1));
        let now = Utc::now();
        store
            .enqueue(vec![entry(&root, None), entry(&root, None)])
            .await
            .unwrap();
        let claimed = store
            .claim_ready(now, chrono::Duration::seconds(30), 10)
            .await
            .unwrap();

        store.dead_letter(claimed[0].id, "boom").await.unwrap();
        store
            .retry_later(claimed[1].id, now + chrono::Duration::seconds(5), "busy")
            .await
            .unwrap();

        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("boom"));

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("busy"));
    }

    #[tokio::test]
    async fn test_injected_commit_failure_is_transient() {
        let store = MemoryGraphStore::new();
        store.fail_next_commits(1);
        let root = GroupKey::Attempt(attempt_id(1));

        let txn = store.begin(&root).await.unwrap();
        assert!(store.commit(txn).await.unwrap_err().is_transient());
        let txn = store.begin(&root).await.unwrap();
        assert!(store.commit(txn).await.is_ok());
    }
}
