//! PostgreSQL graph store.
//!
//! Entities live in `dm_entities` as JSONB documents keyed by
//! `(group_key, kind, entity_id)`. The journal lives in `dm_mutations`.
//! A group transaction takes `pg_advisory_xact_lock` on the group key, so two
//! transactions on the same group serialize inside PostgreSQL and the lock is
//! released by COMMIT or ROLLBACK.

use super::txn::{GroupTxn, TxnHandle};
use super::{GraphStore, JournalEntry, JournalWrite, NewJournalEntry};
use crate::error::{DmError, DmResult};
use crate::models::{EntityKey, EntityKind, GroupKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeMap;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS dm_entities (
        group_key TEXT NOT NULL,
        kind TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        body JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (group_key, kind, entity_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dm_mutations (
        id BIGSERIAL PRIMARY KEY,
        root TEXT NOT NULL,
        name TEXT,
        body JSONB NOT NULL,
        process_after TIMESTAMPTZ,
        leased_until TIMESTAMPTZ,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        dead_letter BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS dm_mutations_named
        ON dm_mutations (root, name)
        WHERE name IS NOT NULL AND NOT dead_letter
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS dm_mutations_ready
        ON dm_mutations (process_after, id)
        WHERE NOT dead_letter
    "#,
];

#[derive(Debug, Clone)]
pub struct PgGraphStore {
    pool: PgPool,
}

impl PgGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> DmResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist.
    pub async fn migrate(&self) -> DmResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("graph store schema is up to date");
        Ok(())
    }

    async fn insert_entry(tx: &mut Transaction<'static, Postgres>, entry: &NewJournalEntry) -> DmResult<()> {
        sqlx::query(
            "INSERT INTO dm_mutations (root, name, body, process_after) VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.root.to_string())
        .bind(entry.name.as_deref())
        .bind(&entry.body)
        .bind(entry.process_after)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn cancel_named(
        tx: &mut Transaction<'static, Postgres>,
        root: &GroupKey,
        name: &str,
    ) -> DmResult<()> {
        sqlx::query("DELETE FROM dm_mutations WHERE root = $1 AND name = $2 AND NOT dead_letter")
            .bind(root.to_string())
            .bind(name)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn apply_journal(
        tx: &mut Transaction<'static, Postgres>,
        writes: Vec<JournalWrite>,
    ) -> DmResult<()> {
        for write in writes {
            match write {
                JournalWrite::Enqueue(entry) => Self::insert_entry(tx, &entry).await?,
                JournalWrite::PutNamed(entry) => {
                    if let Some(name) = &entry.name {
                        Self::cancel_named(tx, &entry.root, name).await?;
                    }
                    Self::insert_entry(tx, &entry).await?;
                }
                JournalWrite::CancelNamed { root, name } => {
                    Self::cancel_named(tx, &root, &name).await?
                }
            }
        }
        Ok(())
    }

    fn entity_key(group: &GroupKey, row: &PgRow) -> DmResult<EntityKey> {
        let kind: String = row.try_get("kind")?;
        let id: String = row.try_get("entity_id")?;
        Ok(EntityKey::new(group.clone(), kind.parse()?, id))
    }

    fn journal_entry(row: &PgRow) -> DmResult<JournalEntry> {
        let root: String = row.try_get("root")?;
        let attempts: i32 = row.try_get("attempts")?;
        Ok(JournalEntry {
            id: row.try_get("id")?,
            root: root.parse()?,
            name: row.try_get("name")?,
            body: row.try_get("body")?,
            process_after: row.try_get("process_after")?,
            attempts: attempts.max(0) as u32,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl GraphStore for PgGraphStore {
    async fn begin(&self, root: &GroupKey) -> DmResult<GroupTxn> {
        let mut tx = self.pool.begin().await?;
        let group = root.to_string();
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&group)
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query("SELECT kind, entity_id, body FROM dm_entities WHERE group_key = $1")
            .bind(&group)
            .fetch_all(&mut *tx)
            .await?;
        let mut snapshot = BTreeMap::new();
        for row in &rows {
            snapshot.insert(Self::entity_key(root, row)?, row.try_get("body")?);
        }
        Ok(GroupTxn::new(root.clone(), snapshot, TxnHandle::Postgres(tx)))
    }

    async fn commit(&self, txn: GroupTxn) -> DmResult<()> {
        let parts = txn.into_parts();
        let mut tx = match parts.handle {
            TxnHandle::Postgres(tx) => tx,
            TxnHandle::Memory(_) => {
                return Err(DmError::internal(
                    "transaction was not opened by the PostgreSQL store",
                ))
            }
        };

        for (key, body) in &parts.writes {
            sqlx::query(
                r#"
                INSERT INTO dm_entities (group_key, kind, entity_id, body)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (group_key, kind, entity_id)
                DO UPDATE SET body = EXCLUDED.body, updated_at = now()
                "#,
            )
            .bind(key.group.to_string())
            .bind(key.kind.as_str())
            .bind(&key.id)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }
        Self::apply_journal(&mut tx, parts.journal).await?;
        tx.commit().await?;
        debug!(root = %parts.root, writes = parts.writes.len(), "committed group transaction");
        Ok(())
    }

    async fn get_raw(&self, key: &EntityKey) -> DmResult<Option<serde_json::Value>> {
        let row = sqlx::query(
            "SELECT body FROM dm_entities WHERE group_key = $1 AND kind = $2 AND entity_id = $3",
        )
        .bind(key.group.to_string())
        .bind(key.kind.as_str())
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("body")?),
            None => None,
        })
    }

    async fn scan_group(
        &self,
        group: &GroupKey,
        kind: EntityKind,
    ) -> DmResult<Vec<(EntityKey, serde_json::Value)>> {
        let rows = sqlx::query(
            "SELECT kind, entity_id, body FROM dm_entities WHERE group_key = $1 AND kind = $2 ORDER BY entity_id",
        )
        .bind(group.to_string())
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in &rows {
            entities.push((Self::entity_key(group, row)?, row.try_get("body")?));
        }
        Ok(entities)
    }

    async fn enqueue(&self, entries: Vec<NewJournalEntry>) -> DmResult<()> {
        let mut tx = self.pool.begin().await?;
        let writes = entries
            .into_iter()
            .map(|entry| match entry.name {
                Some(_) => JournalWrite::PutNamed(entry),
                None => JournalWrite::Enqueue(entry),
            })
            .collect();
        Self::apply_journal(&mut tx, writes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
        limit: usize,
    ) -> DmResult<Vec<JournalEntry>> {
        let rows = sqlx::query(
            r#"
            UPDATE dm_mutations SET leased_until = $2, attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM dm_mutations
                WHERE NOT dead_letter
                  AND (process_after IS NULL OR process_after <= $1)
                  AND (leased_until IS NULL OR leased_until <= $1)
                ORDER BY process_after NULLS FIRST, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, root, name, body, process_after, attempts, last_error
            "#,
        )
        .bind(now)
        .bind(now + lease)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows
            .iter()
            .map(Self::journal_entry)
            .collect::<DmResult<Vec<_>>>()?;
        claimed.sort_by(|a, b| (a.process_after, a.id).cmp(&(b.process_after, b.id)));
        Ok(claimed)
    }

    async fn complete(&self, id: i64) -> DmResult<()> {
        sqlx::query("DELETE FROM dm_mutations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry_later(&self, id: i64, at: DateTime<Utc>, error: &str) -> DmResult<()> {
        sqlx::query(
            "UPDATE dm_mutations SET leased_until = NULL, process_after = $2, last_error = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letter(&self, id: i64, error: &str) -> DmResult<()> {
        sqlx::query(
            "UPDATE dm_mutations SET dead_letter = TRUE, leased_until = NULL, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending(&self) -> DmResult<Vec<JournalEntry>> {
        let rows = sqlx::query(
            "SELECT id, root, name, body, process_after, attempts, last_error FROM dm_mutations WHERE NOT dead_letter ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::journal_entry).collect()
    }

    async fn dead_letters(&self) -> DmResult<Vec<JournalEntry>> {
        let rows = sqlx::query(
            "SELECT id, root, name, body, process_after, attempts, last_error FROM dm_mutations WHERE dead_letter ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::journal_entry).collect()
    }
}
