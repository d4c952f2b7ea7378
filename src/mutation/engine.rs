//! # Mutation Engine
//!
//! Minimal at-least-once executor for journaled mutations.
//!
//! ## Overview
//!
//! [`MutationEngine::run_mutation`] first makes the mutation's external calls,
//! then opens its group transaction, rolls it forward and commits the group's
//! writes together with the follow-on mutations. A failed commit therefore never
//! repeats a distributor call that already succeeded inside it. Workers claim ready journal entries with a lease, deliver them and
//! then complete, retry or dead-letter them depending on the outcome:
//!
//! - `Ok` completes the entry
//! - a transient error releases it for redelivery after a capped exponential
//!   backoff, with no state change
//! - any other error parks it in the dead-letter list

use super::{HandlerContext, Mutation};
use crate::error::{DmError, DmResult};
use crate::logging::{log_error, log_mutation_operation};
use crate::store::JournalEntry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct MutationEngine {
    ctx: Arc<HandlerContext>,
}

impl MutationEngine {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.ctx
    }

    /// Run `mutation` now in its own group transaction and journal its
    /// follow-ons atomically with the writes. Nothing is written on error.
    #[instrument(skip(self, mutation), fields(kind = mutation.name(), root = %mutation.root()))]
    pub async fn run_mutation(&self, mutation: &Mutation) -> DmResult<usize> {
        let root = mutation.root();
        let called = match mutation.call_out(&self.ctx).await {
            Ok(called) => called,
            Err(e) => {
                log_mutation_operation(
                    "call_out",
                    mutation.name(),
                    &root.to_string(),
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        };
        let mutation = called.as_ref().unwrap_or(mutation);

        let mut txn = self.ctx.store.begin(&root).await?;
        let follow_ups = match mutation.roll_forward(&self.ctx, &mut txn).await {
            Ok(follow_ups) => follow_ups,
            Err(e) => {
                drop(txn);
                log_mutation_operation(
                    "roll_forward",
                    mutation.name(),
                    &root.to_string(),
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        };

        let entries = follow_ups
            .iter()
            .map(Mutation::to_entry)
            .collect::<DmResult<Vec<_>>>()?;
        let emitted = entries.len();
        txn.journal(entries);
        self.ctx.store.commit(txn).await?;

        let names: Vec<&str> = follow_ups.iter().map(Mutation::name).collect();
        log_mutation_operation(
            "roll_forward",
            mutation.name(),
            &root.to_string(),
            "committed",
            (!names.is_empty())
                .then(|| names.join(","))
                .as_deref(),
        );
        Ok(emitted)
    }

    /// Journal mutations for later delivery, outside any transaction.
    pub async fn journal(&self, mutations: Vec<Mutation>) -> DmResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let entries = mutations
            .iter()
            .map(Mutation::to_entry)
            .collect::<DmResult<Vec<_>>>()?;
        self.ctx.store.enqueue(entries).await
    }

    /// Claim and deliver one ready entry. Returns whether anything was claimed.
    pub async fn process_next(&self) -> DmResult<bool> {
        let now = self.ctx.now();
        let lease = self.ctx.config.engine.lease();
        let Some(entry) = self
            .ctx
            .store
            .claim_ready(now, lease, 1)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(false);
        };
        self.deliver(entry).await?;
        Ok(true)
    }

    async fn deliver(&self, entry: JournalEntry) -> DmResult<()> {
        let mutation = match Mutation::from_entry(&entry) {
            Ok(mutation) => mutation,
            Err(e) => {
                log_error("mutation_engine", "decode", &e.to_string(), Some(&entry.root.to_string()));
                return self.ctx.store.dead_letter(entry.id, &e.to_string()).await;
            }
        };

        match self.run_mutation(&mutation).await {
            Ok(_) => self.ctx.store.complete(entry.id).await,
            Err(e) if e.is_transient() => {
                let delay = self.ctx.config.engine.retry_delay(entry.attempts);
                let at = self
                    .ctx
                    .now()
                    .checked_add_signed(delay)
                    .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
                warn!(
                    mutation = mutation.name(),
                    attempts = entry.attempts,
                    retry_at = %at,
                    error = %e,
                    "transient failure; will redeliver"
                );
                self.ctx.store.retry_later(entry.id, at, &e.to_string()).await
            }
            Err(e) => {
                log_error(
                    "mutation_engine",
                    mutation.name(),
                    &e.to_string(),
                    Some(&entry.root.to_string()),
                );
                self.ctx.store.dead_letter(entry.id, &e.to_string()).await
            }
        }
    }

    /// Deliver ready entries until none are left. Delayed entries whose time has
    /// not come are left in the journal.
    pub async fn run_until_idle(&self) -> DmResult<usize> {
        let limit = self.ctx.config.engine.max_idle_iterations;
        let mut delivered = 0;
        while self.process_next().await? {
            delivered += 1;
            if delivered >= limit {
                return Err(DmError::internal(format!(
                    "journal still busy after {delivered} deliveries"
                )));
            }
        }
        debug!(delivered, "journal idle");
        Ok(delivered)
    }

    /// Start `engine.worker_count` workers that poll the journal until
    /// `shutdown` flips to true or its sender is dropped.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let workers = self.ctx.config.engine.worker_count;
        info!(workers, "starting mutation workers");
        (0..workers)
            .map(|worker| {
                let engine = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { engine.worker_loop(worker, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = self.ctx.config.engine.poll_interval();
        debug!(worker, "mutation worker started");

        while !*shutdown.borrow() {
            let busy = match self.process_next().await {
                Ok(busy) => busy,
                Err(e) => {
                    log_error("mutation_engine", "process_next", &e.to_string(), None);
                    false
                }
            };
            if busy {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {},
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(worker, "mutation worker stopped");
    }
}
