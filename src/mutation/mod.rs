//! # Mutations
//!
//! Idempotent, transactionally-scoped state-transition functions.
//!
//! ## Overview
//!
//! A mutation names the entity group it runs in ([`RollForward::root`]) and rolls
//! that group forward inside one [`GroupTxn`]. It may emit follow-on mutations,
//! which are journaled atomically with the group's writes and later run in their
//! own group. Chains of mutations replace multi-group transactions:
//!
//! ```text
//! EnsureAttempt -> ScheduleExecution -> RunExecution -> (distributor) -> FinishExecution
//!     FinishExecution -> RecordCompletion -> AckFwdDep -> ScheduleExecution ...
//! ```
//!
//! ## Key Features
//!
//! - **Guard first**: every handler checks its precondition and exits early on
//!   stale or duplicate delivery, which makes at-least-once delivery safe
//! - **Serializable**: mutations are journaled as tagged JSON
//! - **No RPC under a transaction**: distributor calls happen in
//!   [`RollForward::call_out`] before the group transaction opens; their
//!   outcomes ride on the mutation into `roll_forward`
//! - **Named delayed mutations**: execution timeouts are registered per group
//!   under [`timeout::TIMEOUT_MUTATION_NAME`] and replaced or cancelled by name

pub mod activate;
pub mod deps;
pub mod engine;
pub mod finish;
pub mod graph;
pub mod schedule;
pub mod timeout;

use crate::config::DmConfig;
use crate::error::{DmError, DmResult};
use crate::models::{GroupKey, Quest, QuestId};
use crate::registry::DistributorRegistry;
use crate::store::{fetch, GraphStore, GroupTxn, JournalEntry, NewJournalEntry};
use crate::utils::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use activate::{ActivateExecution, FinishAttempt};
pub use deps::{AckFwdDep, AddBackDep, AddDeps, AddFinishedDeps, RecordCompletion};
pub use engine::MutationEngine;
pub use finish::FinishExecution;
pub use graph::{EnsureAttempt, MergeQuest};
pub use schedule::{RunExecution, RunResult, ScheduleExecution};
pub use timeout::TimeoutExecution;

/// Everything a handler may use besides its transaction
#[derive(Debug)]
pub struct HandlerContext {
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<DistributorRegistry>,
    pub store: Arc<dyn GraphStore>,
    pub config: Arc<DmConfig>,
}

impl HandlerContext {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Read a quest from its own group. Quests are immutable apart from
    /// provenance, so reading outside the handler's transaction is safe.
    pub async fn load_quest(&self, id: &QuestId) -> DmResult<Quest> {
        fetch::<Quest>(self.store.as_ref(), &Quest::key_for(id))
            .await?
            .ok_or_else(|| DmError::NotFound(format!("quest {id}")))
    }
}

#[async_trait]
pub trait RollForward: Send + Sync {
    /// The entity group this mutation runs in.
    fn root(&self) -> GroupKey;

    /// Earliest delivery time for delayed mutations.
    fn process_after(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// External calls made before the group transaction opens. Returns the
    /// mutation to roll forward with their outcomes filled in, or `None` to
    /// roll forward `self` unchanged.
    async fn call_out(&self, _ctx: &HandlerContext) -> DmResult<Option<Mutation>> {
        Ok(None)
    }

    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Mutation {
    ScheduleExecution(ScheduleExecution),
    RunExecution(RunExecution),
    FinishExecution(FinishExecution),
    TimeoutExecution(TimeoutExecution),
    ActivateExecution(ActivateExecution),
    FinishAttempt(FinishAttempt),
    AddDeps(AddDeps),
    AddFinishedDeps(AddFinishedDeps),
    AddBackDep(AddBackDep),
    AckFwdDep(AckFwdDep),
    RecordCompletion(RecordCompletion),
    MergeQuest(MergeQuest),
    EnsureAttempt(EnsureAttempt),
}

macro_rules! mutation_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Mutation {
                fn from(m: $variant) -> Self {
                    Mutation::$variant(m)
                }
            }
        )*

        impl Mutation {
            pub fn name(&self) -> &'static str {
                match self {
                    $(Mutation::$variant(_) => stringify!($variant),)*
                }
            }

            fn handler(&self) -> &dyn RollForward {
                match self {
                    $(Mutation::$variant(m) => m,)*
                }
            }
        }
    };
}

mutation_from!(
    ScheduleExecution,
    RunExecution,
    FinishExecution,
    TimeoutExecution,
    ActivateExecution,
    FinishAttempt,
    AddDeps,
    AddFinishedDeps,
    AddBackDep,
    AckFwdDep,
    RecordCompletion,
    MergeQuest,
    EnsureAttempt,
);

impl Mutation {
    pub fn root(&self) -> GroupKey {
        self.handler().root()
    }

    pub fn process_after(&self) -> Option<DateTime<Utc>> {
        self.handler().process_after()
    }

    pub async fn call_out(&self, ctx: &HandlerContext) -> DmResult<Option<Mutation>> {
        self.handler().call_out(ctx).await
    }

    pub async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        if txn.root() != &self.root() {
            return Err(DmError::internal(format!(
                "{} for {} delivered to transaction on {}",
                self.name(),
                self.root(),
                txn.root()
            )));
        }
        self.handler().roll_forward(ctx, txn).await
    }

    pub fn to_entry(&self) -> DmResult<NewJournalEntry> {
        Ok(NewJournalEntry {
            root: self.root(),
            name: None,
            body: serde_json::to_value(self)?,
            process_after: self.process_after(),
        })
    }

    pub fn from_entry(entry: &JournalEntry) -> DmResult<Self> {
        Ok(serde_json::from_value(entry.body.clone())?)
    }
}
