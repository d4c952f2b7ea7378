//! # Graph Creation
//!
//! Mutations that write new quests and attempts on behalf of EnsureGraphData.
//!
//! [`MergeQuest`] runs in the quest's group: it creates the quest or merges
//! template provenance into the stored one, then fans out one [`EnsureAttempt`]
//! per requested attempt number. Each `EnsureAttempt` creates its attempt in
//! SCHEDULING exactly once and journals its first [`ScheduleExecution`].

use super::schedule::ScheduleExecution;
use super::{HandlerContext, Mutation, RollForward};
use crate::error::DmResult;
use crate::models::{Attempt, AttemptId, GroupKey, Quest};
use crate::store::GroupTxn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

/// Create a quest, or merge provenance into the existing one, then ensure the
/// listed attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeQuest {
    pub quest: Quest,
    #[serde(default)]
    pub attempts: BTreeSet<u32>,
}

#[async_trait]
impl RollForward for MergeQuest {
    fn root(&self) -> GroupKey {
        GroupKey::Quest(self.quest.id.clone())
    }

    #[instrument(skip(self, _ctx, txn), fields(quest = %self.quest.id))]
    async fn roll_forward(
        &self,
        _ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        match txn.get::<Quest>(&Quest::key_for(&self.quest.id))? {
            None => {
                info!("creating quest");
                txn.put(&self.quest)?;
            }
            Some(mut existing) => {
                if existing.merge_built_by(&self.quest.built_by) {
                    debug!("merging provenance");
                    txn.put(&existing)?;
                }
            }
        }

        Ok(self
            .attempts
            .iter()
            .map(|&id| {
                EnsureAttempt {
                    attempt: self.quest.id.attempt(id),
                }
                .into()
            })
            .collect())
    }
}

/// Create an attempt in SCHEDULING if it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureAttempt {
    pub attempt: AttemptId,
}

#[async_trait]
impl RollForward for EnsureAttempt {
    fn root(&self) -> GroupKey {
        GroupKey::Attempt(self.attempt.clone())
    }

    #[instrument(skip(self, ctx, txn), fields(attempt = %self.attempt))]
    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        if txn.exists(&Attempt::key_for(&self.attempt))? {
            return Ok(vec![]);
        }
        info!("creating attempt");
        txn.put(&Attempt::new(self.attempt.clone(), ctx.now()))?;
        Ok(vec![ScheduleExecution {
            attempt: self.attempt.clone(),
        }
        .into()])
    }
}
