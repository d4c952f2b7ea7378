//! # Scheduling
//!
//! Starts the next execution of a SCHEDULING attempt in two steps.
//!
//! ## Overview
//!
//! 1. [`ScheduleExecution`] commits the attempt as EXECUTING together with a new
//!    SCHEDULING [`Execution`] and its auth token, arms the SCHEDULING timeout
//!    and journals a [`RunExecution`].
//! 2. [`RunExecution`] calls `Distributor::run` with the persisted credentials
//!    before any transaction is open, then folds the outcome back into the
//!    attempt group.
//!
//! A failed commit in step 1 never reaches the distributor. A redelivered
//! `RunExecution` presents the persisted execution id and auth token again, so
//! a backend can recognise the repeat. Once an outcome is recorded, later
//! deliveries do not call `run` at all.

use super::finish::finish_execution;
use super::timeout::reset_execution_timeout;
use super::{HandlerContext, Mutation, RollForward};
use crate::distributor::{DistributorError, RunOutcome};
use crate::error::{DmError, DmResult};
use crate::models::{
    AbnormalStatus, Attempt, AttemptId, Execution, ExecutionId, ExecutionResult, GroupKey,
};
use crate::state_machine::{AttemptState, ExecutionState};
use crate::store::{fetch, GroupTxn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Start the next execution of a SCHEDULING attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub attempt: AttemptId,
}

#[async_trait]
impl RollForward for ScheduleExecution {
    fn root(&self) -> GroupKey {
        GroupKey::Attempt(self.attempt.clone())
    }

    #[instrument(skip(self, ctx, txn), fields(attempt = %self.attempt))]
    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        let Some(mut attempt) = txn.get::<Attempt>(&Attempt::key_for(&self.attempt))? else {
            warn!("schedule for unknown attempt; ignoring");
            return Ok(vec![]);
        };
        if attempt.state != AttemptState::Scheduling {
            debug!(state = %attempt.state, "attempt is not SCHEDULING; ignoring");
            return Ok(vec![]);
        }

        let quest = ctx.load_quest(&self.attempt.quest).await?;
        let now = ctx.now();
        let resolved = ctx
            .registry
            .make_distributor(&quest.desc.distributor_config_name);
        let version = match &resolved {
            Ok((_, version)) => version.clone(),
            Err(_) => String::new(),
        };

        attempt.cur_execution += 1;
        attempt.modify_state(AttemptState::Executing, now)?;
        let execution_id = self.attempt.execution(attempt.cur_execution);
        let execution = Execution::new(
            execution_id.clone(),
            quest.desc.distributor_config_name.clone(),
            version,
            quest.desc.meta.timeouts,
            now,
        );
        txn.put(&attempt)?;
        txn.put(&execution)?;

        if let Err(e) = resolved {
            warn!(error = %e, "no distributor for execution");
            return finish_execution(ctx, txn, &execution_id, rejection(&e)).await;
        }

        reset_execution_timeout(ctx, txn, &execution)?;
        debug!(execution = %execution_id, "execution created; run pending");
        Ok(vec![RunExecution {
            execution: execution_id,
            outcome: None,
        }
        .into()])
    }
}

/// What `Distributor::run` answered for one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    Started(RunOutcome),
    Rejected { reason: String },
}

fn rejection(reason: impl std::fmt::Display) -> ExecutionResult {
    ExecutionResult::abnormal(
        AbnormalStatus::Rejected,
        format!("rejected during scheduling with non-transient error: {reason}"),
    )
}

/// Hand a freshly scheduled execution to its distributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunExecution {
    pub execution: ExecutionId,
    /// Filled in by the distributor call before the group transaction opens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunResult>,
}

impl RunExecution {
    /// The execution, if it is still the attempt's current one, still
    /// SCHEDULING and not yet handed to its distributor.
    async fn pending_execution(&self, ctx: &HandlerContext) -> DmResult<Option<(Attempt, Execution)>> {
        let store = ctx.store.as_ref();
        let attempt = fetch::<Attempt>(store, &Attempt::key_for(&self.execution.attempt)).await?;
        let execution = fetch::<Execution>(store, &Execution::key_for(&self.execution)).await?;
        Ok(match (attempt, execution) {
            (Some(attempt), Some(execution))
                if attempt.state == AttemptState::Executing
                    && attempt.cur_execution == self.execution.id
                    && execution.state == ExecutionState::Scheduling
                    && execution.distributor_token.is_none() =>
            {
                Some((attempt, execution))
            }
            _ => None,
        })
    }

    /// Result of the last successful execution, handed to the distributor so it
    /// can re-execute incrementally.
    async fn previous_result(
        &self,
        ctx: &HandlerContext,
        attempt: &Attempt,
    ) -> DmResult<Option<serde_json::Value>> {
        let Some(previous) = attempt.last_successful_execution else {
            return Ok(None);
        };
        let id = self.execution.attempt.execution(previous);
        let execution = fetch::<Execution>(ctx.store.as_ref(), &Execution::key_for(&id)).await?;
        Ok(execution.and_then(|e| e.result.and_then(|r| r.data).or(e.reported_result)))
    }
}

#[async_trait]
impl RollForward for RunExecution {
    fn root(&self) -> GroupKey {
        GroupKey::Attempt(self.execution.attempt.clone())
    }

    #[instrument(skip(self, ctx), fields(execution = %self.execution))]
    async fn call_out(&self, ctx: &HandlerContext) -> DmResult<Option<Mutation>> {
        if self.outcome.is_some() {
            return Ok(None);
        }
        let Some((attempt, execution)) = self.pending_execution(ctx).await? else {
            debug!("execution already handed off or superseded; not calling run");
            return Ok(None);
        };
        let auth = execution
            .auth()
            .ok_or_else(|| DmError::internal(format!("execution {} has no auth token", execution.id)))?;

        let quest = ctx.load_quest(&self.execution.attempt.quest).await?;
        let previous = self.previous_result(ctx, &attempt).await?;
        let outcome = match ctx
            .registry
            .make_distributor(&execution.distributor_config_name)
        {
            Ok((distributor, _)) => distributor.run(&quest.desc, &auth, previous.as_ref()).await,
            Err(e) => Err(e),
        };

        let outcome = match outcome {
            Ok(run) => RunResult::Started(run),
            Err(DistributorError::Transient(msg)) => {
                warn!(error = %msg, "transient distributor error while scheduling");
                return Err(DmError::Transient(msg));
            }
            Err(e) => RunResult::Rejected {
                reason: e.to_string(),
            },
        };
        Ok(Some(
            RunExecution {
                execution: self.execution.clone(),
                outcome: Some(outcome),
            }
            .into(),
        ))
    }

    #[instrument(skip(self, ctx, txn), fields(execution = %self.execution))]
    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        let Some(outcome) = &self.outcome else {
            return Ok(vec![]);
        };
        let Some(mut execution) = txn.get::<Execution>(&Execution::key_for(&self.execution))? else {
            warn!("run outcome for unknown execution; ignoring");
            return Ok(vec![]);
        };
        if execution.state.is_terminal() || execution.distributor_token.is_some() {
            warn!(state = %execution.state, "execution moved on while its run was in flight; dropping outcome");
            return Ok(vec![]);
        }

        match outcome {
            RunResult::Started(run) => {
                execution.distributor_token = Some(run.token.clone());
                execution.pollback_secs = run.pollback_secs;
                txn.put(&execution)?;
                info!(token = %run.token, "execution scheduled");
                Ok(vec![])
            }
            RunResult::Rejected { reason } => {
                warn!(error = %reason, "distributor rejected execution");
                finish_execution(ctx, txn, &self.execution, rejection(reason)).await
            }
        }
    }
}
