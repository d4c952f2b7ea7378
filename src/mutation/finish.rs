//! # Finish Execution
//!
//! The central transition function: records an execution's terminal result and
//! decides what its attempt does next.
//!
//! ## Overview
//!
//! Reached from distributor notifications, status polls, timeouts and scheduling
//! rejections. The last three call [`finish_execution`] inline so the outcome
//! lands in the same transaction that discovered it.
//!
//! ## Outcomes
//!
//! - **Abnormal, retry budget left**: attempt back to SCHEDULING, next
//!   [`ScheduleExecution`] journaled
//! - **Abnormal, budget spent**: attempt ABNORMAL_FINISHED, dependers notified
//!   through [`RecordCompletion`]
//! - **Normal, no dependencies**: attempt FINISHED, dependers notified
//! - **Normal, dependencies resolved meanwhile**: rerun with them in place
//! - **Normal, dependencies outstanding**: attempt WAITING
//!
//! A normal finish outside STOPPING is coerced to `FAILED`. A normal result
//! without data falls back to what the execution reported via FinishAttempt.

use super::deps::RecordCompletion;
use super::schedule::ScheduleExecution;
use super::timeout::reset_execution_timeout;
use super::{HandlerContext, Mutation, RollForward};
use crate::error::DmResult;
use crate::models::{
    AbnormalStatus, Attempt, Execution, ExecutionId, ExecutionResult, GroupKey, RetryState,
};
use crate::state_machine::{AttemptState, ExecutionState};
use crate::store::GroupTxn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishExecution {
    pub execution: ExecutionId,
    pub result: ExecutionResult,
}

#[async_trait]
impl RollForward for FinishExecution {
    fn root(&self) -> GroupKey {
        GroupKey::Attempt(self.execution.attempt.clone())
    }

    #[instrument(skip(self, ctx, txn), fields(execution = %self.execution, abnormal = self.result.is_abnormal()))]
    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        finish_execution(ctx, txn, &self.execution, self.result.clone()).await
    }
}

pub(crate) async fn finish_execution(
    ctx: &HandlerContext,
    txn: &mut GroupTxn,
    id: &ExecutionId,
    result: ExecutionResult,
) -> DmResult<Vec<Mutation>> {
    let Some(mut attempt) = txn.get::<Attempt>(&Attempt::key_for(&id.attempt))? else {
        warn!(execution = %id, "finish for unknown attempt; ignoring");
        return Ok(vec![]);
    };
    if attempt.state != AttemptState::Executing || attempt.cur_execution != id.id {
        debug!(state = %attempt.state, current = attempt.cur_execution, "stale finish; ignoring");
        return Ok(vec![]);
    }
    let Some(mut execution) = txn.get::<Execution>(&Execution::key_for(id))? else {
        warn!(execution = %id, "finish for unknown execution; ignoring");
        return Ok(vec![]);
    };
    if execution.state.is_terminal() {
        debug!(state = %execution.state, "execution already finished; ignoring");
        return Ok(vec![]);
    }

    let outcome = apply_finish(ctx, &mut attempt, &mut execution, result).await;
    // the timeout is reset against whatever state the execution ended up in
    let reset = reset_execution_timeout(ctx, txn, &execution);
    let follow_ups = outcome?;
    reset?;

    txn.put(&execution)?;
    txn.put(&attempt)?;
    Ok(follow_ups)
}

async fn apply_finish(
    ctx: &HandlerContext,
    attempt: &mut Attempt,
    execution: &mut Execution,
    mut result: ExecutionResult,
) -> DmResult<Vec<Mutation>> {
    let now = ctx.now();

    if !result.is_abnormal() && execution.state != ExecutionState::Stopping {
        warn!(execution = %execution.id, state = %execution.state, "normal finish outside STOPPING");
        result = ExecutionResult::abnormal(
            AbnormalStatus::Failed,
            format!(
                "distributor finished execution while it was in the {} state",
                execution.state
            ),
        );
    }
    if !result.is_abnormal() && result.data.is_none() {
        result.data = execution.reported_result.clone();
    }
    execution.finish(result.clone(), now)?;

    if let Some(abnormal) = &result.abnormal_finish {
        let quest = ctx.load_quest(&attempt.id.quest).await?;
        if attempt
            .retry_state
            .should_retry(abnormal.status, &quest.desc.meta.retry)
        {
            info!(
                attempt = %attempt.id,
                status = %abnormal.status,
                retry_state = ?attempt.retry_state,
                "abnormal finish; retrying"
            );
            attempt.dep_map.clear();
            attempt.modify_state(AttemptState::Scheduling, now)?;
            return Ok(vec![ScheduleExecution {
                attempt: attempt.id.clone(),
            }
            .into()]);
        }

        info!(attempt = %attempt.id, status = %abnormal.status, reason = %abnormal.reason, "attempt finished abnormally");
        attempt.result = Some(result);
        attempt.modify_state(AttemptState::AbnormalFinished, now)?;
        return Ok(vec![RecordCompletion {
            attempt: attempt.id.clone(),
        }
        .into()]);
    }

    attempt.last_successful_execution = Some(execution.id.id);
    attempt.retry_state = RetryState::default();

    if attempt.dep_map.is_empty() {
        info!(attempt = %attempt.id, "attempt finished");
        attempt.result = Some(result);
        attempt.modify_state(AttemptState::Finished, now)?;
        Ok(vec![RecordCompletion {
            attempt: attempt.id.clone(),
        }
        .into()])
    } else if attempt.dep_map.all_set() {
        // dependencies resolved while this execution ran; rerun with them in place
        attempt.dep_map.clear();
        attempt.modify_state(AttemptState::Scheduling, now)?;
        Ok(vec![ScheduleExecution {
            attempt: attempt.id.clone(),
        }
        .into()])
    } else {
        debug!(
            attempt = %attempt.id,
            resolved = attempt.dep_map.count_set(),
            total = attempt.dep_map.size(),
            "waiting on dependencies"
        );
        attempt.modify_state(AttemptState::Waiting, now)?;
        Ok(vec![])
    }
}
