//! # Execution Timeouts
//!
//! One named delayed mutation per attempt group tracks the current execution's
//! phase deadline.
//!
//! ## Overview
//!
//! Entering SCHEDULING, RUNNING or STOPPING re-arms the deadline. Reaching a
//! terminal state, or a phase without a configured timeout, cancels it. When a
//! deadline fires:
//!
//! - **SCHEDULING / RUNNING**: the backend job is cancelled (best effort) and the
//!   execution finishes as `TIMED_OUT`
//! - **STOPPING**: the distributor is polled for a final status. Without one the
//!   poll is re-armed with a doubling delay, floored by the distributor's
//!   pollback hint, until `timeouts.max_status_polls` is spent
//!
//! Cancel and status calls happen in [`RollForward::call_out`], before the
//! attempt group's transaction opens. A polled status travels into
//! `roll_forward` on the mutation itself.

use super::finish::finish_execution;
use super::{HandlerContext, Mutation, RollForward};
use crate::error::{DmError, DmResult};
use crate::models::{
    AbnormalStatus, Attempt, Execution, ExecutionId, ExecutionResult, GroupKey, QuestDesc,
};
use crate::state_machine::{AttemptState, ExecutionState};
use crate::store::{fetch, GroupTxn};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub const TIMEOUT_MUTATION_NAME: &str = "timeout";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutExecution {
    pub execution: ExecutionId,
    /// Phase the deadline was armed for
    pub state: ExecutionState,
    pub deadline: DateTime<Utc>,
    /// GetStatus polls already spent while STOPPING
    #[serde(default)]
    pub status_polls: u32,
    /// Final status reported by the distributor, polled before the group
    /// transaction opened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polled_status: Option<ExecutionResult>,
}

/// `now + delay`, or an error when the deadline is past chrono's range.
pub(crate) fn deadline_after(now: DateTime<Utc>, delay: TimeDelta) -> DmResult<DateTime<Utc>> {
    now.checked_add_signed(delay).ok_or_else(|| {
        DmError::invalid_argument(format!("deadline {delay} after {now} is out of range"))
    })
}

/// Arm or cancel the phase timeout for `execution` as it stands in `txn`.
pub(crate) fn reset_execution_timeout(
    ctx: &HandlerContext,
    txn: &mut GroupTxn,
    execution: &Execution,
) -> DmResult<()> {
    match execution.phase_timeout()? {
        Some(timeout) => {
            let deadline = deadline_after(ctx.now(), timeout)?;
            debug!(execution = %execution.id, state = %execution.state, %deadline, "arming execution timeout");
            let mutation = Mutation::from(TimeoutExecution {
                execution: execution.id.clone(),
                state: execution.state,
                deadline,
                status_polls: 0,
                polled_status: None,
            });
            txn.put_named(TIMEOUT_MUTATION_NAME, mutation.to_entry()?);
        }
        None => txn.cancel_named(TIMEOUT_MUTATION_NAME),
    }
    Ok(())
}

impl TimeoutExecution {
    fn is_current(&self, attempt: &Attempt, execution: &Execution) -> bool {
        attempt.state == AttemptState::Executing
            && attempt.cur_execution == self.execution.id
            && execution.state == self.state
            && !execution.state.is_terminal()
    }

    async fn poll_status(
        &self,
        ctx: &HandlerContext,
        desc: &QuestDesc,
        execution: &Execution,
    ) -> Option<ExecutionResult> {
        let Some(token) = execution.distributor_token.as_deref() else {
            return None;
        };
        let distributor = match ctx
            .registry
            .make_distributor(&execution.distributor_config_name)
        {
            Ok((distributor, _)) => distributor,
            Err(e) => {
                warn!(execution = %execution.id, error = %e, "cannot resolve distributor for status poll");
                return None;
            }
        };
        match distributor.get_status(desc, token).await {
            Ok(status) => status,
            Err(e) => {
                warn!(execution = %execution.id, error = %e, "status poll failed");
                None
            }
        }
    }

    async fn cancel_best_effort(&self, ctx: &HandlerContext, desc: &QuestDesc, execution: &Execution) {
        let Some(token) = execution.distributor_token.as_deref() else {
            return;
        };
        if let Ok((distributor, _)) = ctx
            .registry
            .make_distributor(&execution.distributor_config_name)
        {
            if let Err(e) = distributor.cancel(desc, token).await {
                warn!(execution = %execution.id, error = %e, "cancel after timeout failed");
            }
        }
    }
}

#[async_trait]
impl RollForward for TimeoutExecution {
    fn root(&self) -> GroupKey {
        GroupKey::Attempt(self.execution.attempt.clone())
    }

    fn process_after(&self) -> Option<DateTime<Utc>> {
        Some(self.deadline)
    }

    async fn call_out(&self, ctx: &HandlerContext) -> DmResult<Option<Mutation>> {
        if self.polled_status.is_some() {
            return Ok(None);
        }
        let store = ctx.store.as_ref();
        let attempt = fetch::<Attempt>(store, &Attempt::key_for(&self.execution.attempt)).await?;
        let execution = fetch::<Execution>(store, &Execution::key_for(&self.execution)).await?;
        let (Some(attempt), Some(execution)) = (attempt, execution) else {
            return Ok(None);
        };
        if !self.is_current(&attempt, &execution) {
            return Ok(None);
        }

        let quest = ctx.load_quest(&self.execution.attempt.quest).await?;
        match self.state {
            ExecutionState::Scheduling | ExecutionState::Running => {
                self.cancel_best_effort(ctx, &quest.desc, &execution).await;
                Ok(None)
            }
            ExecutionState::Stopping => Ok(self
                .poll_status(ctx, &quest.desc, &execution)
                .await
                .map(|status| {
                    Mutation::from(TimeoutExecution {
                        polled_status: Some(status),
                        ..self.clone()
                    })
                })),
            ExecutionState::Finished | ExecutionState::AbnormalFinished => Ok(None),
        }
    }

    #[instrument(skip(self, ctx, txn), fields(execution = %self.execution, state = %self.state))]
    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        let attempt = txn.get::<Attempt>(&Attempt::key_for(&self.execution.attempt))?;
        let execution = txn.get::<Execution>(&Execution::key_for(&self.execution))?;
        let (Some(attempt), Some(execution)) = (attempt, execution) else {
            debug!("timeout for unknown execution; ignoring");
            return Ok(vec![]);
        };
        if !self.is_current(&attempt, &execution) {
            debug!(current = %execution.state, "stale timeout; ignoring");
            return Ok(vec![]);
        }

        match self.state {
            ExecutionState::Scheduling | ExecutionState::Running => {
                info!("execution timed out");
                let result = ExecutionResult::abnormal(
                    AbnormalStatus::TimedOut,
                    format!("DM timeout ({})", self.state),
                );
                finish_execution(ctx, txn, &self.execution, result).await
            }
            ExecutionState::Stopping => {
                if let Some(result) = self.polled_status.clone() {
                    return finish_execution(ctx, txn, &self.execution, result).await;
                }

                let timeouts = &ctx.config.timeouts;
                if self.status_polls < timeouts.max_status_polls {
                    let mut delay = timeouts.status_poll_delay(self.status_polls);
                    if let Some(pollback) = execution.pollback()? {
                        delay = delay.max(pollback);
                    }
                    let retry = Mutation::from(TimeoutExecution {
                        execution: self.execution.clone(),
                        state: self.state,
                        deadline: deadline_after(ctx.now(), delay)?,
                        status_polls: self.status_polls + 1,
                        polled_status: None,
                    });
                    debug!(polls = self.status_polls + 1, "status unknown; polling again later");
                    txn.put_named(TIMEOUT_MUTATION_NAME, retry.to_entry()?);
                    return Ok(vec![]);
                }

                info!(polls = self.status_polls, "execution never reported a final status");
                let result = ExecutionResult::abnormal(
                    AbnormalStatus::TimedOut,
                    format!(
                        "DM timeout ({}): no status after {} polls",
                        self.state, self.status_polls
                    ),
                );
                finish_execution(ctx, txn, &self.execution, result).await
            }
            ExecutionState::Finished | ExecutionState::AbnormalFinished => Ok(vec![]),
        }
    }
}
