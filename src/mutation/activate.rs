//! # Execution Callbacks
//!
//! Calls a running execution makes about itself.
//!
//! ## Overview
//!
//! - [`ActivateExecution`] swaps the scheduling token for the execution's own
//!   token and moves SCHEDULING to RUNNING
//! - [`FinishAttempt`] stores the reported result and moves RUNNING to STOPPING,
//!   where the distributor confirms the final outcome
//!
//! Both handlers authenticate with the execution's token and fail with
//! `PermissionDenied` on mismatch. A replay of an already applied call is a
//! no-op success.

use super::timeout::reset_execution_timeout;
use super::{HandlerContext, Mutation, RollForward};
use crate::error::{DmError, DmResult};
use crate::models::{Attempt, Execution, ExecutionAuth, GroupKey};
use crate::state_machine::{AttemptState, ExecutionState};
use crate::store::GroupTxn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

fn load_current(txn: &GroupTxn, auth: &ExecutionAuth) -> DmResult<Execution> {
    let attempt = txn.get::<Attempt>(&Attempt::key_for(&auth.id.attempt))?;
    let is_current = attempt
        .map(|a| a.state == AttemptState::Executing && a.cur_execution == auth.id.id)
        .unwrap_or(false);
    if !is_current {
        return Err(DmError::PermissionDenied(format!(
            "execution {} is not the current execution of its attempt",
            auth.id
        )));
    }
    txn.get::<Execution>(&Execution::key_for(&auth.id))?
        .ok_or_else(|| DmError::PermissionDenied(format!("execution {} does not exist", auth.id)))
}

/// Swap the scheduling token for one only the running process knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateExecution {
    pub auth: ExecutionAuth,
    pub new_token: String,
}

#[async_trait]
impl RollForward for ActivateExecution {
    fn root(&self) -> GroupKey {
        GroupKey::Attempt(self.auth.id.attempt.clone())
    }

    #[instrument(skip(self, ctx, txn), fields(execution = %self.auth.id))]
    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        if self.new_token.is_empty() {
            return Err(DmError::invalid_argument("activation token must not be empty"));
        }
        let mut execution = load_current(txn, &self.auth)?;
        match execution.state {
            ExecutionState::Scheduling if execution.token_matches(&self.auth.token) => {
                execution.modify_state(ExecutionState::Running, ctx.now())?;
                execution.token = Some(self.new_token.clone());
                txn.put(&execution)?;
                reset_execution_timeout(ctx, txn, &execution)?;
                info!("execution activated");
                Ok(vec![])
            }
            ExecutionState::Running if execution.token_matches(&self.new_token) => {
                debug!("execution already activated with this token");
                Ok(vec![])
            }
            state => Err(DmError::PermissionDenied(format!(
                "cannot activate execution {} in state {state} with the presented token",
                self.auth.id
            ))),
        }
    }
}

/// The execution reports its own result and gives up its token.
///
/// The execution moves to STOPPING; the distributor's final word (notification or
/// status poll) then finishes it, falling back to this reported result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishAttempt {
    pub auth: ExecutionAuth,
    pub result: serde_json::Value,
}

#[async_trait]
impl RollForward for FinishAttempt {
    fn root(&self) -> GroupKey {
        GroupKey::Attempt(self.auth.id.attempt.clone())
    }

    #[instrument(skip(self, ctx, txn), fields(execution = %self.auth.id))]
    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        let mut execution = load_current(txn, &self.auth)?;
        match execution.state {
            ExecutionState::Running if execution.token_matches(&self.auth.token) => {
                execution.token = None;
                execution.modify_state(ExecutionState::Stopping, ctx.now())?;
                execution.reported_result = Some(self.result.clone());
                txn.put(&execution)?;
                reset_execution_timeout(ctx, txn, &execution)?;
                info!("execution reported its result");
                Ok(vec![])
            }
            ExecutionState::Stopping if execution.reported_result.as_ref() == Some(&self.result) => {
                debug!("result already reported");
                Ok(vec![])
            }
            state => Err(DmError::PermissionDenied(format!(
                "cannot finish execution {} in state {state} with the presented token",
                self.auth.id
            ))),
        }
    }
}
