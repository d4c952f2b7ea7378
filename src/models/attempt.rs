//! Attempt: one numbered instance of running a Quest.

use super::bitmap::DepMap;
use super::entity::Model;
use super::ids::{AttemptId, EntityKey, EntityKind, GroupKey};
use super::quest::RetryPolicy;
use super::result::{AbnormalStatus, ExecutionResult};
use crate::error::DmResult;
use crate::logging::log_attempt_transition;
use crate::state_machine::AttemptState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Abnormal finishes seen per retryable kind since the last success
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryState {
    pub failed: u32,
    pub crashed: u32,
    pub expired: u32,
    pub timed_out: u32,
}

impl RetryState {
    /// Count one abnormal finish and report whether the policy still allows a retry.
    ///
    /// The decision uses the count before this finish, so a limit of `K` grants `K`
    /// retries and the `K+1`-th finish is terminal.
    pub fn should_retry(&mut self, status: AbnormalStatus, policy: &RetryPolicy) -> bool {
        let (counter, max) = match status {
            AbnormalStatus::Failed => (&mut self.failed, policy.failed),
            AbnormalStatus::Crashed => (&mut self.crashed, policy.crashed),
            AbnormalStatus::Expired => (&mut self.expired, policy.expired),
            AbnormalStatus::TimedOut => (&mut self.timed_out, policy.timed_out),
            _ => return false,
        };
        let previous = *counter;
        *counter += 1;
        previous < max
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub state: AttemptState,
    /// Monotonic execution counter; 0 until the first ScheduleExecution
    pub cur_execution: u32,
    pub dep_map: DepMap,
    pub retry_state: RetryState,
    pub last_successful_execution: Option<u32>,
    pub result: Option<ExecutionResult>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Attempt {
    pub fn new(id: AttemptId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: AttemptState::Scheduling,
            cur_execution: 0,
            dep_map: DepMap::default(),
            retry_state: RetryState::default(),
            last_successful_execution: None,
            result: None,
            created: now,
            modified: now,
        }
    }

    /// The single guarded setter for `state`.
    ///
    /// Same-state is a no-op success and leaves `modified` untouched.
    pub fn modify_state(&mut self, target: AttemptState, now: DateTime<Utc>) -> DmResult<()> {
        if self.state == target {
            return Ok(());
        }
        let from = self.state;
        self.state.evolve(target)?;
        self.modified = now;
        log_attempt_transition(
            &self.id.to_string(),
            &from.to_string(),
            &target.to_string(),
            Some(self.cur_execution),
            now,
        );
        Ok(())
    }

    pub fn key_for(id: &AttemptId) -> EntityKey {
        EntityKey::singleton(GroupKey::Attempt(id.clone()), EntityKind::Attempt)
    }
}

impl Model for Attempt {
    const KIND: EntityKind = EntityKind::Attempt;

    fn key(&self) -> EntityKey {
        Self::key_for(&self.id)
    }
}
