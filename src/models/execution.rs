//! Execution: one concrete run of an Attempt on a Distributor.

use super::entity::Model;
use super::ids::{EntityKey, EntityKind, ExecutionId, GroupKey};
use super::quest::Timeouts;
use super::result::ExecutionResult;
use crate::error::{DmError, DmResult};
use crate::state_machine::{ExecutionState, StateMachineError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Credentials a running execution presents when calling back into DM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAuth {
    pub id: ExecutionId,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub state: ExecutionState,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Auth token; `None` once invalidated
    pub token: Option<String>,
    pub distributor_config_name: String,
    pub distributor_version: String,
    pub distributor_token: Option<String>,
    pub timeouts: Timeouts,
    /// Minimum seconds between status polls requested by the distributor
    pub pollback_secs: Option<u64>,
    pub result: Option<ExecutionResult>,
    /// Result reported by the execution itself via FinishAttempt
    pub reported_result: Option<serde_json::Value>,
}

impl Execution {
    pub fn new(
        id: ExecutionId,
        distributor_config_name: impl Into<String>,
        distributor_version: impl Into<String>,
        timeouts: Timeouts,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            state: ExecutionState::Scheduling,
            created: now,
            modified: now,
            token: Some(Self::generate_token()),
            distributor_config_name: distributor_config_name.into(),
            distributor_version: distributor_version.into(),
            distributor_token: None,
            timeouts,
            pollback_secs: None,
            result: None,
            reported_result: None,
        }
    }

    pub fn generate_token() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub fn auth(&self) -> Option<ExecutionAuth> {
        self.token.as_ref().map(|token| ExecutionAuth {
            id: self.id.clone(),
            token: token.clone(),
        })
    }

    pub fn token_matches(&self, token: &str) -> bool {
        self.token.as_deref() == Some(token)
    }

    pub fn modify_state(&mut self, target: ExecutionState, now: DateTime<Utc>) -> DmResult<()> {
        if self.state == target {
            return Ok(());
        }
        self.state.evolve(target)?;
        self.modified = now;
        Ok(())
    }

    /// Enter the terminal state matching `result`. The result is recorded exactly once.
    pub fn finish(&mut self, result: ExecutionResult, now: DateTime<Utc>) -> DmResult<()> {
        if self.result.is_some() {
            return Err(StateMachineError::ResultAlreadyRecorded {
                entity: "execution",
                id: self.id.to_string(),
            }
            .into());
        }
        let target = if result.is_abnormal() {
            ExecutionState::AbnormalFinished
        } else {
            ExecutionState::Finished
        };
        self.modify_state(target, now)?;
        self.token = None;
        self.result = Some(result);
        Ok(())
    }

    /// Timeout for the current phase, if the quest configured one.
    pub fn phase_timeout(&self) -> DmResult<Option<TimeDelta>> {
        let secs = match self.state {
            ExecutionState::Scheduling => self.timeouts.start_secs,
            ExecutionState::Running => self.timeouts.run_secs,
            ExecutionState::Stopping => self.timeouts.stop_secs,
            ExecutionState::Finished | ExecutionState::AbnormalFinished => 0,
        };
        if secs == 0 {
            return Ok(None);
        }
        seconds(secs)
            .map(Some)
            .ok_or_else(|| DmError::invalid_argument(format!("{} timeout of {secs}s is out of range", self.state)))
    }

    /// Minimum delay before the next status poll, if the distributor asked for one.
    pub fn pollback(&self) -> DmResult<Option<TimeDelta>> {
        self.pollback_secs
            .map(|secs| {
                seconds(secs).ok_or_else(|| {
                    DmError::DistributorError(format!("pollback of {secs}s is out of range"))
                })
            })
            .transpose()
    }

    pub fn key_for(id: &ExecutionId) -> EntityKey {
        EntityKey::new(
            GroupKey::Attempt(id.attempt.clone()),
            EntityKind::Execution,
            format!("{:08x}", id.id),
        )
    }
}

fn seconds(secs: u64) -> Option<TimeDelta> {
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

impl Model for Execution {
    const KIND: EntityKind = EntityKind::Execution;

    fn key(&self) -> EntityKey {
        Self::key_for(&self.id)
    }
}
