use super::errors::{StateMachineError, StateMachineResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Attempt state definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    /// Waiting for an Execution to be created on a distributor
    Scheduling,
    /// An Execution is in flight
    Executing,
    /// The last Execution finished but forward dependencies are still outstanding
    Waiting,
    /// Finished with a normal result
    Finished,
    /// Finished with an AbnormalFinish after retries ran out
    AbnormalFinished,
}

impl AttemptState {
    /// Legal next states. Same-state transitions are handled by the caller.
    pub fn allowed_transitions(&self) -> &'static [AttemptState] {
        match self {
            Self::Scheduling => &[Self::Executing],
            Self::Executing => &[
                Self::Scheduling,
                Self::Waiting,
                Self::Finished,
                Self::AbnormalFinished,
            ],
            Self::Waiting => &[Self::Scheduling],
            Self::Finished => &[],
            // an operator-granted retry reopens the attempt
            Self::AbnormalFinished => &[Self::Scheduling],
        }
    }

    pub fn can_transition_to(&self, target: AttemptState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// Evolve into `target`, rejecting anything not in the transition table.
    pub fn evolve(&mut self, target: AttemptState) -> StateMachineResult<()> {
        if *self == target {
            return Ok(());
        }
        if !self.can_transition_to(target) {
            return Err(StateMachineError::InvalidTransition {
                entity: "attempt",
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        *self = target;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::AbnormalFinished)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduling => write!(f, "SCHEDULING"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Waiting => write!(f, "WAITING"),
            Self::Finished => write!(f, "FINISHED"),
            Self::AbnormalFinished => write!(f, "ABNORMAL_FINISHED"),
        }
    }
}

impl std::str::FromStr for AttemptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULING" => Ok(Self::Scheduling),
            "EXECUTING" => Ok(Self::Executing),
            "WAITING" => Ok(Self::Waiting),
            "FINISHED" => Ok(Self::Finished),
            "ABNORMAL_FINISHED" => Ok(Self::AbnormalFinished),
            _ => Err(format!("Invalid attempt state: {s}")),
        }
    }
}

impl Default for AttemptState {
    fn default() -> Self {
        Self::Scheduling
    }
}

/// Execution state definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Handed to the distributor, not yet activated by the running process
    Scheduling,
    /// Activated; the execution may call back into DM with its token
    Running,
    /// Token invalidated; waiting for the distributor to report the outcome
    Stopping,
    Finished,
    AbnormalFinished,
}

impl ExecutionState {
    pub fn allowed_transitions(&self) -> &'static [ExecutionState] {
        match self {
            Self::Scheduling => &[Self::Running, Self::AbnormalFinished],
            Self::Running => &[Self::Stopping, Self::AbnormalFinished],
            Self::Stopping => &[Self::Finished, Self::AbnormalFinished],
            Self::Finished | Self::AbnormalFinished => &[],
        }
    }

    pub fn can_transition_to(&self, target: ExecutionState) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn evolve(&mut self, target: ExecutionState) -> StateMachineResult<()> {
        if *self == target {
            return Ok(());
        }
        if !self.can_transition_to(target) {
            return Err(StateMachineError::InvalidTransition {
                entity: "execution",
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        *self = target;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::AbnormalFinished)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduling => write!(f, "SCHEDULING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Finished => write!(f, "FINISHED"),
            Self::AbnormalFinished => write!(f, "ABNORMAL_FINISHED"),
        }
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULING" => Ok(Self::Scheduling),
            "RUNNING" => Ok(Self::Running),
            "STOPPING" => Ok(Self::Stopping),
            "FINISHED" => Ok(Self::Finished),
            "ABNORMAL_FINISHED" => Ok(Self::AbnormalFinished),
            _ => Err(format!("Invalid execution state: {s}")),
        }
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::Scheduling
    }
}
