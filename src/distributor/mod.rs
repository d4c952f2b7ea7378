//! # Distributor Contract
//!
//! A distributor runs executions on some backend (a swarm, a batch system, a
//! local process pool). DM only sees this trait; backend semantics stay behind it.
//!
//! Every call is classified by its error: [`DistributorError::Transient`] makes
//! the calling mutation redeliver later with no state change, while
//! [`DistributorError::Permanent`] becomes an abnormal finish.

use crate::config::DistributorConfig;
use crate::models::{ExecutionAuth, ExecutionId, ExecutionResult, QuestDesc};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributorError {
    #[error("Transient distributor error: {0}")]
    Transient(String),
    #[error("Permanent distributor error: {0}")]
    Permanent(String),
}

impl DistributorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type DistributorResult<T> = Result<T, DistributorError>;

/// What a successful `run` hands back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Backend handle used for `cancel` and `get_status`
    pub token: String,
    /// Minimum seconds between status polls; `None` leaves it to DM
    pub pollback_secs: Option<u64>,
}

/// A push notification from the backend about one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub execution: ExecutionId,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[async_trait]
pub trait Distributor: Send + Sync {
    /// Start an execution. `previous` is the last successful result of the attempt.
    async fn run(
        &self,
        desc: &QuestDesc,
        auth: &ExecutionAuth,
        previous: Option<&serde_json::Value>,
    ) -> DistributorResult<RunOutcome>;

    async fn cancel(&self, desc: &QuestDesc, token: &str) -> DistributorResult<()>;

    /// Terminal outcome if the backend knows it, `None` while still in flight.
    async fn get_status(
        &self,
        desc: &QuestDesc,
        token: &str,
    ) -> DistributorResult<Option<ExecutionResult>>;

    /// Interpret a push notification; `None` means it carried no terminal outcome.
    async fn handle_notification(
        &self,
        desc: &QuestDesc,
        notification: &Notification,
    ) -> DistributorResult<Option<ExecutionResult>>;

    /// Check backend-specific `distributor_parameters` before a quest is accepted.
    fn validate(&self, params: &serde_json::Value) -> DistributorResult<()>;
}

/// Builds distributors of one kind from their named configuration
pub trait DistributorFactory: Send + Sync {
    fn kind(&self) -> &str;

    fn build(&self, name: &str, config: &DistributorConfig) -> DistributorResult<Arc<dyn Distributor>>;
}
