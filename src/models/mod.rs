//! # Graph Models
//!
//! Persisted entities of the dependency graph and their state-transition guards.
//! Each entity knows its own [`EntityKey`] through the [`Model`] trait, which is
//! what the store uses to keep it inside the right entity group.

pub mod attempt;
pub mod bitmap;
pub mod dependency;
pub mod entity;
pub mod execution;
pub mod ids;
pub mod quest;
pub mod result;

pub use attempt::{Attempt, RetryState};
pub use bitmap::DepMap;
pub use dependency::{BackDep, BackDepGroup, FwdDep};
pub use entity::Model;
pub use execution::{Execution, ExecutionAuth};
pub use ids::{AttemptId, EntityKey, EntityKind, ExecutionId, FwdEdge, GroupKey, QuestId};
pub use quest::{
    Quest, QuestDesc, QuestMeta, RetryPolicy, TemplateSpec, Timeouts, MAX_PHASE_TIMEOUT_SECS,
};
pub use result::{AbnormalFinish, AbnormalStatus, ExecutionResult};
