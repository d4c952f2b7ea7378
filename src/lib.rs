#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # DM Core
//!
//! Rust core of DM, a job-dependency orchestrator.
//!
//! ## Overview
//!
//! Clients declare units of work (**quests**), request numbered instances of
//! them (**attempts**) and declare dependencies between attempts. DM drives each
//! attempt through one or more **executions** on a pluggable backend (a
//! **distributor**), retries failures according to the quest's policy and
//! reschedules dependers once everything they wait on has finished.
//!
//! ## Architecture
//!
//! State lives in entity groups (one per quest, per attempt and per attempt's
//! back-dependencies). Each state change is a **mutation** that runs inside one
//! group transaction and may emit follow-on mutations into a journal. Chains of
//! mutations replace cross-group transactions; every handler checks its guard
//! first, so at-least-once delivery is safe.
//!
//! ## Module Organization
//!
//! - [`models`] - Quests, attempts, executions, dependency edges and their keys
//! - [`state_machine`] - Attempt and execution transition tables
//! - [`store`] - Group-transactional storage and the mutation journal
//! - [`mutation`] - Mutation handlers and the engine that delivers them
//! - [`distributor`] - The distributor plugin contract
//! - [`registry`] - Distributor resolution by configuration name
//! - [`orchestration`] - Client-facing service, EnsureGraphData and graph walks
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup and domain log helpers
//! - [`error`] - Crate-wide error taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dm_core::{
//!     Distributor, DistributorRegistry, DmConfig, DmResult, DmService, EnsureGraphDataRequest,
//!     Identity, MemoryGraphStore, QuestDesc, SystemClock,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! async fn submit(backend: Arc<dyn Distributor>) -> DmResult<()> {
//!     let mut config = DmConfig::default();
//!     config.acl.writer_groups.insert("dm-writers".to_string());
//!     let config = Arc::new(config);
//!
//!     let registry = Arc::new(DistributorRegistry::new(config.distributors.clone()));
//!     registry.register_instance("swarming", "1", backend);
//!     let service = DmService::from_config(
//!         config,
//!         Arc::new(MemoryGraphStore::new()),
//!         registry,
//!         Arc::new(SystemClock),
//!     );
//!
//!     let request = EnsureGraphDataRequest {
//!         quests: vec![QuestDesc::new("swarming", json!({"target": "//foo"}))],
//!         quest_attempts: vec![vec![1]],
//!         ..Default::default()
//!     };
//!     let ci = Identity::new("ci", ["dm-writers"]);
//!     let response = service.ensure_graph_data(&ci, request).await?;
//!     assert!(response.accepted);
//!
//!     // schedules attempt 1 and hands it to the backend
//!     service.engine().run_until_idle().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib                          # Unit tests
//! cargo test --features test-utils           # All tests
//! DATABASE_URL=... cargo test --features test-utils -- --ignored   # PostgreSQL
//! ```

pub mod config;
pub mod distributor;
pub mod error;
pub mod logging;
pub mod models;
pub mod mutation;
pub mod orchestration;
pub mod registry;
pub mod state_machine;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;
pub mod utils;

pub use config::{ConfigManager, DmConfig};
pub use distributor::{Distributor, DistributorError, DistributorFactory, Notification, RunOutcome};
pub use error::{DmError, DmResult};
pub use models::{
    AbnormalStatus, Attempt, AttemptId, Execution, ExecutionAuth, ExecutionId, ExecutionResult,
    Quest, QuestDesc, QuestId,
};
pub use mutation::{HandlerContext, Mutation, MutationEngine};
pub use orchestration::{DmService, EnsureGraphDataRequest, EnsureGraphDataResponse, Identity};
pub use registry::DistributorRegistry;
pub use state_machine::{AttemptState, ExecutionState};
pub use store::{GraphStore, MemoryGraphStore};
pub use utils::{Clock, ManualClock, SystemClock};
