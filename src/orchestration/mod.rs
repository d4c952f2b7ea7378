//! # Orchestration
//!
//! Client-facing entry points layered over the mutation engine.
//!
//! ## Core Components
//!
//! - **DmService**: execution calls, distributor notifications, graph reports
//! - **EnsureGraphData**: reconciles requested quests, attempts and dependencies
//!   with the graph, blocking the calling execution when needed
//! - **Graph walk**: bounded, parallel, read-only report of graph state
//! - **Templates**: configuration-defined quest templates
//! - **ACL**: reader/writer group checks for callers without an execution token

pub mod acl;
pub mod ensure_graph_data;
pub mod graph_walk;
pub mod service;
pub mod templates;

pub use acl::{Access, AclChecker, Identity};
pub use ensure_graph_data::{
    EnsureGraphDataRequest, EnsureGraphDataResponse, TemplateError, TemplateInstance,
};
pub use graph_walk::{walk_graph, AttemptNode, GraphData, IncludeOptions, QuestNode, WalkLimits};
pub use service::DmService;
pub use templates::{StaticTemplates, TemplateRenderer};
