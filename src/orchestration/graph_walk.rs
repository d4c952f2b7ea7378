//! # Graph Walk
//!
//! Read-only, breadth-first report of quests and attempts reachable from a set
//! of roots through forward dependencies.
//!
//! Each level's lookups fan out with `buffer_unordered` bounded by
//! `graph.max_concurrency`. Results are keyed by ordered maps and sorted before
//! truncation, so the same graph always yields the same report.

use crate::config::GraphConfig;
use crate::error::{DmError, DmResult};
use crate::models::{
    Attempt, AttemptId, ExecutionResult, FwdDep, GroupKey, Quest, QuestDesc, QuestId,
};
use crate::state_machine::AttemptState;
use crate::store::{fetch, fetch_all, GraphStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Caller-requested bounds; the configured limits always cap them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkLimits {
    /// Dependency levels to follow past the roots
    pub max_depth: usize,
    pub max_nodes: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncludeOptions {
    pub quest_data: bool,
    pub attempt_result: bool,
    /// List forward dependencies and follow them up to `max_depth`
    pub fwd_deps: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphData {
    pub quests: BTreeMap<QuestId, QuestNode>,
    /// Whether `max_nodes` cut the walk short
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestNode {
    /// The quest does not exist
    pub dne: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<QuestDesc>,
    pub attempts: BTreeMap<u32, AttemptNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptNode {
    pub dne: bool,
    pub state: Option<AttemptState>,
    pub cur_execution: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fwd_deps: Vec<AttemptId>,
}

impl AttemptNode {
    fn build(attempt: Option<Attempt>, fwd_deps: Vec<AttemptId>, include: IncludeOptions) -> Self {
        match attempt {
            None => Self {
                dne: true,
                ..Self::default()
            },
            Some(attempt) => Self {
                dne: false,
                state: Some(attempt.state),
                cur_execution: attempt.cur_execution,
                result: if include.attempt_result {
                    attempt.result
                } else {
                    None
                },
                modified: Some(attempt.modified),
                fwd_deps,
            },
        }
    }
}

impl GraphData {
    /// Look up one attempt in the report.
    pub fn attempt(&self, id: &AttemptId) -> Option<&AttemptNode> {
        self.quests.get(&id.quest)?.attempts.get(&id.id)
    }
}

/// Walk the graph from `roots` (quest id to attempt numbers).
pub async fn walk_graph(
    store: &dyn GraphStore,
    config: &GraphConfig,
    roots: &BTreeMap<QuestId, BTreeSet<u32>>,
    limits: &WalkLimits,
    include: IncludeOptions,
) -> DmResult<GraphData> {
    let max_depth = limits.max_depth.min(config.max_walk_depth);
    let max_nodes = limits
        .max_nodes
        .unwrap_or(config.max_walk_nodes)
        .min(config.max_walk_nodes);
    let concurrency = config.max_concurrency.max(1);

    let mut data = GraphData::default();
    let mut loaded_quests: BTreeSet<QuestId> = BTreeSet::new();
    let mut visited: BTreeSet<AttemptId> = BTreeSet::new();
    let mut frontier: Vec<AttemptId> = Vec::new();

    for (quest, attempts) in roots {
        data.quests.entry(quest.clone()).or_default();
        for &id in attempts {
            let attempt = quest.attempt(id);
            if visited.insert(attempt.clone()) {
                frontier.push(attempt);
            }
        }
    }

    let mut depth = 0;
    loop {
        let pending: Vec<QuestId> = data
            .quests
            .keys()
            .filter(|q| !loaded_quests.contains(*q))
            .cloned()
            .collect();
        let quests: Vec<(QuestId, Option<Quest>)> = stream::iter(pending)
            .map(|id| async move {
                let quest = fetch::<Quest>(store, &Quest::key_for(&id)).await?;
                Ok::<_, DmError>((id, quest))
            })
            .buffer_unordered(concurrency)
            .try_collect()
            .await?;
        for (id, quest) in quests {
            loaded_quests.insert(id.clone());
            let node = data.quests.entry(id).or_default();
            node.dne = quest.is_none();
            if include.quest_data {
                node.data = quest.map(|q| q.desc);
            }
        }

        if frontier.is_empty() {
            break;
        }

        let follow = include.fwd_deps;
        let mut level: Vec<(AttemptId, Option<Attempt>, Vec<AttemptId>)> =
            stream::iter(std::mem::take(&mut frontier))
                .map(|id| async move {
                    let attempt = fetch::<Attempt>(store, &Attempt::key_for(&id)).await?;
                    let mut deps = Vec::new();
                    if follow && attempt.is_some() {
                        deps = fetch_all::<FwdDep>(store, &GroupKey::Attempt(id.clone()))
                            .await?
                            .into_iter()
                            .map(|d| d.dependee)
                            .collect();
                        deps.sort();
                    }
                    Ok::<_, DmError>((id, attempt, deps))
                })
                .buffer_unordered(concurrency)
                .try_collect()
                .await?;
        level.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, attempt, deps) in level {
            if depth < max_depth {
                for dependee in &deps {
                    if visited.contains(dependee) {
                        continue;
                    }
                    if visited.len() >= max_nodes {
                        data.truncated = true;
                        break;
                    }
                    visited.insert(dependee.clone());
                    data.quests.entry(dependee.quest.clone()).or_default();
                    frontier.push(dependee.clone());
                }
            }
            let node = AttemptNode::build(attempt, deps, include);
            data.quests
                .entry(id.quest.clone())
                .or_default()
                .attempts
                .insert(id.id, node);
        }
        depth += 1;
    }

    debug!(
        quests = data.quests.len(),
        attempts = visited.len(),
        depth,
        truncated = data.truncated,
        "graph walk complete"
    );
    Ok(data)
}
