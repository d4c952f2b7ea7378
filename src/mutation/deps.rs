//! # Dependencies
//!
//! Dependency edges and their propagation.
//!
//! ## Overview
//!
//! An edge "A depends on B" is written twice: a [`FwdDep`] in A's attempt group
//! (owning a bit of A's dep map) and a [`BackDep`] in B's back-dep group. When B
//! reaches a terminal state, [`RecordCompletion`] walks B's back-deps in batches
//! and sends one [`AckFwdDep`] to each depender, which flips the bit. The last
//! bit to flip reschedules A.
//!
//! Edges arriving after B finished are acknowledged straight from
//! [`AddBackDep`], since B's completion has already been recorded.

use super::graph::{EnsureAttempt, MergeQuest};
use super::schedule::ScheduleExecution;
use super::timeout::reset_execution_timeout;
use super::{HandlerContext, Mutation, RollForward};
use crate::error::{DmError, DmResult};
use crate::models::{
    Attempt, AttemptId, BackDep, BackDepGroup, DepMap, Execution, ExecutionAuth, FwdDep, GroupKey,
    Quest, QuestId,
};
use crate::state_machine::{AttemptState, ExecutionState};
use crate::store::GroupTxn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

/// Load the attempt and execution `auth` names if it is still the RUNNING
/// current execution holding that token.
fn verify_running(txn: &GroupTxn, auth: &ExecutionAuth) -> DmResult<Option<(Attempt, Execution)>> {
    let Some(attempt) = txn.get::<Attempt>(&Attempt::key_for(&auth.id.attempt))? else {
        return Ok(None);
    };
    if attempt.state != AttemptState::Executing || attempt.cur_execution != auth.id.id {
        return Ok(None);
    }
    let Some(execution) = txn.get::<Execution>(&Execution::key_for(&auth.id))? else {
        return Ok(None);
    };
    if execution.state != ExecutionState::Running || !execution.token_matches(&auth.token) {
        return Ok(None);
    }
    Ok(Some((attempt, execution)))
}

/// Dependencies of `depender` that have no forward edge yet, in order, deduplicated.
fn new_dependencies(
    txn: &GroupTxn,
    depender: &AttemptId,
    deps: &[AttemptId],
) -> DmResult<Vec<AttemptId>> {
    let mut seen = BTreeSet::new();
    let mut fresh = Vec::new();
    for dep in deps {
        if dep == depender {
            return Err(DmError::invalid_argument(format!(
                "attempt {depender} cannot depend on itself"
            )));
        }
        if !seen.insert(dep.clone()) {
            continue;
        }
        if !txn.exists(&FwdDep::key_for(depender, dep))? {
            fresh.push(dep.clone());
        }
    }
    Ok(fresh)
}

/// A running execution blocks on unfinished dependencies.
///
/// The execution gives up its token and moves to STOPPING; the attempt gets a
/// fresh dep map with one bit per new edge. Quests the caller introduced are
/// created through [`MergeQuest`], all other dependees through [`EnsureAttempt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDeps {
    pub auth: ExecutionAuth,
    #[serde(default)]
    pub quests: Vec<Quest>,
    pub deps: Vec<AttemptId>,
}

#[async_trait]
impl RollForward for AddDeps {
    fn root(&self) -> GroupKey {
        GroupKey::Attempt(self.auth.id.attempt.clone())
    }

    #[instrument(skip(self, ctx, txn), fields(execution = %self.auth.id, deps = self.deps.len()))]
    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        let Some((mut attempt, mut execution)) = verify_running(txn, &self.auth)? else {
            debug!("execution no longer running with this token; ignoring");
            return Ok(vec![]);
        };
        let depender = attempt.id.clone();
        let fresh = new_dependencies(txn, &depender, &self.deps)?;
        if fresh.is_empty() {
            debug!("all dependencies already recorded");
            return Ok(vec![]);
        }

        let now = ctx.now();
        execution.token = None;
        execution.modify_state(ExecutionState::Stopping, now)?;
        reset_execution_timeout(ctx, txn, &execution)?;
        txn.put(&execution)?;

        let bits = u32::try_from(fresh.len())
            .map_err(|_| DmError::invalid_argument("too many dependencies"))?;
        attempt.dep_map = DepMap::new(bits);
        for (bit, dependee) in (0..bits).zip(&fresh) {
            txn.put(&FwdDep {
                depender: depender.clone(),
                dependee: dependee.clone(),
                bit_index: Some(bit),
                for_execution: attempt.cur_execution,
            })?;
        }
        txn.put(&attempt)?;
        info!(new_edges = fresh.len(), "execution blocked on dependencies");

        let mut follow_ups: Vec<Mutation> = fresh
            .iter()
            .map(|dependee| {
                AddBackDep {
                    dependee: dependee.clone(),
                    depender: depender.clone(),
                    needs_ack: true,
                }
                .into()
            })
            .collect();

        let mut by_quest: BTreeMap<&QuestId, BTreeSet<u32>> = BTreeMap::new();
        for dependee in &fresh {
            by_quest.entry(&dependee.quest).or_default().insert(dependee.id);
        }
        let introduced: BTreeSet<&QuestId> = self.quests.iter().map(|q| &q.id).collect();
        for quest in &self.quests {
            follow_ups.push(
                MergeQuest {
                    quest: quest.clone(),
                    attempts: by_quest.get(&quest.id).cloned().unwrap_or_default(),
                }
                .into(),
            );
        }
        for dependee in fresh.iter().filter(|d| !introduced.contains(&d.quest)) {
            follow_ups.push(
                EnsureAttempt {
                    attempt: dependee.clone(),
                }
                .into(),
            );
        }
        Ok(follow_ups)
    }
}

/// Record edges to attempts that are already finished.
///
/// The execution keeps running; the edges carry no dep-map bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddFinishedDeps {
    pub auth: ExecutionAuth,
    pub deps: Vec<AttemptId>,
}

#[async_trait]
impl RollForward for AddFinishedDeps {
    fn root(&self) -> GroupKey {
        GroupKey::Attempt(self.auth.id.attempt.clone())
    }

    #[instrument(skip(self, _ctx, txn), fields(execution = %self.auth.id, deps = self.deps.len()))]
    async fn roll_forward(
        &self,
        _ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        let Some((attempt, _)) = verify_running(txn, &self.auth)? else {
            debug!("execution no longer running with this token; ignoring");
            return Ok(vec![]);
        };
        let fresh = new_dependencies(txn, &attempt.id, &self.deps)?;
        let mut follow_ups = Vec::with_capacity(fresh.len());
        for dependee in fresh {
            txn.put(&FwdDep {
                depender: attempt.id.clone(),
                dependee: dependee.clone(),
                bit_index: None,
                for_execution: attempt.cur_execution,
            })?;
            follow_ups.push(
                AddBackDep {
                    dependee,
                    depender: attempt.id.clone(),
                    needs_ack: false,
                }
                .into(),
            );
        }
        Ok(follow_ups)
    }
}

/// Write the dependee side of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddBackDep {
    pub dependee: AttemptId,
    pub depender: AttemptId,
    /// Whether the depender is waiting on a dep-map bit for this edge
    pub needs_ack: bool,
}

#[async_trait]
impl RollForward for AddBackDep {
    fn root(&self) -> GroupKey {
        GroupKey::BackDeps(self.dependee.clone())
    }

    #[instrument(skip(self, _ctx, txn), fields(dependee = %self.dependee, depender = %self.depender))]
    async fn roll_forward(
        &self,
        _ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        if txn.exists(&BackDep::key_for(&self.dependee, &self.depender))? {
            debug!("back-dep already recorded");
            return Ok(vec![]);
        }
        let group = match txn.get::<BackDepGroup>(&BackDepGroup::key_for(&self.dependee))? {
            Some(group) => group,
            None => {
                let group = BackDepGroup::new(self.dependee.clone());
                txn.put(&group)?;
                group
            }
        };
        txn.put(&BackDep {
            dependee: self.dependee.clone(),
            depender: self.depender.clone(),
            propagated: group.attempt_finished,
        })?;

        if group.attempt_finished && self.needs_ack {
            debug!("dependee already finished; acknowledging immediately");
            return Ok(vec![AckFwdDep {
                depender: self.depender.clone(),
                dependee: self.dependee.clone(),
            }
            .into()]);
        }
        Ok(vec![])
    }
}

/// Mark an attempt finished in its back-dep group and notify dependers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCompletion {
    pub attempt: AttemptId,
}

#[async_trait]
impl RollForward for RecordCompletion {
    fn root(&self) -> GroupKey {
        GroupKey::BackDeps(self.attempt.clone())
    }

    #[instrument(skip(self, ctx, txn), fields(attempt = %self.attempt))]
    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        let mut group = txn
            .get::<BackDepGroup>(&BackDepGroup::key_for(&self.attempt))?
            .unwrap_or_else(|| BackDepGroup::new(self.attempt.clone()));
        if !group.attempt_finished {
            group.attempt_finished = true;
            txn.put(&group)?;
        }

        let batch = ctx.config.engine.completion_batch_size;
        let pending: Vec<BackDep> = txn
            .list::<BackDep>()?
            .into_iter()
            .filter(|b| !b.propagated)
            .collect();
        let more = pending.len() > batch;

        let mut follow_ups = Vec::new();
        for mut back_dep in pending.into_iter().take(batch) {
            back_dep.propagated = true;
            txn.put(&back_dep)?;
            follow_ups.push(
                AckFwdDep {
                    depender: back_dep.depender,
                    dependee: back_dep.dependee,
                }
                .into(),
            );
        }
        debug!(acked = follow_ups.len(), more, "propagating completion");
        if more {
            follow_ups.push(self.clone().into());
        }
        Ok(follow_ups)
    }
}

/// Flip the depender's dep-map bit for a finished dependee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFwdDep {
    pub depender: AttemptId,
    pub dependee: AttemptId,
}

#[async_trait]
impl RollForward for AckFwdDep {
    fn root(&self) -> GroupKey {
        GroupKey::Attempt(self.depender.clone())
    }

    #[instrument(skip(self, ctx, txn), fields(depender = %self.depender, dependee = %self.dependee))]
    async fn roll_forward(
        &self,
        ctx: &HandlerContext,
        txn: &mut GroupTxn,
    ) -> DmResult<Vec<Mutation>> {
        let Some(fwd) = txn.get::<FwdDep>(&FwdDep::key_for(&self.depender, &self.dependee))? else {
            debug!("no forward edge; ignoring");
            return Ok(vec![]);
        };
        let Some(mut attempt) = txn.get::<Attempt>(&Attempt::key_for(&self.depender))? else {
            return Ok(vec![]);
        };
        let Some(bit) = fwd.bit_index else {
            return Ok(vec![]);
        };
        if fwd.for_execution != attempt.cur_execution
            || !matches!(
                attempt.state,
                AttemptState::Executing | AttemptState::Waiting
            )
        {
            debug!(state = %attempt.state, "edge from an earlier execution; ignoring");
            return Ok(vec![]);
        }
        if !attempt.dep_map.set(bit) {
            debug!(bit, "bit outside the dep map; ignoring");
            return Ok(vec![]);
        }

        let mut follow_ups = Vec::new();
        if attempt.dep_map.all_set() && attempt.state == AttemptState::Waiting {
            info!("all dependencies finished; rescheduling");
            attempt.dep_map.clear();
            attempt.modify_state(AttemptState::Scheduling, ctx.now())?;
            follow_ups.push(
                ScheduleExecution {
                    attempt: attempt.id.clone(),
                }
                .into(),
            );
        }
        txn.put(&attempt)?;
        Ok(follow_ups)
    }
}
