//! Dependency edges, stored once per side.

use super::entity::Model;
use super::ids::{AttemptId, EntityKey, EntityKind, FwdEdge, GroupKey};
use serde::{Deserialize, Serialize};

/// "depender depends on dependee", owned by the depender's attempt group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwdDep {
    pub depender: AttemptId,
    pub dependee: AttemptId,
    /// Bit in the depender's dep map; `None` for edges to already finished attempts
    pub bit_index: Option<u32>,
    /// Execution generation that registered the edge
    pub for_execution: u32,
}

impl FwdDep {
    pub fn edge(&self) -> FwdEdge {
        FwdEdge {
            from: self.depender.clone(),
            to: self.dependee.clone(),
        }
    }

    pub fn key_for(depender: &AttemptId, dependee: &AttemptId) -> EntityKey {
        EntityKey::new(
            GroupKey::Attempt(depender.clone()),
            EntityKind::FwdDep,
            dependee.to_string(),
        )
    }
}

impl Model for FwdDep {
    const KIND: EntityKind = EntityKind::FwdDep;

    fn key(&self) -> EntityKey {
        Self::key_for(&self.depender, &self.dependee)
    }
}

/// Per-dependee header of the back-dependency group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackDepGroup {
    pub dependee: AttemptId,
    pub attempt_finished: bool,
}

impl BackDepGroup {
    pub fn new(dependee: AttemptId) -> Self {
        Self {
            dependee,
            attempt_finished: false,
        }
    }

    pub fn key_for(dependee: &AttemptId) -> EntityKey {
        EntityKey::singleton(GroupKey::BackDeps(dependee.clone()), EntityKind::BackDepGroup)
    }
}

impl Model for BackDepGroup {
    const KIND: EntityKind = EntityKind::BackDepGroup;

    fn key(&self) -> EntityKey {
        Self::key_for(&self.dependee)
    }
}

/// Inverted edge owned by the dependee's back-dependency group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackDep {
    pub dependee: AttemptId,
    pub depender: AttemptId,
    /// Whether the depender has been told this dependee finished
    pub propagated: bool,
}

impl BackDep {
    pub fn edge(&self) -> FwdEdge {
        FwdEdge {
            from: self.depender.clone(),
            to: self.dependee.clone(),
        }
    }

    pub fn key_for(dependee: &AttemptId, depender: &AttemptId) -> EntityKey {
        EntityKey::new(
            GroupKey::BackDeps(dependee.clone()),
            EntityKind::BackDep,
            depender.to_string(),
        )
    }
}

impl Model for BackDep {
    const KIND: EntityKind = EntityKind::BackDep;

    fn key(&self) -> EntityKey {
        Self::key_for(&self.dependee, &self.depender)
    }
}
