//! Quest: the immutable job definition every Attempt runs.

use super::entity::Model;
use super::ids::{EntityKey, EntityKind, GroupKey, QuestId};
use crate::error::{DmError, DmResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

const QUEST_ID_HEX_LEN: usize = 32;

/// Upper bound for any per-phase timeout: 30 days
pub const MAX_PHASE_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Maximum retries per retryable abnormal kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub failed: u32,
    pub crashed: u32,
    pub expired: u32,
    pub timed_out: u32,
}

/// Per-phase execution timeouts in seconds; 0 disables the phase timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub start_secs: u64,
    pub run_secs: u64,
    pub stop_secs: u64,
}

impl Timeouts {
    pub fn validate(&self) -> DmResult<()> {
        for (phase, secs) in [
            ("start_secs", self.start_secs),
            ("run_secs", self.run_secs),
            ("stop_secs", self.stop_secs),
        ] {
            if secs > MAX_PHASE_TIMEOUT_SECS {
                return Err(DmError::invalid_argument(format!(
                    "timeouts.{phase} = {secs} exceeds the maximum of {MAX_PHASE_TIMEOUT_SECS}s"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestMeta {
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
}

/// Everything that determines a quest's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestDesc {
    pub distributor_config_name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub distributor_parameters: serde_json::Value,
    #[serde(default)]
    pub meta: QuestMeta,
}

impl QuestDesc {
    pub fn new(distributor_config_name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            distributor_config_name: distributor_config_name.into(),
            parameters,
            distributor_parameters: serde_json::Value::Object(Default::default()),
            meta: QuestMeta::default(),
        }
    }

    pub fn validate(&self) -> DmResult<()> {
        if self.distributor_config_name.is_empty() {
            return Err(DmError::invalid_argument(
                "quest descriptor is missing distributor_config_name",
            ));
        }
        if !(self.parameters.is_object() || self.parameters.is_null()) {
            return Err(DmError::invalid_argument(
                "quest parameters must be a JSON object",
            ));
        }
        self.meta.timeouts.validate()
    }

    /// Content-derived id: hex SHA-256 of the canonical JSON, truncated.
    ///
    /// `serde_json` maps are ordered, so serializing through `Value` yields the
    /// same bytes regardless of the caller's key order.
    pub fn quest_id(&self) -> DmResult<QuestId> {
        let canonical = serde_json::to_vec(&serde_json::to_value(self)?)?;
        let digest = hex::encode(Sha256::digest(&canonical));
        QuestId::new(&digest[..QUEST_ID_HEX_LEN])
    }
}

/// Which template (and version) produced a quest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quest {
    pub id: QuestId,
    pub desc: QuestDesc,
    #[serde(default)]
    pub built_by: BTreeSet<TemplateSpec>,
    pub created: DateTime<Utc>,
}

impl Quest {
    pub fn new(desc: QuestDesc, now: DateTime<Utc>) -> DmResult<Self> {
        desc.validate()?;
        Ok(Self {
            id: desc.quest_id()?,
            desc,
            built_by: BTreeSet::new(),
            created: now,
        })
    }

    pub fn with_built_by(mut self, spec: TemplateSpec) -> Self {
        self.built_by.insert(spec);
        self
    }

    /// Whether every template in `other` is already recorded here.
    pub fn has_provenance_of(&self, other: &Quest) -> bool {
        other.built_by.is_subset(&self.built_by)
    }

    /// Merge provenance; returns true if anything changed.
    pub fn merge_built_by(&mut self, other: &BTreeSet<TemplateSpec>) -> bool {
        let before = self.built_by.len();
        self.built_by.extend(other.iter().cloned());
        self.built_by.len() != before
    }

    pub fn key_for(id: &QuestId) -> EntityKey {
        EntityKey::singleton(GroupKey::Quest(id.clone()), EntityKind::Quest)
    }
}

impl Model for Quest {
    const KIND: EntityKind = EntityKind::Quest;

    fn key(&self) -> EntityKey {
        Self::key_for(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quest_id_is_content_derived() {
        let a = QuestDesc::new("swarming", json!({"b": 1, "a": [1, 2]}));
        let b = QuestDesc::new("swarming", json!({"a": [1, 2], "b": 1}));
        let c = QuestDesc::new("swarming", json!({"a": [2, 1], "b": 1}));

        let id = a.quest_id().unwrap();
        assert_eq!(id.as_str().len(), 32);
        assert_eq!(id, b.quest_id().unwrap());
        assert_ne!(id, c.quest_id().unwrap());
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(QuestDesc::new("", json!({})).validate().is_err());
        assert!(QuestDesc::new("d", json!([1])).validate().is_err());
        assert!(QuestDesc::new("d", json!(null)).validate().is_ok());
    }

    #[test]
    fn test_timeouts_are_bounded() {
        let mut desc = QuestDesc::new("d", json!({}));
        desc.meta.timeouts.run_secs = MAX_PHASE_TIMEOUT_SECS;
        assert!(desc.validate().is_ok());

        desc.meta.timeouts.stop_secs = MAX_PHASE_TIMEOUT_SECS + 1;
        let err = desc.validate().unwrap_err();
        assert!(matches!(err, DmError::InvalidArgument(_)));
        assert!(err.to_string().contains("timeouts.stop_secs"));

        desc.meta.timeouts.stop_secs = 0;
        desc.meta.timeouts.start_secs = 1 << 50;
        assert!(Quest::new(desc, Utc::now()).is_err());
    }

    #[test]
    fn test_merge_built_by() {
        let now = Utc::now();
        let spec = TemplateSpec {
            name: "build".into(),
            version: "1".into(),
        };
        let mut stored = Quest::new(QuestDesc::new("d", json!({})), now).unwrap();
        let incoming = stored.clone().with_built_by(spec.clone());

        assert!(!stored.has_provenance_of(&incoming));
        assert!(stored.merge_built_by(&incoming.built_by));
        assert!(!stored.merge_built_by(&incoming.built_by));
        assert!(stored.has_provenance_of(&incoming));
    }
}
