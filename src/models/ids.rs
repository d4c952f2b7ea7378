//! # Identity & Dependency Encoding
//!
//! Canonical addresses for quests, attempts, executions and dependency edges.
//!
//! ## Overview
//!
//! Every persisted entity lives inside exactly one entity group ([`GroupKey`]). The
//! store only guarantees atomicity within a group, so the key layout decides which
//! writes can happen together:
//!
//! - `quest:<quest>` holds the [`Quest`](super::Quest)
//! - `attempt:<attempt>` holds the Attempt, its Executions and its FwdDeps
//! - `backdeps:<attempt>` holds the BackDepGroup and BackDeps of a dependee
//!
//! Display forms are stable and round-trip through `FromStr`; they double as
//! storage keys.

use crate::error::{DmError, DmResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SEPARATOR: char = '|';
const MAX_QUEST_ID_LEN: usize = 128;

/// Identifier of a Quest. Content-derived for quests built from descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QuestId(String);

impl QuestId {
    pub fn new(id: impl Into<String>) -> DmResult<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_QUEST_ID_LEN {
            return Err(DmError::invalid_argument(format!(
                "quest id must be 1..={MAX_QUEST_ID_LEN} characters, got {}",
                id.len()
            )));
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(DmError::invalid_argument(format!(
                "quest id {id:?} contains invalid character {bad:?}"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn attempt(&self, id: u32) -> AttemptId {
        AttemptId {
            quest: self.clone(),
            id,
        }
    }
}

impl TryFrom<String> for QuestId {
    type Error = DmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QuestId> for String {
    fn from(value: QuestId) -> Self {
        value.0
    }
}

impl fmt::Display for QuestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for QuestId {
    type Err = DmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// One numbered Attempt of a Quest. Attempt numbers start at 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptId {
    pub quest: QuestId,
    pub id: u32,
}

impl AttemptId {
    pub fn new(quest: QuestId, id: u32) -> DmResult<Self> {
        if id == 0 {
            return Err(DmError::invalid_argument(format!(
                "attempt numbers start at 1 (quest {quest})"
            )));
        }
        Ok(Self { quest, id })
    }

    pub fn execution(&self, id: u32) -> ExecutionId {
        ExecutionId {
            attempt: self.clone(),
            id,
        }
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{:08x}", self.quest, self.id)
    }
}

impl FromStr for AttemptId {
    type Err = DmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (quest, id) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| DmError::invalid_argument(format!("malformed attempt id {s:?}")))?;
        Self::new(quest.parse()?, parse_hex_u32(id, s)?)
    }
}

/// One concrete run of an Attempt. Execution numbers start at 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId {
    pub attempt: AttemptId,
    pub id: u32,
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{:08x}", self.attempt, self.id)
    }
}

impl FromStr for ExecutionId {
    type Err = DmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (attempt, id) = s
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| DmError::invalid_argument(format!("malformed execution id {s:?}")))?;
        Ok(Self {
            attempt: attempt.parse()?,
            id: parse_hex_u32(id, s)?,
        })
    }
}

fn parse_hex_u32(field: &str, whole: &str) -> DmResult<u32> {
    if field.len() != 8 {
        return Err(DmError::invalid_argument(format!(
            "malformed numeric component in {whole:?}"
        )));
    }
    u32::from_str_radix(field, 16)
        .map_err(|_| DmError::invalid_argument(format!("malformed numeric component in {whole:?}")))
}

/// The unit of transactional consistency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum GroupKey {
    Quest(QuestId),
    Attempt(AttemptId),
    BackDeps(AttemptId),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quest(q) => write!(f, "quest:{q}"),
            Self::Attempt(a) => write!(f, "attempt:{a}"),
            Self::BackDeps(a) => write!(f, "backdeps:{a}"),
        }
    }
}

impl FromStr for GroupKey {
    type Err = DmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("quest", rest)) => Ok(Self::Quest(rest.parse()?)),
            Some(("attempt", rest)) => Ok(Self::Attempt(rest.parse()?)),
            Some(("backdeps", rest)) => Ok(Self::BackDeps(rest.parse()?)),
            _ => Err(DmError::invalid_argument(format!("malformed group key {s:?}"))),
        }
    }
}

impl TryFrom<String> for GroupKey {
    type Error = DmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GroupKey> for String {
    fn from(value: GroupKey) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Quest,
    Attempt,
    Execution,
    FwdDep,
    BackDepGroup,
    BackDep,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quest => "quest",
            Self::Attempt => "attempt",
            Self::Execution => "execution",
            Self::FwdDep => "fwd_dep",
            Self::BackDepGroup => "back_dep_group",
            Self::BackDep => "back_dep",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = DmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quest" => Ok(Self::Quest),
            "attempt" => Ok(Self::Attempt),
            "execution" => Ok(Self::Execution),
            "fwd_dep" => Ok(Self::FwdDep),
            "back_dep_group" => Ok(Self::BackDepGroup),
            "back_dep" => Ok(Self::BackDep),
            _ => Err(DmError::invalid_argument(format!("unknown entity kind {s:?}"))),
        }
    }
}

/// Fully qualified address of one persisted entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub group: GroupKey,
    pub kind: EntityKind,
    /// Discriminator within (group, kind); empty for singleton entities
    pub id: String,
}

impl EntityKey {
    pub fn singleton(group: GroupKey, kind: EntityKind) -> Self {
        Self {
            group,
            kind,
            id: String::new(),
        }
    }

    pub fn new(group: GroupKey, kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            group,
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.kind, self.id)
    }
}

/// A dependency edge: `from` depends on `to`.
///
/// Stored twice: as a FwdDep in `from`'s attempt group and as a BackDep in `to`'s
/// back-dependency group. Both halves encode to the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FwdEdge {
    pub from: AttemptId,
    pub to: AttemptId,
}

impl FwdEdge {
    pub fn new(from: AttemptId, to: AttemptId) -> DmResult<Self> {
        if from == to {
            return Err(DmError::invalid_argument(format!(
                "attempt {from} cannot depend on itself"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn encode(&self) -> String {
        format!("{}{SEPARATOR}{}", self.from, self.to)
    }

    pub fn decode(encoded: &str) -> DmResult<Self> {
        let parts: Vec<&str> = encoded.split(SEPARATOR).collect();
        if parts.len() != 4 {
            return Err(DmError::invalid_argument(format!(
                "malformed dependency edge {encoded:?}"
            )));
        }
        let from = AttemptId::new(parts[0].parse()?, parse_hex_u32(parts[1], encoded)?)?;
        let to = AttemptId::new(parts[2].parse()?, parse_hex_u32(parts[3], encoded)?)?;
        Self::new(from, to)
    }
}

impl fmt::Display for FwdEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn aid(q: &str, n: u32) -> AttemptId {
        AttemptId::new(QuestId::new(q).unwrap(), n).unwrap()
    }

    #[test]
    fn test_attempt_and_execution_display() {
        let attempt = aid("build", 1);
        assert_eq!(attempt.to_string(), "build|00000001");
        let execution = attempt.execution(255);
        assert_eq!(execution.to_string(), "build|00000001|000000ff");
        assert_eq!(execution.to_string().parse::<ExecutionId>().unwrap(), execution);
    }

    #[test]
    fn test_quest_id_validation() {
        assert!(QuestId::new("").is_err());
        assert!(QuestId::new("has|pipe").is_err());
        assert!(QuestId::new("has:colon").is_err());
        assert!(QuestId::new("a".repeat(129)).is_err());
        assert!(QuestId::new("abc-DEF_1.2").is_ok());
    }

    #[test]
    fn test_attempt_zero_rejected() {
        assert!(AttemptId::new(QuestId::new("q").unwrap(), 0).is_err());
        assert!("q|00000000".parse::<AttemptId>().is_err());
    }

    #[test]
    fn test_group_key_round_trip() {
        for key in [
            GroupKey::Quest(QuestId::new("q").unwrap()),
            GroupKey::Attempt(aid("q", 2)),
            GroupKey::BackDeps(aid("q", 3)),
        ] {
            assert_eq!(key.to_string().parse::<GroupKey>().unwrap(), key);
            let json = serde_json::to_string(&key).unwrap();
            assert_eq!(serde_json::from_str::<GroupKey>(&json).unwrap(), key);
        }
        assert!("nope:q".parse::<GroupKey>().is_err());
    }

    #[test]
    fn test_self_edge_rejected() {
        assert!(FwdEdge::new(aid("a", 1), aid("a", 1)).is_err());
        assert!(FwdEdge::new(aid("a", 1), aid("a", 2)).is_ok());
    }

    #[test]
    fn test_edge_decode_rejects_garbage() {
        assert!(FwdEdge::decode("a|00000001").is_err());
        assert!(FwdEdge::decode("a|00000001|b|zz").is_err());
    }

    proptest! {
        #[test]
        fn prop_edge_round_trip(
            from_q in "[a-z0-9]{1,16}",
            to_q in "[a-z0-9]{1,16}",
            from_n in 1u32..,
            to_n in 1u32..,
        ) {
            prop_assume!(from_q != to_q || from_n != to_n);
            let edge = FwdEdge::new(aid(&from_q, from_n), aid(&to_q, to_n)).unwrap();
            let decoded = FwdEdge::decode(&edge.encode()).unwrap();
            prop_assert_eq!(decoded, edge);
        }

        #[test]
        fn prop_attempt_id_round_trip(q in "[A-Za-z0-9_.-]{1,32}", n in 1u32..) {
            let attempt = aid(&q, n);
            prop_assert_eq!(attempt.to_string().parse::<AttemptId>().unwrap(), attempt);
        }
    }
}
