use super::ids::{EntityKey, EntityKind};
use serde::{de::DeserializeOwned, Serialize};

/// A persisted graph entity. The key decides which entity group owns it.
pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    const KIND: EntityKind;

    fn key(&self) -> EntityKey;
}
