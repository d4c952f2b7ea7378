//! Error types for the DM core.
//!
//! Every fallible operation in the crate returns [`DmResult`]. The variants follow the
//! error taxonomy the mutation engine acts on:
//!
//! - **Transient**: storage contention, distributor timeouts. The engine redelivers the
//!   mutation later and no state is changed.
//! - **InvalidArgument**: malformed requests. Rejected synchronously, nothing journaled.
//! - **InvalidStateTransition**: an internal-consistency bug. Logged and surfaced, never
//!   swallowed; the engine dead-letters the mutation instead of retrying it.

use crate::distributor::DistributorError;
use crate::state_machine::StateMachineError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmError {
    #[error("Transient error: {0}")]
    Transient(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Distributor error: {0}")]
    DistributorError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DmError {
    /// Whether the mutation engine should redeliver the mutation that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<serde_json::Error> for DmError {
    fn from(error: serde_json::Error) -> Self {
        DmError::SerializationError(error.to_string())
    }
}

impl From<StateMachineError> for DmError {
    fn from(error: StateMachineError) -> Self {
        DmError::InvalidStateTransition(error.to_string())
    }
}

impl From<DistributorError> for DmError {
    fn from(error: DistributorError) -> Self {
        match error {
            DistributorError::Transient(msg) => DmError::Transient(msg),
            other => DmError::DistributorError(other.to_string()),
        }
    }
}

impl From<crate::config::ConfigurationError> for DmError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        DmError::ConfigurationError(error.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for DmError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                DmError::Transient(error.to_string())
            }
            // serialization_failure / deadlock_detected
            sqlx::Error::Database(db)
                if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) =>
            {
                DmError::Transient(error.to_string())
            }
            _ => DmError::StorageError(error.to_string()),
        }
    }
}

pub type DmResult<T> = std::result::Result<T, DmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DmError::Transient("contention".into()).is_transient());
        assert!(!DmError::InvalidArgument("bad".into()).is_transient());
        assert!(!DmError::InvalidStateTransition("x".into()).is_transient());
    }

    #[test]
    fn test_distributor_error_conversion() {
        let transient: DmError = DistributorError::Transient("rpc timeout".into()).into();
        assert!(transient.is_transient());

        let permanent: DmError = DistributorError::Permanent("bad params".into()).into();
        assert_eq!(
            permanent,
            DmError::DistributorError("Permanent distributor error: bad params".into())
        );
    }

    #[test]
    fn test_error_messages() {
        let err = DmError::invalid_argument("quest abc does not exist");
        assert_eq!(err.to_string(), "Invalid argument: quest abc does not exist");
    }
}
