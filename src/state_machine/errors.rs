use thiserror::Error;

/// Errors raised by the attempt and execution state guards
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("Invalid {entity} state transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Cannot record a result for {entity} in non-terminal state {state}")]
    NotTerminal { entity: &'static str, state: String },

    #[error("Result already recorded for {entity} {id}")]
    ResultAlreadyRecorded { entity: &'static str, id: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
