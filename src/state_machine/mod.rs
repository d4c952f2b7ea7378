// State machines for attempts and executions.
//
// Both machines are plain transition tables; the guarded setters that stamp timestamps
// live on the models (`Attempt::modify_state`, `Execution::modify_state`).

pub mod errors;
pub mod states;

pub use errors::{StateMachineError, StateMachineResult};
pub use states::{AttemptState, ExecutionState};
