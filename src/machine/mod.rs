//! The two coupled state machines.
//!
//! [`TaskPhaseMachine`] owns an [`ExecutionLoopMachine`] exactly while it is
//! in [`TaskPhase::Executing`]; both are checkpointed together.

pub mod execution;
pub mod phase;

pub use execution::{ExecutionEvent, ExecutionLoopMachine, ExecutionState, LoopLimits, LoopSignal};
pub use phase::{PhaseEvent, TaskPhase, TaskPhaseMachine};
