//! Resumable orchestration of LLM coding agents.
//!
//! A task moves through a fixed lifecycle ([`machine::TaskPhaseMachine`]);
//! its execution phase is a nested chunk/implement/review loop
//! ([`machine::ExecutionLoopMachine`]). Free-form agent replies are mapped to
//! typed decisions by [`interpret::ResponseInterpreter`], and the whole task is
//! persisted after every step through [`checkpoint::CheckpointStore`].

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod errors;
pub mod human;
pub mod interpret;
pub mod logging;
pub mod machine;
pub mod notify;
pub mod orchestrator;
pub mod sandbox;
