//! Deterministic workflow execution for Reach.
//!
//! A [`graph::Workflow`] is validated once, then driven step by step by a
//! synchronous [`machine::Machine`]. Every step passes the policy [`gate`]
//! before it runs and every observable change lands in the event log, whose
//! canonical hash yields the run fingerprint. [`replay`] re-drives a recorded
//! log and reports the first event that differs.

pub mod budget;
pub mod capsule;
pub mod checkpoint;
pub mod decision;
pub mod engine;
pub mod event_log;
pub mod gate;
pub mod graph;
pub mod machine;
pub mod patch;
pub mod replay;
pub mod run;

pub use capsule::Capsule;
pub use checkpoint::{CheckpointStore, RunSnapshot};
pub use decision::{evaluate_decision, DecisionInput, DecisionOutput};
pub use engine::Engine;
pub use event_log::RunEvent;
pub use gate::{GateDecision, GateRequest, GateVerdict};
pub use graph::{compile, validate, ValidatedWorkflow, Workflow};
pub use machine::{Directive, Machine, MachineConfig, RunStatus};
pub use replay::{verify_replay, verify_replay_from_snapshot, ReplayOutcome, SnapshotGuard};
pub use run::{Action, RunHandle};
