//! Replay verification.
//!
//! A recorded log is re-driven through a fresh [`Machine`] with no adapters.
//! Every external input (tool results, timeouts, pause, resume, cancel) is
//! read back from the log; everything else must be regenerated exactly.
//! The first event whose hashed content differs is reported with a
//! structural diff.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use reach_core::config::{BudgetConfig, RunLimits};
use reach_core::error::{ReachError, Result};
use reach_core::fingerprint::{compute_fingerprint, ENGINE_VERSION};
use reach_core::policy::{PackContext, Policy};
use reach_core::types::{Event, ToolResult};

use crate::checkpoint::RunSnapshot;
use crate::event_log::RunEvent;
use crate::graph::ValidatedWorkflow;
use crate::machine::{Machine, MachineConfig};
use crate::patch::{diff, Change};

/// Replay keeps no window of its own; events are compared as they appear.
const REPLAY_WINDOW: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplayOutcome {
    Verified {
        fingerprint: String,
        events: usize,
    },
    Diverged {
        at_index: usize,
        diff: Vec<Change>,
    },
}

impl ReplayOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    /// Collapse into a result: the verified fingerprint or the mismatch.
    pub fn into_result(self) -> Result<String> {
        match self {
            Self::Verified { fingerprint, .. } => Ok(fingerprint),
            Self::Diverged { at_index, diff } => {
                if let Some(fp) = diff.iter().find(|c| c.path == "/fingerprint") {
                    return Err(ReachError::FingerprintMismatch {
                        expected: fp.before.as_ref().map(Value::to_string).unwrap_or_default(),
                        actual: fp.after.as_ref().map(Value::to_string).unwrap_or_default(),
                    });
                }
                Err(ReachError::ReplayMismatch { index: at_index })
            }
        }
    }
}

/// Refuses snapshots whose content no longer matches their hash.
pub struct SnapshotGuard;

impl SnapshotGuard {
    pub fn verify(snapshot: &RunSnapshot, expected_hash: &str) -> Result<()> {
        let actual = RunSnapshot::state_hash(&snapshot.state)?;
        if actual != expected_hash || snapshot.hash != expected_hash {
            warn!(run_id = %snapshot.run_id, "Snapshot hash mismatch");
            return Err(ReachError::SnapshotTampered {
                expected: expected_hash.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

fn event_value(event: &Event) -> Value {
    json!({"seq": event.seq, "type": event.event_type, "payload": event.payload})
}

fn replay_config(budget: BudgetConfig, limits: RunLimits) -> MachineConfig {
    let mut config = MachineConfig::default()
        .with_budget(budget)
        .with_limits(limits)
        .with_event_log_capacity(REPLAY_WINDOW);
    config.evict = true;
    config
}

struct Replayer<'a> {
    machine: Machine,
    original: &'a [Event],
    matched: usize,
}

impl<'a> Replayer<'a> {
    fn diverged(at_index: usize, expected: Option<&Event>, actual: Option<Value>) -> ReplayOutcome {
        let before = expected.map(event_value);
        let diff = match (&before, &actual) {
            (Some(b), Some(a)) => diff(b, a),
            _ => vec![Change {
                path: String::new(),
                before,
                after: actual,
            }],
        };
        ReplayOutcome::Diverged { at_index, diff }
    }

    /// Match freshly produced events against the original log.
    fn compare(&mut self, produced: Vec<Event>) -> Option<ReplayOutcome> {
        for event in produced {
            let idx = self.matched;
            match self.original.get(idx) {
                Some(expected) if expected.same_content(&event) => self.matched += 1,
                expected => {
                    debug!(index = idx, event_type = %event.event_type, "Replay diverged");
                    return Some(Self::diverged(idx, expected, Some(event_value(&event))));
                }
            }
        }
        None
    }

    fn step(&mut self, next: &Event) -> Result<()> {
        match next.event_type.as_str() {
            "tool.result" => {
                let result: ToolResult = serde_json::from_value(next.payload.clone())?;
                self.machine.apply_tool_result(result)
            }
            "tool.timeout" => self.machine.record_timeout(),
            "run.paused" => self.machine.pause(),
            "run.resumed" => self.machine.resume(),
            "run.cancelled" => self.machine.cancel(),
            _ => self.machine.next_action().map(|_| ()),
        }
    }

    fn run(mut self, expected_fingerprint: Option<&str>) -> Result<ReplayOutcome> {
        let produced = self.machine.take_outbox();
        if let Some(outcome) = self.compare(produced) {
            return Ok(outcome);
        }

        while let Some(next) = self.original.get(self.matched) {
            let before = self.matched;
            let stepped = self.step(next);
            let produced = self.machine.take_outbox();
            if let Some(outcome) = self.compare(produced) {
                return Ok(outcome);
            }
            if self.matched == before {
                let actual = stepped
                    .err()
                    .map(|e| json!({"error": e.code(), "message": e.to_string()}));
                return Ok(Self::diverged(before, Some(next), actual));
            }
        }

        let fingerprint =
            compute_fingerprint(self.machine.run_id(), ENGINE_VERSION, self.original.iter())?;
        if let Some(expected) = expected_fingerprint {
            if expected != fingerprint {
                return Ok(ReplayOutcome::Diverged {
                    at_index: self.original.len(),
                    diff: vec![Change {
                        path: "/fingerprint".to_string(),
                        before: Some(Value::String(expected.to_string())),
                        after: Some(Value::String(fingerprint)),
                    }],
                });
            }
        }
        Ok(ReplayOutcome::Verified {
            fingerprint,
            events: self.original.len(),
        })
    }
}

/// Re-drive `events` from the start of the run.
///
/// The run input, sequence, budget, and engine limits come from the leading
/// `run.started` event. `workflow`, `policy`, and `pack` must be the ones the run used;
/// anything else shows up as divergence at event 0.
pub fn verify_replay(
    events: &[Event],
    workflow: &ValidatedWorkflow,
    policy: Arc<Policy>,
    pack: PackContext,
    expected_fingerprint: Option<&str>,
) -> Result<ReplayOutcome> {
    let first = events
        .first()
        .ok_or_else(|| ReachError::InvalidInput("event log is empty".to_string()))?;
    let RunEvent::RunStarted {
        input,
        sequence,
        budget,
        limits,
        ..
    } = RunEvent::from_event(first)?
    else {
        return Err(ReachError::InvalidInput(format!(
            "event log starts with {}, not run.started",
            first.event_type
        )));
    };

    let mut machine = Machine::new(
        workflow.clone(),
        policy,
        pack,
        input,
        sequence,
        &replay_config(budget, limits),
    )?;
    machine.start()?;
    Replayer {
        machine,
        original: events,
        matched: 0,
    }
    .run(expected_fingerprint)
}

/// Resume verification from a checkpoint instead of from `run.started`.
///
/// The snapshot must hash to `expected_hash`. Events the snapshot still
/// holds in memory are checked against `events`; the rest of the log after
/// the snapshot is regenerated and compared.
pub fn verify_replay_from_snapshot(
    snapshot: &RunSnapshot,
    expected_hash: &str,
    events: &[Event],
    workflow: &ValidatedWorkflow,
    policy: Arc<Policy>,
    pack: PackContext,
    expected_fingerprint: Option<&str>,
) -> Result<ReplayOutcome> {
    SnapshotGuard::verify(snapshot, expected_hash)?;

    for held in snapshot.state.log.events() {
        let idx = held.seq as usize;
        match events.get(idx) {
            Some(e) if e.same_content(held) => {}
            other => return Ok(Replayer::diverged(idx, other, Some(event_value(held)))),
        }
    }

    let start = snapshot.state.log.next_seq() as usize;
    if start > events.len() {
        return Err(ReachError::InvalidInput(format!(
            "snapshot is at event {} but the log has {}",
            start,
            events.len()
        )));
    }

    let mut machine = Machine::restore(workflow.clone(), policy, pack, snapshot.state.clone())?;
    machine.set_evict(true);
    machine.take_outbox();
    Replayer {
        machine,
        original: events,
        matched: start,
    }
    .run(expected_fingerprint)
}
