//! Bounded, append-only run event log.
//!
//! Sequence numbers start at 0 and increase by one per append. The log keeps
//! at most `capacity` events in memory. When full it either evicts the oldest
//! event (only when a storage driver holds a durable copy) or refuses the
//! append. Every appended event is also queued in an outbox that the async
//! run handle drains into storage and telemetry.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use reach_core::config::{BudgetConfig, RunLimits};
use reach_core::error::{ReachError, Result};
use reach_core::types::Event;

use crate::budget::BudgetLimit;
use crate::patch::Change;

/// Typed view of every event the engine writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RunEvent {
    #[serde(rename = "run.started")]
    RunStarted {
        run_id: String,
        workflow_id: String,
        workflow_hash: String,
        input: Value,
        input_hash: String,
        pack_hash: String,
        policy_hash: String,
        sequence: u64,
        budget: BudgetConfig,
        #[serde(default)]
        limits: RunLimits,
    },
    #[serde(rename = "tool.call")]
    ToolCall {
        step_id: String,
        tool: String,
        input: Value,
        permissions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    #[serde(rename = "tool.result")]
    ToolResult {
        step_id: String,
        tool: String,
        success: bool,
        output: Value,
        output_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        tokens_used: u64,
        /// Digest of the whole result, see [`ToolResult::digest`].
        ///
        /// [`ToolResult::digest`]: reach_core::types::ToolResult::digest
        result_hash: String,
    },
    #[serde(rename = "tool.timeout")]
    ToolTimeout { step_id: String, tool: String },
    #[serde(rename = "artifact.patch")]
    ArtifactPatch { step_id: String, changes: Vec<Change> },
    #[serde(rename = "policy.denied")]
    PolicyDenied { step_id: String, reason: String },
    #[serde(rename = "decision.taken")]
    DecisionTaken {
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recommended: Option<String>,
        ranking: Vec<String>,
        determinism_fingerprint: String,
    },
    #[serde(rename = "budget.exhausted")]
    BudgetExhausted {
        step_id: String,
        limit: BudgetLimit,
        used: u64,
        max: u64,
    },
    #[serde(rename = "run.paused")]
    RunPaused {},
    #[serde(rename = "run.resumed")]
    RunResumed {},
    #[serde(rename = "run.cancelled")]
    RunCancelled {},
    #[serde(rename = "run.completed")]
    RunCompleted { output_hash: String },
    #[serde(rename = "run.failed")]
    RunFailed {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
    },
}

impl RunEvent {
    /// Split into the `type` string and payload stored on [`Event`].
    pub fn into_parts(self) -> Result<(String, Value)> {
        let value = serde_json::to_value(self)?;
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ReachError::Internal("run event without type".to_string()))?
            .to_string();
        let payload = value
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok((event_type, payload))
    }

    /// Parse a stored event back into its typed form.
    pub fn from_event(event: &Event) -> Result<Self> {
        let value = serde_json::json!({"type": event.event_type, "payload": event.payload});
        serde_json::from_value(value).map_err(|e| {
            ReachError::Schema(format!("event {} ({}): {}", event.seq, event.event_type, e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    window: VecDeque<Event>,
    capacity: usize,
    next_seq: u64,
    evicted: u64,
    evict: bool,
    #[serde(skip)]
    outbox: Vec<Event>,
}

impl EventLog {
    /// `evict` is only safe when every event reaches durable storage.
    pub fn new(capacity: usize, evict: bool) -> Self {
        Self {
            window: VecDeque::new(),
            capacity: capacity.max(1),
            next_seq: 0,
            evicted: 0,
            evict,
            outbox: Vec::new(),
        }
    }

    pub fn append(&mut self, event: RunEvent) -> Result<&Event> {
        let (event_type, payload) = event.into_parts()?;
        if self.window.len() >= self.capacity {
            if !self.evict {
                return Err(ReachError::EventLogFull(self.capacity));
            }
            self.window.pop_front();
            self.evicted += 1;
        }
        let event = Event::new(self.next_seq, event_type, payload).stamped();
        self.next_seq += 1;
        self.outbox.push(event.clone());
        self.window.push_back(event);
        self.window
            .back()
            .ok_or_else(|| ReachError::Internal("event log window empty after append".into()))
    }

    /// Events still held in memory, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.window.iter()
    }

    pub fn last(&self) -> Option<&Event> {
        self.window.back()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Number of events dropped from the front of the window.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn set_evict(&mut self, evict: bool) {
        self.evict = evict;
    }

    pub fn take_outbox(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.outbox)
    }

    /// Put back events that could not be delivered, ahead of newer ones.
    pub fn restore_outbox(&mut self, mut undelivered: Vec<Event>) {
        undelivered.append(&mut self.outbox);
        self.outbox = undelivered;
    }
}
