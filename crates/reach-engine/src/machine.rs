//! Synchronous run state machine.
//!
//! The machine owns everything a run needs to continue: cursor, output
//! state, budget counters, and the event log. It performs no I/O. Tool calls
//! are handed back to the caller as [`Directive::ToolCall`] and their results
//! fed back through [`Machine::apply_tool_result`]. Because all state is
//! serializable, a run can be checkpointed between any two operations and
//! restored later, and replay can re-drive the same code path from a
//! recorded log.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use reach_core::canon::{canonical_hash, Canonicalizer};
use reach_core::config::{BudgetConfig, ReachConfig, RunLimits};
use reach_core::error::{ReachError, Result};
use reach_core::fingerprint::{compute_fingerprint, derive_run_id, ENGINE_VERSION};
use reach_core::policy::{DenyReason, PackContext, Policy};
use reach_core::types::{Event, RunId, ToolCall, ToolResult};

use crate::budget::Budget;
use crate::decision::evaluate_decision;
use crate::event_log::{EventLog, RunEvent};
use crate::gate::{self, GateDecision, GateRequest};
use crate::graph::validate::check_input;
use crate::graph::{Outcome, Step, StepKind, ValidatedWorkflow};
use crate::patch::{self, Change};

/// Nesting allowed when hashing whole-run state, which wraps tool outputs
/// a few levels deep.
pub(crate) const STATE_MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the caller must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    ToolCall(ToolCall),
    Paused,
    Completed,
    Failed { reason: String },
    Cancelled,
}

/// Outcome of the step under the cursor, waiting for edge selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEdge {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PendingEdge {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            choice: None,
            reason: None,
        }
    }
}

/// Limits applied to a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineConfig {
    pub budget: BudgetConfig,
    pub event_log_capacity: usize,
    pub limits: RunLimits,
    /// Set only when events are written through to durable storage.
    pub evict: bool,
}

impl MachineConfig {
    pub fn from_config(config: &ReachConfig) -> Self {
        Self {
            budget: config.budget.clone(),
            event_log_capacity: config.engine.event_log_capacity,
            limits: RunLimits::from(&config.engine),
            evict: false,
        }
    }

    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::from_config(&ReachConfig::default())
    }
}

/// Everything needed to continue a run, minus the shared workflow, policy,
/// and pack (referenced by hash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineState {
    pub run_id: RunId,
    pub workflow_id: String,
    pub workflow_hash: String,
    pub policy_hash: String,
    pub pack_hash: String,
    pub input: Value,
    pub input_hash: String,
    pub sequence: u64,
    pub status: RunStatus,
    /// Path of step ids from the top-level workflow to the current step.
    pub cursor: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Step the run failed at, when the failure belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// `{"input": ..., "steps": {...}}`, read by edge guards.
    pub state: Value,
    pub visits: BTreeMap<String, u32>,
    pub budget: Budget,
    #[serde(default)]
    pub limits: RunLimits,
    pub log: EventLog,
}

pub struct Machine {
    workflow: ValidatedWorkflow,
    policy: Arc<Policy>,
    pack: PackContext,
    st: MachineState,
}

fn transition(from: RunStatus, to: &str) -> ReachError {
    ReachError::InvalidTransition {
        from: from.as_str().to_string(),
        to: to.to_string(),
    }
}

/// Insert `value` at `segments` under `root`, creating objects on the way.
fn set_path(root: &mut Value, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for seg in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(seg.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.clone(), value);
    }
}

impl Machine {
    /// Prepare a run. The input is checked against every step schema and
    /// the run id derived from pack, input, and sequence. No events are
    /// written until [`Machine::start`].
    pub fn new(
        workflow: ValidatedWorkflow,
        policy: Arc<Policy>,
        pack: PackContext,
        input: Value,
        sequence: u64,
        config: &MachineConfig,
    ) -> Result<Self> {
        check_input(&workflow, &input)?;
        let input_hash = Canonicalizer::new(config.limits.max_depth).hash(&input)?;
        let run_id = derive_run_id(&pack.pack_hash, &input_hash, sequence);
        let start = workflow
            .start_id()
            .ok_or_else(|| ReachError::InvalidWorkflow("workflow has no start step".into()))?
            .to_string();

        let st = MachineState {
            run_id,
            workflow_id: workflow.id.clone(),
            workflow_hash: workflow.hash()?,
            policy_hash: policy.hash()?,
            pack_hash: pack.pack_hash.clone(),
            state: json!({"input": input.clone(), "steps": {}}),
            input,
            input_hash,
            sequence,
            status: RunStatus::Pending,
            cursor: vec![start],
            pending: None,
            awaiting: None,
            failure: None,
            failed_step: None,
            visits: BTreeMap::new(),
            budget: Budget::new(config.budget.clone()),
            limits: config.limits,
            log: EventLog::new(config.event_log_capacity, config.evict),
        };
        Ok(Self {
            workflow,
            policy,
            pack,
            st,
        })
    }

    /// Rebuild a machine from saved state. The workflow, policy, and pack
    /// must be the ones the state was produced with.
    pub fn restore(
        workflow: ValidatedWorkflow,
        policy: Arc<Policy>,
        pack: PackContext,
        state: MachineState,
    ) -> Result<Self> {
        let checks = [
            ("workflow", workflow.hash()?, &state.workflow_hash),
            ("policy", policy.hash()?, &state.policy_hash),
            ("pack", pack.pack_hash.clone(), &state.pack_hash),
        ];
        for (what, actual, expected) in checks {
            if &actual != expected {
                return Err(ReachError::InvalidInput(format!(
                    "{} hash {} does not match run state ({})",
                    what, actual, expected
                )));
            }
        }
        if workflow.resolve(&state.cursor).is_none() && !state.status.is_terminal() {
            return Err(ReachError::InvalidInput(format!(
                "run state cursor {} not in workflow",
                state.cursor.join("/")
            )));
        }
        Ok(Self {
            workflow,
            policy,
            pack,
            st: state,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.st.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.st.status
    }

    /// Error form of the run's end state, when one exists. Failures with no
    /// matching variant, such as `step_failed:*`, give `None`.
    pub fn outcome_error(&self) -> Option<ReachError> {
        match self.st.status {
            RunStatus::Cancelled => Some(ReachError::Cancelled),
            RunStatus::Failed => {
                let reason = self.st.failure.as_deref()?;
                if let Some(limit) = reason.strip_prefix("budget_exhausted:") {
                    return Some(ReachError::BudgetExhausted(limit.to_string()));
                }
                let denied = reason.parse::<DenyReason>().ok()?;
                Some(ReachError::PolicyDenied {
                    step: self.st.failed_step.clone().unwrap_or_default(),
                    reason: denied.as_str().to_string(),
                })
            }
            _ => None,
        }
    }

    pub fn state(&self) -> &MachineState {
        &self.st
    }

    pub fn workflow(&self) -> &ValidatedWorkflow {
        &self.workflow
    }

    pub fn policy(&self) -> &Arc<Policy> {
        &self.policy
    }

    pub fn pack(&self) -> &PackContext {
        &self.pack
    }

    /// Output state read by guards: run input plus recorded step outputs.
    pub fn outputs(&self) -> &Value {
        &self.st.state
    }

    pub fn awaiting(&self) -> Option<&ToolCall> {
        self.st.awaiting.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.st.failure.as_deref()
    }

    pub fn budget(&self) -> &Budget {
        &self.st.budget
    }

    /// In-memory window of the event log.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.st.log.events()
    }

    pub fn evicted(&self) -> u64 {
        self.st.log.evicted()
    }

    pub fn set_evict(&mut self, evict: bool) {
        self.st.log.set_evict(evict);
    }

    pub fn take_outbox(&mut self) -> Vec<Event> {
        self.st.log.take_outbox()
    }

    pub fn restore_outbox(&mut self, undelivered: Vec<Event>) {
        self.st.log.restore_outbox(undelivered);
    }

    /// Timeout configured on the step under the cursor.
    pub fn step_timeout_ms(&self) -> Option<u64> {
        self.workflow
            .resolve(&self.st.cursor)
            .and_then(|(_, step)| step.timeout_ms)
    }

    /// Fingerprint over the in-memory log. `None` once events were evicted;
    /// the durable copy must be used then.
    pub fn fingerprint(&self) -> Result<Option<String>> {
        if self.st.log.evicted() > 0 {
            return Ok(None);
        }
        compute_fingerprint(&self.st.run_id, ENGINE_VERSION, self.st.log.events()).map(Some)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.st.status != RunStatus::Pending {
            return Err(transition(self.st.status, "running"));
        }
        self.st.status = RunStatus::Running;
        self.emit(RunEvent::RunStarted {
            run_id: self.st.run_id.to_string(),
            workflow_id: self.st.workflow_id.clone(),
            workflow_hash: self.st.workflow_hash.clone(),
            input: self.st.input.clone(),
            input_hash: self.st.input_hash.clone(),
            pack_hash: self.st.pack_hash.clone(),
            policy_hash: self.st.policy_hash.clone(),
            sequence: self.st.sequence,
            budget: self.st.budget.limits.clone(),
            limits: self.st.limits,
        })
    }

    /// Advance until the run needs something from outside or ends.
    ///
    /// Idempotent while a tool call is outstanding: the same call is
    /// returned again without writing events.
    pub fn next_action(&mut self) -> Result<Directive> {
        match self.st.status {
            RunStatus::Pending => return Err(transition(RunStatus::Pending, "next_action")),
            RunStatus::Paused => return Ok(Directive::Paused),
            RunStatus::Completed => return Ok(Directive::Completed),
            RunStatus::Cancelled => return Ok(Directive::Cancelled),
            RunStatus::Failed => {
                return Ok(Directive::Failed {
                    reason: self.st.failure.clone().unwrap_or_default(),
                })
            }
            RunStatus::Running => {}
        }
        if let Some(call) = &self.st.awaiting {
            return Ok(Directive::ToolCall(call.clone()));
        }

        loop {
            if let Some(pending) = self.st.pending.take() {
                if let Some(directive) = self.follow_edge(pending)? {
                    return Ok(directive);
                }
                continue;
            }
            if let Some(directive) = self.visit()? {
                return Ok(directive);
            }
        }
    }

    pub fn apply_tool_result(&mut self, result: ToolResult) -> Result<()> {
        if self.st.status != RunStatus::Running {
            return Err(transition(self.st.status, "tool.result"));
        }
        let call = self
            .st
            .awaiting
            .as_ref()
            .ok_or_else(|| transition(RunStatus::Running, "tool.result without tool.call"))?;
        if call.step_id != result.step_id || call.tool != result.tool {
            return Err(ReachError::InvalidInput(format!(
                "result for {}:{} does not answer {}:{}",
                result.step_id, result.tool, call.step_id, call.tool
            )));
        }

        let size = Canonicalizer::new(self.st.limits.max_depth)
            .to_bytes(&result.output)?
            .len();
        if size > self.st.limits.max_payload_bytes {
            return Err(ReachError::PayloadTooLarge {
                size,
                limit: self.st.limits.max_payload_bytes,
            });
        }
        let result_hash = result.digest()?;

        self.emit(RunEvent::ToolResult {
            step_id: result.step_id.clone(),
            tool: result.tool.clone(),
            success: result.success,
            output: result.output.clone(),
            output_hash: canonical_hash(&result.output)?,
            error: result.error.clone(),
            tokens_used: result.tokens_used,
            result_hash,
        })?;
        self.st.awaiting = None;
        self.st.budget.record_tokens(result.tokens_used);

        if result.success {
            let changes = self.record_output(result.output);
            self.emit(RunEvent::ArtifactPatch {
                step_id: result.step_id,
                changes,
            })?;
            self.st.pending = Some(PendingEdge::new(Outcome::Success));
        } else {
            let mut pending = PendingEdge::new(Outcome::Failure);
            pending.reason = result.error;
            self.st.pending = Some(pending);
        }
        Ok(())
    }

    /// The outstanding call ran out of time. Treated as a failed step.
    pub fn record_timeout(&mut self) -> Result<()> {
        if self.st.status != RunStatus::Running {
            return Err(transition(self.st.status, "tool.timeout"));
        }
        let call = self
            .st
            .awaiting
            .take()
            .ok_or_else(|| transition(RunStatus::Running, "tool.timeout without tool.call"))?;
        self.emit(RunEvent::ToolTimeout {
            step_id: call.step_id,
            tool: call.tool,
        })?;
        let mut pending = PendingEdge::new(Outcome::Failure);
        pending.reason = Some("timeout".to_string());
        self.st.pending = Some(pending);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.st.status != RunStatus::Running {
            return Err(transition(self.st.status, "paused"));
        }
        self.st.status = RunStatus::Paused;
        self.emit(RunEvent::RunPaused {})
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.st.status != RunStatus::Paused {
            return Err(transition(self.st.status, "running"));
        }
        self.st.status = RunStatus::Running;
        self.emit(RunEvent::RunResumed {})
    }

    pub fn cancel(&mut self) -> Result<()> {
        if self.st.status.is_terminal() {
            return Err(transition(self.st.status, "cancelled"));
        }
        self.st.status = RunStatus::Cancelled;
        self.st.awaiting = None;
        self.st.pending = None;
        self.emit(RunEvent::RunCancelled {})
    }

    fn path(&self) -> String {
        self.st.cursor.join("/")
    }

    /// Append, failing the run if the log refuses the event.
    fn emit(&mut self, event: RunEvent) -> Result<()> {
        match self.st.log.append(event) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.st.status = RunStatus::Failed;
                self.st.failure = Some(e.code().to_lowercase());
                self.st.awaiting = None;
                self.st.pending = None;
                Err(e)
            }
        }
    }

    fn fail(&mut self, reason: String, step_id: Option<String>) -> Result<Directive> {
        debug!(run_id = %self.st.run_id, reason = %reason, "Run failed");
        self.emit(RunEvent::RunFailed {
            reason: reason.clone(),
            step_id: step_id.clone(),
        })?;
        self.st.status = RunStatus::Failed;
        self.st.failure = Some(reason.clone());
        self.st.failed_step = step_id;
        Ok(Directive::Failed { reason })
    }

    /// Store `output` for the current step and return what changed.
    fn record_output(&mut self, output: Value) -> Vec<Change> {
        let mut segments = vec!["steps".to_string()];
        segments.extend(self.st.cursor.iter().cloned());
        let pointer = patch::pointer(&segments);
        let before = self.st.state.pointer(&pointer).cloned();
        let changes = patch::diff_at(&pointer, before.as_ref(), Some(&output));
        set_path(&mut self.st.state, &segments, output);
        changes
    }

    /// Gate the step under the cursor. On deny the denial is recorded and
    /// the deny outcome queued for edge selection.
    fn admit(&mut self, path: &str, step: &Step) -> Result<bool> {
        let request = GateRequest::for_step(path, step);
        let verdict = gate::evaluate(&request, &self.policy, &self.pack);
        match verdict.decision {
            GateDecision::Allow => Ok(true),
            GateDecision::Deny(reason) => {
                debug!(
                    step = %verdict.redacted.step,
                    pack = %verdict.redacted.pack,
                    reason = %reason,
                    "Policy denied step"
                );
                self.emit(RunEvent::PolicyDenied {
                    step_id: path.to_string(),
                    reason: reason.as_str().to_string(),
                })?;
                let mut pending = PendingEdge::new(Outcome::Denied);
                pending.reason = Some(reason.as_str().to_string());
                self.st.pending = Some(pending);
                Ok(false)
            }
        }
    }

    fn follow_edge(&mut self, pending: PendingEdge) -> Result<Option<Directive>> {
        let workflow = self.workflow.clone();
        let path = self.path();
        let (scope, step) = workflow
            .resolve(&self.st.cursor)
            .ok_or_else(|| ReachError::Internal(format!("cursor {} does not resolve", path)))?;

        let next = scope
            .outgoing(&step.id)
            .find(|e| e.matches(pending.outcome, &self.st.state, pending.choice.as_deref()))
            .map(|e| e.to.clone());

        match next {
            Some(to) => {
                if let Some(last) = self.st.cursor.last_mut() {
                    *last = to;
                }
                Ok(None)
            }
            None => {
                let reason = match pending.outcome {
                    Outcome::Denied => pending
                        .reason
                        .unwrap_or_else(|| "policy_denied".to_string()),
                    Outcome::Failure => format!("step_failed:{}", path),
                    Outcome::Success => format!("no_matching_edge:{}", path),
                };
                self.fail(reason, Some(path)).map(Some)
            }
        }
    }

    fn visit(&mut self) -> Result<Option<Directive>> {
        let workflow = self.workflow.clone();
        let path = self.path();
        let (_, step) = workflow
            .resolve(&self.st.cursor)
            .ok_or_else(|| ReachError::Internal(format!("cursor {} does not resolve", path)))?;

        if step.is_terminal() {
            if !self.admit(&path, step)? {
                return Ok(None);
            }
            if self.st.cursor.len() > 1 {
                // End of a subworkflow: the enclosing step succeeded.
                self.st.cursor.pop();
                self.st.pending = Some(PendingEdge::new(Outcome::Success));
                return Ok(None);
            }
            let output_hash = Canonicalizer::new(STATE_MAX_DEPTH).hash(&self.st.state)?;
            self.emit(RunEvent::RunCompleted { output_hash })?;
            self.st.status = RunStatus::Completed;
            return Ok(Some(Directive::Completed));
        }

        let visits = self.st.visits.get(&path).copied().unwrap_or(0);
        if let Some(max) = step.max_iterations.filter(|m| *m > 0) {
            if visits + 1 > max {
                return self
                    .fail("loop_limit_exceeded".to_string(), Some(path))
                    .map(Some);
            }
        }

        let is_tool = matches!(step.kind, StepKind::Tool { .. });
        if let Err(exhausted) = self.st.budget.check(is_tool) {
            self.emit(RunEvent::BudgetExhausted {
                step_id: path.clone(),
                limit: exhausted.limit,
                used: exhausted.used,
                max: exhausted.max,
            })?;
            let reason = format!("budget_exhausted:{}", exhausted.limit.as_str());
            return self.fail(reason, Some(path)).map(Some);
        }

        *self.st.visits.entry(path.clone()).or_insert(0) += 1;
        self.st.budget.record_visit();

        if !self.admit(&path, step)? {
            return Ok(None);
        }

        match &step.kind {
            StepKind::Tool {
                tool,
                permissions,
                model,
                ..
            } => {
                self.st.budget.record_tool_call();
                let call = ToolCall {
                    step_id: path,
                    tool: tool.clone(),
                    input: json!({
                        "args": step.args.clone().unwrap_or(Value::Null),
                        "input": self.st.input.clone(),
                    }),
                    permissions: permissions.clone(),
                    model: model.clone(),
                };
                self.emit(RunEvent::ToolCall {
                    step_id: call.step_id.clone(),
                    tool: call.tool.clone(),
                    input: call.input.clone(),
                    permissions: call.permissions.clone(),
                    model: call.model.clone(),
                })?;
                self.st.awaiting = Some(call.clone());
                Ok(Some(Directive::ToolCall(call)))
            }
            StepKind::Decision { model } => {
                let mut pending = PendingEdge::new(Outcome::Success);
                if let Some(input) = model {
                    let output = match evaluate_decision(input) {
                        Ok(output) => output,
                        Err(e) => {
                            return self
                                .fail(format!("decision_failed:{}", e), Some(path))
                                .map(Some)
                        }
                    };
                    let recommended = output.recommended_action_id().map(str::to_string);
                    let ranking: Vec<String> = output
                        .ranked_actions
                        .iter()
                        .map(|a| a.action_id.clone())
                        .collect();
                    self.emit(RunEvent::DecisionTaken {
                        step_id: path.clone(),
                        recommended: recommended.clone(),
                        ranking: ranking.clone(),
                        determinism_fingerprint: output.determinism_fingerprint.clone(),
                    })?;
                    let changes = self.record_output(json!({
                        "recommended": recommended,
                        "ranking": ranking,
                    }));
                    self.emit(RunEvent::ArtifactPatch {
                        step_id: path,
                        changes,
                    })?;
                    pending.choice = recommended;
                }
                self.st.pending = Some(pending);
                Ok(None)
            }
            StepKind::Subworkflow { workflow: child } => {
                let start = child.start_id().ok_or_else(|| {
                    ReachError::InvalidWorkflow(format!("subworkflow '{}' has no start", child.id))
                })?;
                self.st.cursor.push(start.to_string());
                Ok(None)
            }
            StepKind::Terminal => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::compile;
    use crate::checkpoint::RunSnapshot;
    use reach_core::canon::DEFAULT_MAX_DEPTH;
    use reach_core::policy::{Capability, PackIntegrity};
    use reach_test_utils::{
        chain_workflow, decision_workflow, deny_workflow, linear_workflow, loop_workflow,
        sample_input, sample_pack, sample_policy, subworkflow_workflow,
    };

    fn machine(wf: Value, config: MachineConfig) -> Machine {
        let wf = compile(&wf.to_string()).unwrap();
        let mut m = Machine::new(
            wf,
            Arc::new(sample_policy()),
            sample_pack(),
            sample_input(),
            0,
            &config,
        )
        .unwrap();
        m.start().unwrap();
        m
    }

    fn types(m: &Machine) -> Vec<String> {
        m.events().map(|e| e.event_type.clone()).collect()
    }

    /// Answer every tool call with its own input until the run stops.
    fn drive(m: &mut Machine) -> Directive {
        loop {
            match m.next_action().unwrap() {
                Directive::ToolCall(call) => {
                    let output = json!({"tool": call.tool, "ok": true});
                    m.apply_tool_result(ToolResult::success(&call, output)).unwrap();
                }
                other => return other,
            }
        }
    }

    #[test]
    fn test_linear_run_event_sequence() {
        let mut m = machine(linear_workflow(), MachineConfig::default());
        assert_eq!(drive(&mut m), Directive::Completed);
        assert_eq!(
            types(&m),
            vec![
                "run.started",
                "tool.call",
                "tool.result",
                "artifact.patch",
                "tool.call",
                "tool.result",
                "artifact.patch",
                "run.completed"
            ]
        );
        assert_eq!(m.status(), RunStatus::Completed);
        assert_eq!(m.outputs()["steps"]["fetch"]["tool"], "http.get");
        assert!(m.fingerprint().unwrap().is_some());
    }

    #[test]
    fn test_tool_call_carries_args_and_input() {
        let mut m = machine(linear_workflow(), MachineConfig::default());
        let Directive::ToolCall(call) = m.next_action().unwrap() else {
            panic!("expected tool call");
        };
        assert_eq!(call.step_id, "fetch");
        assert_eq!(call.input["args"]["method"], "GET");
        assert_eq!(call.input["input"], sample_input());
        assert_eq!(call.permissions, vec!["net.read".to_string()]);
    }

    #[test]
    fn test_next_action_idempotent_while_awaiting() {
        let mut m = machine(linear_workflow(), MachineConfig::default());
        let a = m.next_action().unwrap();
        let count = m.events().count();
        let b = m.next_action().unwrap();
        assert_eq!(a, b);
        assert_eq!(m.events().count(), count);
    }

    #[test]
    fn test_same_inputs_same_fingerprint() {
        let run = || {
            let mut m = machine(chain_workflow(4), MachineConfig::default());
            drive(&mut m);
            m.fingerprint().unwrap().unwrap()
        };
        let first = run();
        for _ in 0..4 {
            assert_eq!(run(), first);
        }
    }

    #[test]
    fn test_input_schema_rejected_before_start() {
        let wf = compile(&linear_workflow().to_string()).unwrap();
        let err = Machine::new(
            wf,
            Arc::new(sample_policy()),
            sample_pack(),
            json!({"limit": 1}),
            0,
            &MachineConfig::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.code(), "E_SCHEMA");
    }

    #[test]
    fn test_iteration_budget_blocks_extra_call() {
        let config = MachineConfig::default().with_budget(BudgetConfig {
            max_iterations: Some(2),
            ..Default::default()
        });
        let mut m = machine(chain_workflow(3), config);
        let mut calls = 0;
        let end = loop {
            match m.next_action().unwrap() {
                Directive::ToolCall(call) => {
                    calls += 1;
                    m.apply_tool_result(ToolResult::success(&call, json!(1))).unwrap();
                }
                other => break other,
            }
        };
        assert_eq!(calls, 2);
        assert_eq!(
            end,
            Directive::Failed {
                reason: "budget_exhausted:iterations".into()
            }
        );
        let t = types(&m);
        assert_eq!(&t[t.len() - 2..], &["budget.exhausted", "run.failed"]);
    }

    #[test]
    fn test_token_budget() {
        let config = MachineConfig::default().with_budget(BudgetConfig {
            max_tokens: Some(10),
            ..Default::default()
        });
        let mut m = machine(chain_workflow(3), config);
        let Directive::ToolCall(call) = m.next_action().unwrap() else {
            panic!("expected tool call");
        };
        m.apply_tool_result(ToolResult::success(&call, json!(1)).with_tokens(10))
            .unwrap();
        assert_eq!(
            m.next_action().unwrap(),
            Directive::Failed {
                reason: "budget_exhausted:tokens".into()
            }
        );
        let err = m.outcome_error().unwrap();
        assert_eq!(err.code(), "RESOURCE_EXHAUSTED");
        assert!(matches!(err, ReachError::BudgetExhausted(limit) if limit == "tokens"));
    }

    #[test]
    fn test_loop_limit() {
        let mut m = machine(loop_workflow(3), MachineConfig::default());
        let mut polls = 0;
        let end = loop {
            match m.next_action().unwrap() {
                Directive::ToolCall(call) => {
                    polls += 1;
                    m.apply_tool_result(ToolResult::success(&call, json!({"ready": false})))
                        .unwrap();
                }
                other => break other,
            }
        };
        assert_eq!(polls, 3);
        assert_eq!(
            end,
            Directive::Failed {
                reason: "loop_limit_exceeded".into()
            }
        );
        assert!(m.outcome_error().is_none());
    }

    #[test]
    fn test_loop_exits_on_guard() {
        let mut m = machine(loop_workflow(5), MachineConfig::default());
        let mut polls = 0;
        let end = loop {
            match m.next_action().unwrap() {
                Directive::ToolCall(call) => {
                    polls += 1;
                    let ready = polls == 2;
                    m.apply_tool_result(ToolResult::success(&call, json!({"ready": ready})))
                        .unwrap();
                }
                other => break other,
            }
        };
        assert_eq!(polls, 2);
        assert_eq!(end, Directive::Completed);
    }

    #[test]
    fn test_deny_without_edge_fails_run() {
        let mut m = machine(deny_workflow(false), MachineConfig::default());
        assert_eq!(
            m.next_action().unwrap(),
            Directive::Failed {
                reason: "permission_scope_exceeds_policy".into()
            }
        );
        assert_eq!(types(&m), vec!["run.started", "policy.denied", "run.failed"]);
        match m.outcome_error() {
            Some(ReachError::PolicyDenied { step, reason }) => {
                assert_eq!(step, "write");
                assert_eq!(reason, "permission_scope_exceeds_policy");
            }
            other => panic!("expected policy denial, got {:?}", other),
        }
    }

    #[test]
    fn test_deny_follows_on_deny_edge() {
        let mut m = machine(deny_workflow(true), MachineConfig::default());
        let Directive::ToolCall(call) = m.next_action().unwrap() else {
            panic!("expected report call");
        };
        assert_eq!(call.step_id, "report");
        m.apply_tool_result(ToolResult::success(&call, json!("noted")))
            .unwrap();
        assert_eq!(m.next_action().unwrap(), Directive::Completed);
        assert!(types(&m).contains(&"policy.denied".to_string()));
    }

    #[test]
    fn test_invalid_pack_denies_first_step() {
        let wf = compile(&chain_workflow(1).to_string()).unwrap();
        let pack = PackContext::new("p".repeat(64), PackIntegrity::Invalid {
            reason: "bad".into(),
        });
        let mut m = Machine::new(
            wf,
            Arc::new(sample_policy()),
            pack,
            json!({}),
            0,
            &MachineConfig::default(),
        )
        .unwrap();
        m.start().unwrap();
        assert_eq!(
            m.next_action().unwrap(),
            Directive::Failed {
                reason: "invalid_signature".into()
            }
        );
    }

    #[test]
    fn test_failure_without_edge() {
        let mut m = machine(chain_workflow(2), MachineConfig::default());
        let Directive::ToolCall(call) = m.next_action().unwrap() else {
            panic!("expected tool call");
        };
        m.apply_tool_result(ToolResult::failure(&call, "boom")).unwrap();
        assert_eq!(
            m.next_action().unwrap(),
            Directive::Failed {
                reason: "step_failed:step0".into()
            }
        );
    }

    #[test]
    fn test_timeout_is_failure() {
        let mut m = machine(chain_workflow(1), MachineConfig::default());
        m.next_action().unwrap();
        m.record_timeout().unwrap();
        assert!(matches!(m.next_action().unwrap(), Directive::Failed { .. }));
        assert!(types(&m).contains(&"tool.timeout".to_string()));
    }

    #[test]
    fn test_result_must_answer_call() {
        let mut m = machine(chain_workflow(2), MachineConfig::default());
        let Directive::ToolCall(call) = m.next_action().unwrap() else {
            panic!("expected tool call");
        };
        let mut wrong = ToolResult::success(&call, json!(1));
        wrong.step_id = "step1".into();
        assert_eq!(m.apply_tool_result(wrong).unwrap_err().code(), "E_INVALID_INPUT");
        assert!(m.awaiting().is_some());
    }

    #[test]
    fn test_result_without_call_is_invalid_state() {
        let mut m = machine(chain_workflow(1), MachineConfig::default());
        let call = ToolCall {
            step_id: "step0".into(),
            tool: "echo".into(),
            input: Value::Null,
            permissions: vec![],
            model: None,
        };
        let err = m
            .apply_tool_result(ToolResult::success(&call, json!(1)))
            .unwrap_err();
        assert_eq!(err.code(), "E_INVALID_STATE");
    }

    #[test]
    fn test_payload_limit() {
        let mut config = MachineConfig::default();
        config.limits.max_payload_bytes = 16;
        let mut m = machine(chain_workflow(1), config);
        let Directive::ToolCall(call) = m.next_action().unwrap() else {
            panic!("expected tool call");
        };
        let big = ToolResult::success(&call, json!({"data": "x".repeat(64)}));
        assert_eq!(m.apply_tool_result(big).unwrap_err().code(), "PAYLOAD_TOO_LARGE");
        m.apply_tool_result(ToolResult::success(&call, json!(1)))
            .unwrap();
    }

    fn nested_arrays(levels: usize) -> Value {
        let mut v = json!(1);
        for _ in 0..levels {
            v = Value::Array(vec![v]);
        }
        v
    }

    #[test]
    fn test_output_at_depth_limit_still_fingerprints() {
        let mut m = machine(chain_workflow(2), MachineConfig::default());
        let deep = nested_arrays(DEFAULT_MAX_DEPTH);
        loop {
            match m.next_action().unwrap() {
                Directive::ToolCall(call) => m
                    .apply_tool_result(ToolResult::success(&call, deep.clone()))
                    .unwrap(),
                Directive::Completed => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(m.fingerprint().unwrap().is_some());
        assert!(RunSnapshot::capture(&m).is_ok());
    }

    #[test]
    fn test_output_past_depth_limit_rejected() {
        let mut config = MachineConfig::default();
        config.limits.max_depth = 4;
        let mut m = machine(chain_workflow(1), config);
        let Directive::ToolCall(call) = m.next_action().unwrap() else {
            panic!("expected tool call");
        };
        let err = m
            .apply_tool_result(ToolResult::success(&call, nested_arrays(5)))
            .unwrap_err();
        assert_eq!(err.code(), "E_SCHEMA");
        m.apply_tool_result(ToolResult::success(&call, nested_arrays(4)))
            .unwrap();
        assert_eq!(m.events().count(), 4);
    }

    #[test]
    fn test_pause_resume_cancel_transitions() {
        let mut m = machine(chain_workflow(2), MachineConfig::default());
        m.pause().unwrap();
        assert_eq!(m.next_action().unwrap(), Directive::Paused);
        assert_eq!(m.pause().unwrap_err().code(), "E_INVALID_STATE");
        m.resume().unwrap();
        assert_eq!(m.resume().unwrap_err().code(), "E_INVALID_STATE");
        m.cancel().unwrap();
        assert_eq!(m.next_action().unwrap(), Directive::Cancelled);
        assert_eq!(m.cancel().unwrap_err().code(), "E_INVALID_STATE");
        assert_eq!(m.outcome_error().unwrap().code(), "EXECUTION_CANCELLED");
        let t = types(&m);
        assert_eq!(&t[1..], &["run.paused", "run.resumed", "run.cancelled"]);
    }

    #[test]
    fn test_event_log_full_fails_run() {
        let config = MachineConfig::default().with_event_log_capacity(3);
        let mut m = machine(chain_workflow(3), config);
        let Directive::ToolCall(call) = m.next_action().unwrap() else {
            panic!("expected tool call");
        };
        let err = m
            .apply_tool_result(ToolResult::success(&call, json!(1)))
            .unwrap_err();
        assert_eq!(err.code(), "EVENT_LOG_TOO_LARGE");
        assert_eq!(m.status(), RunStatus::Failed);
    }

    #[test]
    fn test_eviction_drops_in_memory_fingerprint() {
        let mut config = MachineConfig::default().with_event_log_capacity(3);
        config.evict = true;
        let mut m = machine(chain_workflow(3), config);
        assert_eq!(drive(&mut m), Directive::Completed);
        assert!(m.evicted() > 0);
        assert!(m.fingerprint().unwrap().is_none());
        assert_eq!(m.take_outbox().len() as u64, m.evicted() + 3);
    }

    #[test]
    fn test_decision_routes_by_choice() {
        let mut m = machine(decision_workflow(), MachineConfig::default());
        let Directive::ToolCall(call) = m.next_action().unwrap() else {
            panic!("expected tool call");
        };
        assert_eq!(call.step_id, "deploy");
        assert_eq!(m.outputs()["steps"]["decide"]["recommended"], "ship");
        let taken = m
            .events()
            .find(|e| e.event_type == "decision.taken")
            .unwrap();
        assert_eq!(taken.payload["ranking"], json!(["ship", "hold"]));
    }

    #[test]
    fn test_subworkflow_nests_and_returns() {
        let mut m = machine(subworkflow_workflow(), MachineConfig::default());
        let mut steps = Vec::new();
        let end = loop {
            match m.next_action().unwrap() {
                Directive::ToolCall(call) => {
                    steps.push(call.step_id.clone());
                    m.apply_tool_result(ToolResult::success(&call, json!({"n": steps.len()})))
                        .unwrap();
                }
                other => break other,
            }
        };
        assert_eq!(end, Directive::Completed);
        assert_eq!(steps, vec!["prepare", "nested/work"]);
        assert_eq!(m.outputs()["steps"]["nested"]["work"]["n"], 2);
    }

    #[test]
    fn test_determinism_required_denies_nondeterministic_step() {
        let wf = json!({
            "id": "nd",
            "nodes": [
                {"id": "roll", "kind": {"type": "tool", "tool": "echo", "nondeterministic": true},
                 "declared_capabilities": ["echo"]},
                {"id": "done", "kind": {"type": "terminal"}, "declared_capabilities": ["control"]}
            ],
            "edges": [{"from": "roll", "to": "done"}]
        });
        let policy = Policy::new("strict")
            .with_capability(Capability::new("util").with_tools(["echo"]))
            .require_determinism(true);
        let mut m = Machine::new(
            compile(&wf.to_string()).unwrap(),
            Arc::new(policy),
            sample_pack(),
            json!({}),
            0,
            &MachineConfig::default(),
        )
        .unwrap();
        m.start().unwrap();
        assert_eq!(
            m.next_action().unwrap(),
            Directive::Failed {
                reason: "determinism_required".into()
            }
        );
    }

    #[test]
    fn test_restore_checks_hashes() {
        let mut m = machine(chain_workflow(2), MachineConfig::default());
        m.next_action().unwrap();
        let state = m.state().clone();

        let wf = compile(&chain_workflow(2).to_string()).unwrap();
        let restored = Machine::restore(
            wf.clone(),
            Arc::new(sample_policy()),
            sample_pack(),
            state.clone(),
        )
        .unwrap();
        assert_eq!(restored.awaiting(), m.awaiting());

        let other = Arc::new(Policy::new("other"));
        let err = Machine::restore(wf, other, sample_pack(), state).err().unwrap();
        assert_eq!(err.code(), "E_INVALID_INPUT");
    }

    #[test]
    fn test_start_twice_is_invalid() {
        let mut m = machine(chain_workflow(1), MachineConfig::default());
        assert_eq!(m.start().unwrap_err().code(), "E_INVALID_STATE");
    }

    #[test]
    fn test_set_path_creates_parents() {
        let mut v = json!({"steps": {}});
        set_path(&mut v, &["steps".into(), "a".into(), "b".into()], json!(1));
        assert_eq!(v, json!({"steps": {"a": {"b": 1}}}));
        set_path(&mut v, &["steps".into(), "a".into(), "b".into()], json!(2));
        assert_eq!(v["steps"]["a"]["b"], 2);
    }
}
