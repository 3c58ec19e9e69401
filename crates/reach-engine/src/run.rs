use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use reach_core::error::{ReachError, Result};
use reach_core::fingerprint::{compute_fingerprint, ENGINE_VERSION};
use reach_core::traits::{StorageDriver, TelemetrySink};
use reach_core::types::{Event, RunId, TelemetryEvent, ToolCall, ToolResult};
use reach_tools::AdapterSet;

use crate::checkpoint::{CheckpointStore, RunSnapshot};
use crate::machine::{Directive, Machine, RunStatus};

/// What the caller of a run handle sees next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ToolCall(ToolCall),
    Paused,
    Completed { fingerprint: String },
    Failed { reason: String },
    Cancelled,
}

/// A live run: the machine plus everything around it that does I/O.
///
/// Each operation advances the machine, then writes the new events through
/// to storage and telemetry before returning. A checkpoint is saved whenever
/// the run stops to wait for a tool result or a resume.
pub struct RunHandle {
    machine: Machine,
    storage: Option<Arc<dyn StorageDriver>>,
    checkpoints: Option<Arc<CheckpointStore>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    adapters: AdapterSet,
    cancel: CancellationToken,
    default_timeout_ms: Option<u64>,
    finished: bool,
}

impl RunHandle {
    pub fn new(mut machine: Machine, adapters: AdapterSet) -> Self {
        machine.set_evict(false);
        Self {
            machine,
            storage: None,
            checkpoints: None,
            telemetry: None,
            adapters,
            cancel: CancellationToken::new(),
            default_timeout_ms: None,
            finished: false,
        }
    }

    /// Write every event through to `storage`. Only then may the in-memory
    /// log evict old events.
    pub fn with_storage(mut self, storage: Arc<dyn StorageDriver>) -> Self {
        self.machine.set_evict(true);
        self.storage = Some(storage);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn run_id(&self) -> &RunId {
        self.machine.run_id()
    }

    pub fn status(&self) -> RunStatus {
        self.machine.status()
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// In-memory window of the event log.
    pub fn events(&self) -> Vec<Event> {
        self.machine.events().cloned().collect()
    }

    /// Token that cancels the run from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Emit run.started. Called once by the engine.
    pub(crate) async fn start(&mut self) -> Result<()> {
        let started = self.machine.start();
        self.flush().await?;
        started?;
        if let Some(t) = &self.telemetry {
            t.emit(TelemetryEvent::RunStarted {
                run_id: self.run_id().clone(),
                workflow_id: self.machine.workflow().id.clone(),
            });
        }
        info!(run_id = %self.run_id(), workflow = %self.machine.workflow().id, "Run started");
        Ok(())
    }

    pub async fn next_action(&mut self) -> Result<Action> {
        let directive = self.machine.next_action();
        self.flush().await?;
        let action = match directive? {
            Directive::ToolCall(call) => {
                self.checkpoint()?;
                Action::ToolCall(call)
            }
            Directive::Paused => Action::Paused,
            Directive::Completed => Action::Completed {
                fingerprint: self.fingerprint().await?,
            },
            Directive::Failed { reason } => Action::Failed { reason },
            Directive::Cancelled => Action::Cancelled,
        };
        if !matches!(action, Action::ToolCall(_) | Action::Paused) {
            self.finish()?;
        }
        Ok(action)
    }

    pub async fn apply_tool_result(&mut self, result: ToolResult) -> Result<()> {
        let applied = self.machine.apply_tool_result(result);
        self.flush().await?;
        applied
    }

    pub async fn record_timeout(&mut self) -> Result<()> {
        let recorded = self.machine.record_timeout();
        self.flush().await?;
        recorded
    }

    pub async fn pause(&mut self) -> Result<()> {
        self.machine.pause()?;
        self.flush().await?;
        self.checkpoint()
    }

    pub async fn resume(&mut self) -> Result<()> {
        self.machine.resume()?;
        self.flush().await?;
        self.checkpoint()
    }

    pub async fn cancel(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.machine.cancel()?;
        self.flush().await?;
        self.finish()
    }

    /// Fingerprint of the full log. Falls back to the durable copy once the
    /// in-memory window has evicted events.
    pub async fn fingerprint(&self) -> Result<String> {
        if let Some(fp) = self.machine.fingerprint()? {
            return Ok(fp);
        }
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| ReachError::Internal("events evicted without storage".to_string()))?;
        let events = storage.get_events(self.run_id()).await?;
        compute_fingerprint(self.run_id(), ENGINE_VERSION, events.iter())
    }

    /// Full log: from storage when attached, else the in-memory window.
    pub async fn full_log(&self) -> Result<Vec<Event>> {
        match &self.storage {
            Some(storage) => storage.get_events(self.run_id()).await,
            None => Ok(self.events()),
        }
    }

    /// Run to a stop, invoking adapters for every tool call.
    ///
    /// Adapter errors and oversized outputs become failed tool results so
    /// they are recorded and replayable. A timeout is recorded as such.
    pub async fn drive(&mut self) -> Result<Action> {
        loop {
            if self.cancel.is_cancelled() && !self.status().is_terminal() {
                self.machine.cancel()?;
                self.flush().await?;
                self.finish()?;
                return Ok(Action::Cancelled);
            }

            let call = match self.next_action().await? {
                Action::ToolCall(call) => call,
                other => return Ok(other),
            };

            let adapter = match self.adapters.resolve(&call.tool) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(tool = %call.tool, error = %e, "No adapter for tool");
                    self.apply_tool_result(ToolResult::failure(&call, e.to_string()))
                        .await?;
                    continue;
                }
            };
            let timeout_ms = self
                .machine
                .step_timeout_ms()
                .or(self.default_timeout_ms)
                .unwrap_or_else(|| adapter.timeout_ms());
            debug!(step = %call.step_id, tool = %call.tool, adapter = %adapter.name(), timeout_ms, "Dispatching tool call");

            let cancel = self.cancel.clone();
            let invoked = tokio::select! {
                r = tokio::time::timeout(Duration::from_millis(timeout_ms), adapter.invoke(call.clone())) => r,
                _ = cancel.cancelled() => continue,
            };

            match invoked {
                Err(_) => {
                    warn!(step = %call.step_id, timeout_ms, "Tool call timed out");
                    self.record_timeout().await?;
                }
                Ok(Err(e)) => {
                    warn!(step = %call.step_id, error = %e, "Adapter failed");
                    self.apply_tool_result(ToolResult::failure(&call, e.to_string()))
                        .await?;
                }
                Ok(Ok(result)) => match self.apply_tool_result(result).await {
                    Err(e @ (ReachError::PayloadTooLarge { .. } | ReachError::Schema(_))) => {
                        warn!(step = %call.step_id, error = %e, "Tool output rejected");
                        self.apply_tool_result(ToolResult::failure(&call, e.to_string()))
                            .await?;
                    }
                    other => other?,
                },
            }
        }
    }

    /// Deliver queued events to storage and telemetry.
    async fn flush(&mut self) -> Result<()> {
        let pending = self.machine.take_outbox();
        let run_id = self.run_id().clone();
        for (i, event) in pending.iter().enumerate() {
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.put(&run_id, event).await {
                    warn!(run_id = %run_id, seq = event.seq, error = %e, "Event write failed");
                    self.machine.restore_outbox(pending[i..].to_vec());
                    return Err(e);
                }
            }
            self.publish(&run_id, event);
        }
        Ok(())
    }

    fn publish(&self, run_id: &RunId, event: &Event) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        telemetry.emit(TelemetryEvent::EventAppended {
            run_id: run_id.clone(),
            seq: event.seq,
            event_type: event.event_type.clone(),
        });
        if event.event_type == "policy.denied" {
            telemetry.emit(TelemetryEvent::PolicyDenied {
                run_id: run_id.clone(),
                step_id: event.payload["step_id"].as_str().unwrap_or_default().to_string(),
                reason: event.payload["reason"].as_str().unwrap_or_default().to_string(),
            });
        }
    }

    fn checkpoint(&self) -> Result<()> {
        if let Some(store) = &self.checkpoints {
            store.save(&RunSnapshot::capture(&self.machine)?)?;
        }
        Ok(())
    }

    /// Terminal bookkeeping: drop the checkpoint and announce the end.
    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let Some(store) = &self.checkpoints {
            store.delete(self.run_id())?;
        }
        let status = self.status();
        if let Some(t) = &self.telemetry {
            t.emit(TelemetryEvent::RunFinished {
                run_id: self.run_id().clone(),
                status: status.as_str().to_string(),
            });
        }
        info!(run_id = %self.run_id(), status = %status, "Run finished");
        Ok(())
    }
}
