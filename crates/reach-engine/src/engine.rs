use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use reach_cas::{verify_manifest, CapsuleManifest, ContentStore, TrustedSigners};
use reach_core::config::ReachConfig;
use reach_core::error::{ReachError, Result};
use reach_core::policy::{PackContext, Policy};
use reach_core::traits::{StorageDriver, TelemetrySink};
use reach_core::types::{Artifact, Event, RunId};
use reach_tools::AdapterRegistry;

use crate::capsule::Capsule;
use crate::checkpoint::CheckpointStore;
use crate::graph::{self, ValidatedWorkflow, Workflow};
use crate::machine::{Machine, MachineConfig};
use crate::replay::{self, ReplayOutcome, SnapshotGuard};
use crate::run::RunHandle;

/// Entry point tying validation, admission, execution, and replay together.
///
/// The engine itself holds no per-run state. Collaborators are optional:
/// without storage the event log cannot evict, without a checkpoint store
/// runs cannot be resumed after the handle is dropped.
pub struct Engine {
    config: ReachConfig,
    registry: Arc<AdapterRegistry>,
    storage: Option<Arc<dyn StorageDriver>>,
    checkpoints: Option<Arc<CheckpointStore>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    trust: TrustedSigners,
    cas: Option<Arc<ContentStore>>,
}

impl Engine {
    pub fn new(config: ReachConfig, registry: Arc<AdapterRegistry>) -> Result<Self> {
        let trust = TrustedSigners::from_config(&config.trust)?;
        Ok(Self {
            config,
            registry,
            storage: None,
            checkpoints: None,
            telemetry: None,
            trust,
            cas: None,
        })
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageDriver>) -> Self {
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

    pub fn with_trust(mut self, trust: TrustedSigners) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_cas(mut self, cas: Arc<ContentStore>) -> Self {
        self.cas = Some(cas);
        self
    }

    pub fn config(&self) -> &ReachConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn validate(&self, workflow: Workflow) -> Result<ValidatedWorkflow> {
        graph::validate(workflow)
    }

    pub fn compile(&self, json: &str) -> Result<ValidatedWorkflow> {
        graph::compile(json)
    }

    /// Verify a pack manifest and its artifacts, store the artifacts in the
    /// CAS when one is attached, and return the context the gate uses.
    pub fn admit_pack(
        &self,
        manifest: &CapsuleManifest,
        artifacts: &[Artifact],
    ) -> Result<PackContext> {
        let integrity = verify_manifest(manifest, &self.trust, self.config.trust.allow_unsigned)?;
        manifest.verify_artifacts(artifacts)?;
        if let Some(cas) = &self.cas {
            for artifact in artifacts {
                cas.put_artifact(artifact)?;
            }
        }
        let pack = manifest.pack_context(integrity)?;
        info!(pack = %manifest.pack_id, hash = %pack.pack_hash, "Pack admitted");
        Ok(pack)
    }

    fn handle(&self, machine: Machine) -> Result<RunHandle> {
        let mut handle = RunHandle::new(machine, self.registry.snapshot()?)
            .with_default_timeout_ms(self.config.engine.default_step_timeout_ms);
        if let Some(storage) = &self.storage {
            handle = handle.with_storage(Arc::clone(storage));
        }
        if let Some(checkpoints) = &self.checkpoints {
            handle = handle.with_checkpoints(Arc::clone(checkpoints));
        }
        if let Some(telemetry) = &self.telemetry {
            handle = handle.with_telemetry(Arc::clone(telemetry));
        }
        Ok(handle)
    }

    /// Start a run and write `run.started`.
    ///
    /// The run id is derived from the pack hash, the canonical input hash,
    /// and `sequence`, so the same triple always names the same run.
    pub async fn start_run(
        &self,
        workflow: &ValidatedWorkflow,
        input: Value,
        policy: Arc<Policy>,
        pack: PackContext,
        sequence: u64,
    ) -> Result<RunHandle> {
        let machine = Machine::new(
            workflow.clone(),
            policy,
            pack,
            input,
            sequence,
            &MachineConfig::from_config(&self.config),
        )?;
        let mut handle = self.handle(machine)?;
        handle.start().await?;
        Ok(handle)
    }

    /// [`Engine::admit_pack`] followed by [`Engine::start_run`].
    pub async fn start_pack_run(
        &self,
        workflow: &ValidatedWorkflow,
        input: Value,
        policy: Arc<Policy>,
        manifest: &CapsuleManifest,
        artifacts: &[Artifact],
        sequence: u64,
    ) -> Result<RunHandle> {
        let pack = self.admit_pack(manifest, artifacts)?;
        self.start_run(workflow, input, policy, pack, sequence).await
    }

    /// Reattach to a checkpointed run. The snapshot must still hash to the
    /// value it was saved with.
    pub fn resume_run(
        &self,
        run_id: &RunId,
        workflow: &ValidatedWorkflow,
        policy: Arc<Policy>,
        pack: PackContext,
    ) -> Result<RunHandle> {
        let store = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| ReachError::Config("no checkpoint store configured".to_string()))?;
        let snapshot = store
            .load(run_id)?
            .ok_or_else(|| ReachError::RunNotFound(run_id.to_string()))?;
        SnapshotGuard::verify(&snapshot, &snapshot.hash)?;
        let machine = Machine::restore(workflow.clone(), policy, pack, snapshot.state)?;
        info!(run_id = %run_id, status = %machine.status(), "Run restored from checkpoint");
        self.handle(machine)
    }

    pub async fn stored_events(&self, run_id: &RunId) -> Result<Vec<Event>> {
        match &self.storage {
            Some(storage) => storage.get_events(run_id).await,
            None => Err(ReachError::Config("no storage configured".to_string())),
        }
    }

    pub fn verify_replay(
        &self,
        events: &[Event],
        workflow: &ValidatedWorkflow,
        policy: Arc<Policy>,
        pack: PackContext,
        expected_fingerprint: Option<&str>,
    ) -> Result<ReplayOutcome> {
        let outcome = replay::verify_replay(events, workflow, policy, pack, expected_fingerprint)?;
        if let ReplayOutcome::Diverged { at_index, .. } = &outcome {
            warn!(at_index, "Replay diverged");
        }
        Ok(outcome)
    }

    /// Seal the stored log of a run into a capsule.
    pub async fn capsule(&self, run_id: &RunId) -> Result<Capsule> {
        let events = self.stored_events(run_id).await?;
        Capsule::new(run_id.clone(), events)
    }
}
