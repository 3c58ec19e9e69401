//! Full stack: SQLite event storage, on-disk CAS, signed packs, checkpoints,
//! and the deterministic fallback adapter.

use std::path::Path;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use serde_json::json;

use reach_cas::{CapsuleManifest, ContentStore, TrustedSigners};
use reach_core::config::ReachConfig;
use reach_core::policy::PackContext;
use reach_core::traits::StorageDriver;
use reach_core::types::Artifact;
use reach_engine::{Action, Capsule, CheckpointStore, Engine, ReplayOutcome, ValidatedWorkflow};
use reach_memory::SqliteStorage;
use reach_test_utils::{linear_workflow, sample_input, sample_policy};
use reach_tools::AdapterRegistry;

const SIGNER: &str = "release";

fn key() -> SigningKey {
    SigningKey::from_bytes(&[11; 32])
}

fn engine(root: &Path) -> (Engine, Arc<SqliteStorage>) {
    let mut config = ReachConfig::default();
    config.storage.database = root.join("events.db").display().to_string();
    config.storage.cas_dir = root.join("cas").display().to_string();
    config.storage.checkpoints = root.join("checkpoints.db").display().to_string();

    let registry = Arc::new(AdapterRegistry::from_config(&config.adapters).unwrap());
    let storage = Arc::new(SqliteStorage::open(&config.storage.database_path()).unwrap());
    let checkpoints = Arc::new(CheckpointStore::open(&config.storage.checkpoints_path()).unwrap());
    let cas = Arc::new(ContentStore::open(config.storage.cas_path()).unwrap());

    let mut trust = TrustedSigners::new();
    trust.insert(SIGNER, key().verifying_key());

    let engine = Engine::new(config, registry)
        .unwrap()
        .with_storage(storage.clone())
        .with_checkpoints(checkpoints)
        .with_cas(cas)
        .with_trust(trust);
    (engine, storage)
}

fn signed_pack() -> (CapsuleManifest, Vec<Artifact>) {
    let artifacts = vec![
        Artifact::new("workflow.json", linear_workflow().to_string().into_bytes()),
        Artifact::new("README", b"summarize a report".to_vec()),
    ];
    let manifest = CapsuleManifest::build("reports", "1.2.0", &artifacts)
        .unwrap()
        .with_tools(["http.get", "llm.summarize"])
        .with_permissions(["net.read"])
        .sign(&key(), SIGNER)
        .unwrap();
    (manifest, artifacts)
}

fn workflow() -> ValidatedWorkflow {
    reach_engine::compile(&linear_workflow().to_string()).unwrap()
}

async fn run_once(root: &Path) -> (String, Vec<reach_core::types::Event>, PackContext) {
    let (engine, storage) = engine(root);
    let (manifest, artifacts) = signed_pack();
    let pack = engine.admit_pack(&manifest, &artifacts).unwrap();
    let mut handle = engine
        .start_run(&workflow(), sample_input(), Arc::new(sample_policy()), pack.clone(), 0)
        .await
        .unwrap();
    let fingerprint = match handle.drive().await.unwrap() {
        Action::Completed { fingerprint } => fingerprint,
        other => panic!("expected completion, got {:?}", other),
    };
    let events = storage.get_events(handle.run_id()).await.unwrap();
    (fingerprint, events, pack)
}

#[tokio::test]
async fn test_fingerprint_is_stable_across_fresh_stores() {
    let mut fingerprints = Vec::new();
    for _ in 0..5 {
        let dir = tempfile::tempdir().unwrap();
        let (fp, _, _) = run_once(dir.path()).await;
        fingerprints.push(fp);
    }
    assert!(fingerprints.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_stored_log_replays() {
    let dir = tempfile::tempdir().unwrap();
    let (fp, events, pack) = run_once(dir.path()).await;
    assert_eq!(events[0].event_type, "run.started");
    assert_eq!(events[0].payload["pack_hash"], pack.pack_hash);

    let outcome = reach_engine::verify_replay(
        &events,
        &workflow(),
        Arc::new(sample_policy()),
        pack,
        Some(&fp),
    )
    .unwrap();
    match outcome {
        ReplayOutcome::Verified { fingerprint, .. } => assert_eq!(fingerprint, fp),
        other => panic!("expected verification, got {:?}", other),
    }
}

#[tokio::test]
async fn test_flipped_result_byte_is_caught() {
    let dir = tempfile::tempdir().unwrap();
    let (fp, mut events, pack) = run_once(dir.path()).await;
    let idx = events
        .iter()
        .rposition(|e| e.event_type == "tool.result")
        .unwrap();
    events[idx].payload["output"] = json!({"forged": true});

    let outcome = reach_engine::verify_replay(
        &events,
        &workflow(),
        Arc::new(sample_policy()),
        pack,
        Some(&fp),
    )
    .unwrap();
    match outcome {
        ReplayOutcome::Diverged { at_index, .. } => assert_eq!(at_index, idx),
        other => panic!("expected divergence, got {:?}", other),
    }
}

#[tokio::test]
async fn test_admitted_artifacts_land_in_cas() {
    let dir = tempfile::tempdir().unwrap();
    run_once(dir.path()).await;
    let cas = ContentStore::open(dir.path().join("cas")).unwrap();
    let (manifest, _) = signed_pack();
    for entry in &manifest.artifacts {
        let artifact = cas.get_artifact(&entry.id, &entry.hash).unwrap();
        assert!(artifact.verify());
    }
}

#[tokio::test]
async fn test_tampered_manifest_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = engine(dir.path());
    let (mut manifest, artifacts) = signed_pack();
    manifest.declared_permissions.insert("fs.write".to_string());
    let err = engine.admit_pack(&manifest, &artifacts).unwrap_err();
    assert_eq!(err.code(), "SIGNATURE_INVALID");
}

#[tokio::test]
async fn test_capsule_survives_json() {
    let dir = tempfile::tempdir().unwrap();
    let (fp, events, _) = run_once(dir.path()).await;
    let (engine, _) = engine(dir.path());
    let run_id = reach_core::types::RunId::from(
        events[0].payload["run_id"].as_str().unwrap(),
    );

    let capsule = engine.capsule(&run_id).await.unwrap().sign(&key(), SIGNER);
    let restored = Capsule::from_json(&capsule.to_json().unwrap()).unwrap();
    assert_eq!(restored.fingerprint, fp);

    let mut trust = TrustedSigners::new();
    trust.insert(SIGNER, key().verifying_key());
    restored.verify_signed(&trust).unwrap();
}
