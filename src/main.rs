mod json_mode;

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use ed25519_dalek::SigningKey;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reach_cas::signing::parse_signing_key;
use reach_cas::{verify_manifest, CapsuleManifest, ContentStore, TrustedSigners};
use reach_core::canon::{canonical_hash, canonical_string};
use reach_core::config::ReachConfig;
use reach_core::policy::{PackContext, Policy};
use reach_core::traits::StorageDriver;
use reach_core::types::{Artifact, Event, RunId};
use reach_engine::{Action, CheckpointStore, Engine, ReplayOutcome, RunStatus, ValidatedWorkflow};
use reach_memory::SqliteStorage;
use reach_tools::AdapterRegistry;

#[derive(Parser)]
#[command(name = "reach", version, about = "Deterministic, replayable workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "reach.toml", env = "REACH_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow file
    Validate {
        workflow: PathBuf,
    },
    /// Print the canonical form and hash of a JSON document
    Canon {
        /// JSON file, or `-` for stdin
        #[arg(default_value = "-")]
        file: PathBuf,
    },
    /// Drive a run to completion with the configured adapters
    Run {
        workflow: PathBuf,
        /// Policy bundle (TOML or JSON)
        #[arg(long)]
        policy: PathBuf,
        /// Run input as inline JSON
        #[arg(long, default_value = "{}")]
        input: String,
        /// Signed pack manifest. Without one the workflow runs as an unsigned pack.
        #[arg(long)]
        pack: Option<PathBuf>,
        #[arg(long, default_value = "0")]
        sequence: u64,
        /// Write the full event log here as NDJSON
        #[arg(long)]
        log: Option<PathBuf>,
        /// Reattach to a checkpointed run instead of starting a new one
        #[arg(long)]
        resume: Option<String>,
    },
    /// Verify a recorded run by replaying it
    Replay {
        workflow: PathBuf,
        #[arg(long)]
        policy: PathBuf,
        #[arg(long)]
        pack: Option<PathBuf>,
        /// NDJSON event log
        #[arg(long, conflicts_with = "run_id")]
        log: Option<PathBuf>,
        /// Read the log from event storage
        #[arg(long)]
        run_id: Option<String>,
        /// Expected fingerprint
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// Rank actions with the decision engine
    Decide {
        /// Decision input JSON, or `-` for stdin
        #[arg(default_value = "-")]
        file: PathBuf,
    },
    /// Content-addressed store
    Cas {
        #[command(subcommand)]
        action: CasAction,
    },
    /// Build or verify pack manifests
    Pack {
        #[command(subcommand)]
        action: PackAction,
    },
    /// Generate an Ed25519 signing key
    Keygen,
    /// Answer a single JSON command read from stdin
    Json,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum CasAction {
    /// Store a file and print its content id
    Put { file: PathBuf },
    /// Fetch content by id
    Get {
        cid: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum PackAction {
    /// Store artifacts in the CAS and write a manifest over them
    Build {
        files: Vec<PathBuf>,
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "0.1.0")]
        version: String,
        /// Tools the pack may call (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,
        /// Permissions the pack may request (comma-separated)
        #[arg(long, value_delimiter = ',')]
        permissions: Vec<String>,
        /// Hex seed of the signing key
        #[arg(long, env = "REACH_SIGNING_KEY", hide_env_values = true)]
        key: Option<String>,
        #[arg(long, default_value = "default")]
        signer: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Check a manifest's signature and its artifacts in the CAS
    Verify { manifest: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "reach", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Validate { workflow } => {
            let wf = load_workflow(&workflow)?;
            println!("{} ok ({} steps, hash {})", wf.id, wf.nodes.len(), wf.hash()?);
        }
        Commands::Canon { file } => {
            let value = read_json(&file)?;
            println!("{}", canonical_string(&value)?);
            println!("{}", canonical_hash(&value)?);
        }
        Commands::Run {
            workflow,
            policy,
            input,
            pack,
            sequence,
            log,
            resume,
        } => {
            let input: Value = serde_json::from_str(&input).context("--input is not JSON")?;
            run(
                &config,
                &workflow,
                &policy,
                input,
                pack.as_deref(),
                sequence,
                log.as_deref(),
                resume,
            )
            .await?;
        }
        Commands::Replay {
            workflow,
            policy,
            pack,
            log,
            run_id,
            fingerprint,
        } => {
            replay(
                &config,
                &workflow,
                &policy,
                pack.as_deref(),
                log.as_deref(),
                run_id,
                fingerprint,
            )
            .await?;
        }
        Commands::Decide { file } => {
            let input: reach_engine::DecisionInput = serde_json::from_value(read_json(&file)?)?;
            let output = reach_engine::evaluate_decision(&input)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Cas { action } => {
            let cas = ContentStore::open(config.storage.cas_path())?;
            match action {
                CasAction::Put { file } => {
                    let bytes = std::fs::read(&file)
                        .with_context(|| format!("reading {}", file.display()))?;
                    println!("{}", cas.put(&bytes)?);
                }
                CasAction::Get { cid, out } => {
                    let bytes = cas.get(&cid)?;
                    match out {
                        Some(path) => std::fs::write(&path, &bytes)?,
                        None => io::stdout().write_all(&bytes)?,
                    }
                }
            }
        }
        Commands::Pack { action } => pack(&config, action)?,
        Commands::Keygen => {
            let key = SigningKey::generate(&mut rand::rngs::OsRng);
            println!("secret: {}", hex::encode(key.to_bytes()));
            println!("public: {}", hex::encode(key.verifying_key().to_bytes()));
        }
        Commands::Json => {
            let mut line = String::new();
            io::stdin().read_to_string(&mut line)?;
            println!("{}", json_mode::handle(line.trim()));
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<ReachConfig> {
    if path.exists() {
        return Ok(ReachConfig::load(path)?);
    }
    let home = dirs_home().map(|h| h.join(".reach").join("config.toml"));
    match home {
        Some(home) if home.exists() => Ok(ReachConfig::load(&home)?),
        _ => Ok(ReachConfig::default()),
    }
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    Ok(serde_json::from_str(&content)?)
}

fn load_workflow(path: &Path) -> anyhow::Result<ValidatedWorkflow> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(reach_engine::compile(&content)?)
}

fn load_policy(path: &Path) -> anyhow::Result<Arc<Policy>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let policy = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Policy::from_json(&content)?,
        _ => Policy::from_toml(&content)?,
    };
    Ok(Arc::new(policy))
}

fn build_engine(config: &ReachConfig) -> anyhow::Result<Engine> {
    let registry = Arc::new(AdapterRegistry::from_config(&config.adapters)?);
    let storage = Arc::new(SqliteStorage::open(&config.storage.database_path())?);
    let checkpoints = Arc::new(CheckpointStore::open(&config.storage.checkpoints_path())?);
    let cas = Arc::new(ContentStore::open(config.storage.cas_path())?);
    Ok(Engine::new(config.clone(), registry)?
        .with_storage(storage)
        .with_checkpoints(checkpoints)
        .with_cas(cas))
}

/// The manifest and artifacts a run is admitted with. Without a manifest
/// the workflow file itself is the only artifact, unsigned.
fn pack_inputs(
    config: &ReachConfig,
    manifest: Option<&Path>,
    workflow: &Path,
) -> anyhow::Result<(CapsuleManifest, Vec<Artifact>)> {
    match manifest {
        Some(path) => {
            let manifest: CapsuleManifest = serde_json::from_value(read_json(path)?)?;
            let cas = ContentStore::open(config.storage.cas_path())?;
            let artifacts = manifest
                .artifacts
                .iter()
                .map(|e| cas.get_artifact(&e.id, &e.hash))
                .collect::<reach_core::error::Result<Vec<_>>>()?;
            Ok((manifest, artifacts))
        }
        None => {
            let artifact = Artifact::new("workflow.json", std::fs::read(workflow)?);
            let manifest = CapsuleManifest::build("local", "0.0.0", std::slice::from_ref(&artifact))?;
            Ok((manifest, vec![artifact]))
        }
    }
}

fn admit(engine: &Engine, manifest: &CapsuleManifest, artifacts: &[Artifact]) -> anyhow::Result<PackContext> {
    if manifest.signature.is_none() && !engine.config().trust.allow_unsigned {
        bail!("pack {} is unsigned; pass --pack or set trust.allow_unsigned", manifest.pack_id);
    }
    Ok(engine.admit_pack(manifest, artifacts)?)
}

#[allow(clippy::too_many_arguments)]
async fn run(
    config: &ReachConfig,
    workflow_path: &Path,
    policy_path: &Path,
    input: Value,
    manifest: Option<&Path>,
    sequence: u64,
    log: Option<&Path>,
    resume: Option<String>,
) -> anyhow::Result<()> {
    let engine = build_engine(config)?;
    let workflow = load_workflow(workflow_path)?;
    let policy = load_policy(policy_path)?;
    let (manifest, artifacts) = pack_inputs(config, manifest, workflow_path)?;
    let pack = admit(&engine, &manifest, &artifacts)?;

    let mut handle = match resume {
        Some(run_id) => {
            let run_id = RunId::from(run_id.as_str());
            let mut handle = engine.resume_run(&run_id, &workflow, policy, pack)?;
            if handle.status() == RunStatus::Paused {
                handle.resume().await?;
            }
            handle
        }
        None => engine.start_run(&workflow, input, policy, pack, sequence).await?,
    };
    info!(run_id = %handle.run_id(), "Driving run");

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let action = handle.drive().await?;
    if let Some(path) = log {
        write_ndjson(path, &handle.full_log().await?)?;
    }

    println!("run_id: {}", handle.run_id());
    match action {
        Action::Completed { fingerprint } => {
            println!("status: completed");
            println!("fingerprint: {}", fingerprint);
        }
        Action::Failed { reason } => {
            println!("status: failed");
            println!("reason: {}", reason);
        }
        Action::Cancelled => println!("status: cancelled"),
        Action::Paused => println!("status: paused"),
        Action::ToolCall(call) => println!("status: awaiting {}", call.step_id),
    }
    match handle.machine().outcome_error() {
        Some(err) => Err(err.into()),
        None if handle.status() == RunStatus::Failed => anyhow::bail!("run failed"),
        None => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn replay(
    config: &ReachConfig,
    workflow_path: &Path,
    policy_path: &Path,
    manifest: Option<&Path>,
    log: Option<&Path>,
    run_id: Option<String>,
    fingerprint: Option<String>,
) -> anyhow::Result<()> {
    let workflow = load_workflow(workflow_path)?;
    let policy = load_policy(policy_path)?;
    let events = match (log, run_id) {
        (Some(path), _) => read_ndjson(path)?,
        (None, Some(id)) => {
            let storage = SqliteStorage::open(&config.storage.database_path())?;
            storage.get_events(&RunId::from(id.as_str())).await?
        }
        (None, None) => bail!("pass --log or --run-id"),
    };

    let registry = Arc::new(AdapterRegistry::new());
    let engine = Engine::new(config.clone(), registry)?;
    let (manifest, artifacts) = pack_inputs(config, manifest, workflow_path)?;
    let pack = admit(&engine, &manifest, &artifacts)?;

    match engine.verify_replay(&events, &workflow, policy, pack, fingerprint.as_deref())? {
        ReplayOutcome::Verified { fingerprint, events } => {
            println!("verified: {} events", events);
            println!("fingerprint: {}", fingerprint);
            Ok(())
        }
        ReplayOutcome::Diverged { at_index, diff } => {
            println!("diverged at event {}", at_index);
            for change in &diff {
                println!("  {} {}", change.op(), change.path);
            }
            bail!("replay diverged")
        }
    }
}

fn pack(config: &ReachConfig, action: PackAction) -> anyhow::Result<()> {
    let cas = ContentStore::open(config.storage.cas_path())?;
    match action {
        PackAction::Build {
            files,
            id,
            version,
            tools,
            permissions,
            key,
            signer,
            out,
        } => {
            let mut artifacts = Vec::with_capacity(files.len());
            for file in &files {
                let name = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("bad artifact path {}", file.display()))?;
                let artifact = Artifact::new(name, std::fs::read(file)?);
                cas.put_artifact(&artifact)?;
                artifacts.push(artifact);
            }
            let mut manifest = CapsuleManifest::build(id, version, &artifacts)?
                .with_tools(tools)
                .with_permissions(permissions);
            match key {
                Some(seed) => manifest = manifest.sign(&parse_signing_key(&seed)?, &signer)?,
                None => warn!(pack = %manifest.pack_id, "Manifest left unsigned"),
            }
            let json = serde_json::to_string_pretty(&manifest)?;
            match out {
                Some(path) => std::fs::write(&path, json)?,
                None => println!("{}", json),
            }
            info!(pack = %manifest.pack_id, hash = %manifest.pack_hash()?, "Pack built");
        }
        PackAction::Verify { manifest } => {
            let manifest: CapsuleManifest = serde_json::from_value(read_json(&manifest)?)?;
            let trust = TrustedSigners::from_config(&config.trust)?;
            let integrity = verify_manifest(&manifest, &trust, config.trust.allow_unsigned)?;
            let artifacts = manifest
                .artifacts
                .iter()
                .map(|e| cas.get_artifact(&e.id, &e.hash))
                .collect::<reach_core::error::Result<Vec<_>>>()?;
            manifest.verify_artifacts(&artifacts)?;
            println!("{} {}: {:?}", manifest.pack_id, manifest.version, integrity);
            println!("pack_hash: {}", manifest.pack_hash()?);
        }
    }
    Ok(())
}

fn read_ndjson(path: &Path) -> anyhow::Result<Vec<Event>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("{}:{}", path.display(), i + 1))
        })
        .collect()
}

fn write_ndjson(path: &Path, events: &[Event]) -> anyhow::Result<()> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for event in events {
        serde_json::to_writer(&mut out, event)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
