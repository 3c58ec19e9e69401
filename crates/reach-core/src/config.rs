use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::canon::DEFAULT_MAX_DEPTH;
use crate::error::{ReachError, Result};

/// Top-level Reach configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReachConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Events kept in memory per run before the oldest are evicted.
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
    /// Nesting cap for run inputs, step arguments, and tool outputs.
    /// At most [`DEFAULT_MAX_DEPTH`], which event hashing is sized for.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Largest canonical tool output accepted, in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Per-step timeout when neither the step nor the adapter sets one.
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,
}

fn default_event_log_capacity() -> usize {
    10_000
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: default_event_log_capacity(),
            max_depth: default_max_depth(),
            max_payload_bytes: default_max_payload_bytes(),
            default_step_timeout_ms: None,
        }
    }
}

/// Engine limits a run was recorded under. Written into `run.started` so
/// replay checks payloads against the same bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLimits {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for RunLimits {
    fn from(engine: &EngineConfig) -> Self {
        Self {
            max_depth: engine.max_depth,
            max_payload_bytes: engine.max_payload_bytes,
        }
    }
}

/// Run budget. Unset limits are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_tool_calls: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding run events.
    #[serde(default = "default_database")]
    pub database: String,
    /// Root of the content-addressed store.
    #[serde(default = "default_cas_dir")]
    pub cas_dir: String,
    /// SQLite database holding paused/suspended run checkpoints.
    #[serde(default = "default_checkpoints")]
    pub checkpoints: String,
}

fn default_database() -> String {
    "~/.reach/events.db".to_string()
}

fn default_cas_dir() -> String {
    "~/.reach/cas".to_string()
}

fn default_checkpoints() -> String {
    "~/.reach/checkpoints.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            cas_dir: default_cas_dir(),
            checkpoints: default_checkpoints(),
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.database)
    }

    pub fn cas_path(&self) -> PathBuf {
        expand_home(&self.cas_dir)
    }

    pub fn checkpoints_path(&self) -> PathBuf {
        expand_home(&self.checkpoints)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Admit unsigned packs. Every admission is logged.
    #[serde(default)]
    pub allow_unsigned: bool,
    #[serde(default)]
    pub signers: Vec<TrustedSignerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedSignerConfig {
    pub id: String,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptersConfig {
    /// Register the deterministic fallback for unbound tools.
    #[serde(default = "default_true")]
    pub fallback: bool,
    #[serde(default)]
    pub hosted: Vec<HostedAdapterConfig>,
    #[serde(default)]
    pub local: Vec<LocalAdapterConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            fallback: true,
            hosted: Vec::new(),
            local: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedAdapterConfig {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_adapter_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalAdapterConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_adapter_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_adapter_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ReachConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ReachError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| ReachError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        let depth = self.engine.max_depth;
        if depth == 0 || depth > DEFAULT_MAX_DEPTH {
            return Err(ReachError::Config(format!(
                "engine.max_depth must be between 1 and {}, got {}",
                DEFAULT_MAX_DEPTH, depth
            )));
        }
        if self.engine.max_payload_bytes == 0 {
            return Err(ReachError::Config(
                "engine.max_payload_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Resolve a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
