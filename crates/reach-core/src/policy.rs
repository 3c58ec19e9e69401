use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canon::hash_serialize;
use crate::error::{ReachError, Result};
use crate::traits::PolicyLoader;

/// A scoped grant of tools, permissions, and models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    #[serde(default)]
    pub allowed_permissions: BTreeSet<String>,
    #[serde(default)]
    pub allowed_models: BTreeSet<String>,
}

impl Capability {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            allowed_tools: BTreeSet::new(),
            allowed_permissions: BTreeSet::new(),
            allowed_models: BTreeSet::new(),
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_permissions<I, S>(mut self, perms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_permissions.extend(perms.into_iter().map(Into::into));
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_models.extend(models.into_iter().map(Into::into));
        self
    }
}

/// Capability policy loaded once per run and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub determinism_required: bool,
}

impl Policy {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            capabilities: Vec::new(),
            determinism_required: false,
        }
    }

    pub fn with_capability(mut self, cap: Capability) -> Self {
        self.capabilities.push(cap);
        self.normalize()
    }

    pub fn require_determinism(mut self, required: bool) -> Self {
        self.determinism_required = required;
        self
    }

    /// Treat capabilities as a set: sorted by id, duplicates merged.
    pub fn normalize(mut self) -> Self {
        self.capabilities.sort_by(|a, b| a.id.cmp(&b.id));
        let mut merged: Vec<Capability> = Vec::with_capacity(self.capabilities.len());
        for cap in self.capabilities.drain(..) {
            match merged.last_mut() {
                Some(last) if last.id == cap.id => {
                    last.allowed_tools.extend(cap.allowed_tools);
                    last.allowed_permissions.extend(cap.allowed_permissions);
                    last.allowed_models.extend(cap.allowed_models);
                }
                _ => merged.push(cap),
            }
        }
        self.capabilities = merged;
        self
    }

    /// Canonical hash of the normalized policy.
    pub fn hash(&self) -> Result<String> {
        hash_serialize(&self.clone().normalize())
    }

    fn granting(&self, tool: &str) -> impl Iterator<Item = &Capability> {
        let tool = tool.to_string();
        self.capabilities
            .iter()
            .filter(move |c| c.allowed_tools.contains(&tool))
    }

    /// Whether any capability lists `tool`.
    pub fn allows_tool(&self, tool: &str) -> bool {
        self.granting(tool).next().is_some()
    }

    /// Union of permissions from capabilities that grant `tool`.
    pub fn permissions_for(&self, tool: &str) -> BTreeSet<String> {
        self.granting(tool)
            .flat_map(|c| c.allowed_permissions.iter().cloned())
            .collect()
    }

    /// Union of models from capabilities that grant `tool`.
    pub fn models_for(&self, tool: &str) -> BTreeSet<String> {
        self.granting(tool)
            .flat_map(|c| c.allowed_models.iter().cloned())
            .collect()
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let policy: Policy =
            toml::from_str(content).map_err(|e| ReachError::Schema(format!("policy: {}", e)))?;
        Ok(policy.normalize())
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let policy: Policy = serde_json::from_str(content)
            .map_err(|e| ReachError::Schema(format!("policy: {}", e)))?;
        Ok(policy.normalize())
    }
}

/// Why the gate refused an action. The string forms are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    InvalidSignature,
    UndeclaredTool,
    PermissionScopeExceedsPolicy,
    ModelRequirementNotAllowed,
    DeterminismRequired,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::UndeclaredTool => "undeclared_tool",
            Self::PermissionScopeExceedsPolicy => "permission_scope_exceeds_policy",
            Self::ModelRequirementNotAllowed => "model_requirement_not_allowed",
            Self::DeterminismRequired => "determinism_required",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DenyReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "invalid_signature" => Ok(Self::InvalidSignature),
            "undeclared_tool" => Ok(Self::UndeclaredTool),
            "permission_scope_exceeds_policy" => Ok(Self::PermissionScopeExceedsPolicy),
            "model_requirement_not_allowed" => Ok(Self::ModelRequirementNotAllowed),
            "determinism_required" => Ok(Self::DeterminismRequired),
            other => Err(format!("unknown deny reason: {}", other)),
        }
    }
}

/// Integrity status of the pack a run was started from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PackIntegrity {
    /// Signature checked against a trusted signer.
    Verified { signer: String },
    /// Unsigned, admitted by an explicit override.
    UnsignedOverride,
    /// Integrity could not be established.
    Invalid { reason: String },
}

impl PackIntegrity {
    pub fn is_trusted(&self) -> bool {
        !matches!(self, Self::Invalid { .. })
    }
}

/// What the gate knows about the originating pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackContext {
    pub pack_hash: String,
    pub integrity: PackIntegrity,
    #[serde(default)]
    pub declared_tools: BTreeSet<String>,
    #[serde(default)]
    pub declared_permissions: BTreeSet<String>,
}

impl PackContext {
    pub fn new(pack_hash: impl Into<String>, integrity: PackIntegrity) -> Self {
        Self {
            pack_hash: pack_hash.into(),
            integrity,
            declared_tools: BTreeSet::new(),
            declared_permissions: BTreeSet::new(),
        }
    }

    pub fn with_permissions<I, S>(mut self, perms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_permissions
            .extend(perms.into_iter().map(Into::into));
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_tools.extend(tools.into_iter().map(Into::into));
        self
    }
}

/// Loads policy bundles from `<root>/<reference>.toml` or `.json`.
pub struct FilePolicyLoader {
    root: PathBuf,
}

impl FilePolicyLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf> {
        if reference.is_empty()
            || reference.contains("..")
            || Path::new(reference).is_absolute()
        {
            return Err(ReachError::InvalidInput(format!(
                "invalid policy reference: {}",
                reference
            )));
        }
        for ext in ["toml", "json"] {
            let candidate = self.root.join(format!("{}.{}", reference, ext));
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        let direct = self.root.join(reference);
        if direct.is_file() {
            return Ok(direct);
        }
        Err(ReachError::ConfigNotFound(format!(
            "policy {} under {}",
            reference,
            self.root.display()
        )))
    }
}

impl PolicyLoader for FilePolicyLoader {
    fn load_policy(&self, reference: &str) -> BoxFuture<'_, Result<Policy>> {
        let resolved = self.resolve(reference);
        Box::pin(async move {
            let path = resolved?;
            let content = tokio::fs::read_to_string(&path).await?;
            let policy = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => Policy::from_json(&content)?,
                _ => Policy::from_toml(&content)?,
            };
            debug!(path = %path.display(), version = %policy.version, "Policy loaded");
            Ok(policy)
        })
    }
}
