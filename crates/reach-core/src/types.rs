use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canon::{sha256_hex, Canonicalizer, EVENT_MAX_DEPTH};

/// Run identifier, a 64-char hex digest derived from pack, input, and sequence.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single entry in a run's event log.
///
/// `timestamp` is wall-clock metadata only. It is never hashed and never
/// compared during replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(seq: u64, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            seq,
            event_type: event_type.into(),
            payload,
            timestamp: None,
        }
    }

    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(Utc::now());
        self
    }

    /// Equality on the hashed fields only.
    pub fn same_content(&self, other: &Event) -> bool {
        self.seq == other.seq && self.event_type == other.event_type && self.payload == other.payload
    }
}

/// A tool invocation the engine asks its caller (or an adapter) to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub step_id: String,
    pub tool: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// The recorded outcome of a [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub step_id: String,
    pub tool: String,
    #[serde(default)]
    pub output: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
}

impl ToolResult {
    pub fn success(call: &ToolCall, output: Value) -> Self {
        Self {
            step_id: call.step_id.clone(),
            tool: call.tool.clone(),
            output,
            success: true,
            error: None,
            tokens_used: 0,
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            step_id: call.step_id.clone(),
            tool: call.tool.clone(),
            output: Value::Null,
            success: false,
            error: Some(error.into()),
            tokens_used: 0,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Hash over every field of the result, recorded next to it so replay
    /// notices an edit to any of them.
    pub fn digest(&self) -> crate::error::Result<String> {
        let value = serde_json::to_value(self)?;
        Canonicalizer::new(EVENT_MAX_DEPTH).hash(&value)
    }
}

/// Adapter family used to serve a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Hosted,
    Local,
    SmallDeterministicFallback,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hosted => write!(f, "hosted"),
            Self::Local => write!(f, "local"),
            Self::SmallDeterministicFallback => write!(f, "small_deterministic_fallback"),
        }
    }
}

/// A versioned, content-addressed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(with = "hex_bytes")]
    pub content: Vec<u8>,
    pub hash: String,
}

impl Artifact {
    pub fn new(id: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        let hash = sha256_hex(&content);
        Self {
            id: id.into(),
            content,
            hash,
        }
    }

    /// True when `hash` still matches `content`.
    pub fn verify(&self) -> bool {
        sha256_hex(&self.content) == self.hash
    }
}

/// Write-only observations published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    RunStarted { run_id: RunId, workflow_id: String },
    EventAppended { run_id: RunId, seq: u64, event_type: String },
    PolicyDenied { run_id: RunId, step_id: String, reason: String },
    RunFinished { run_id: RunId, status: String },
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
