use futures::future::BoxFuture;
use serde_json::json;

use reach_core::canon::canonical_hash;
use reach_core::error::Result;
use reach_core::traits::ToolAdapter;
use reach_core::types::{AdapterKind, ToolCall, ToolResult};

/// Answers any call with a template derived from the canonical input hash.
/// No I/O, so the same call always yields the same result.
pub struct SmallDeterministicFallback {
    name: String,
}

impl SmallDeterministicFallback {
    pub fn new() -> Self {
        Self {
            name: "fallback".to_string(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn respond(call: &ToolCall) -> Result<ToolResult> {
        let digest = canonical_hash(&call.input)?;
        Ok(ToolResult::success(
            call,
            json!({
                "mode": "deterministic",
                "tool": call.tool,
                "echo": call.input,
                "digest": digest,
            }),
        ))
    }
}

impl Default for SmallDeterministicFallback {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolAdapter for SmallDeterministicFallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::SmallDeterministicFallback
    }

    fn invoke(&self, call: ToolCall) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move { Self::respond(&call) })
    }

    fn timeout_ms(&self) -> u64 {
        1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(input: serde_json::Value) -> ToolCall {
        ToolCall {
            step_id: "s".into(),
            tool: "summarize".into(),
            input,
            permissions: vec![],
            model: None,
        }
    }

    #[tokio::test]
    async fn test_same_input_same_output() {
        let adapter = SmallDeterministicFallback::new();
        let a = adapter.invoke(call(json!({"b": 1, "a": 2}))).await.unwrap();
        let b = adapter.invoke(call(json!({"a": 2, "b": 1}))).await.unwrap();
        assert_eq!(a.output["digest"], b.output["digest"]);
        assert_eq!(a.output["mode"], "deterministic");
        assert!(a.success);
    }

    #[tokio::test]
    async fn test_digest_tracks_input() {
        let adapter = SmallDeterministicFallback::new();
        let a = adapter.invoke(call(json!({"q": "x"}))).await.unwrap();
        let b = adapter.invoke(call(json!({"q": "y"}))).await.unwrap();
        assert_ne!(a.output["digest"], b.output["digest"]);
    }

    #[test]
    fn test_kind() {
        let adapter = SmallDeterministicFallback::named("fb");
        assert_eq!(adapter.name(), "fb");
        assert_eq!(adapter.kind(), AdapterKind::SmallDeterministicFallback);
    }
}
