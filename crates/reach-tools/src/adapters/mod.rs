pub mod fallback;
pub mod hosted;
pub mod local;

use serde_json::Value;

use reach_core::types::{ToolCall, ToolResult};

/// Interpret an adapter's JSON reply.
///
/// A reply shaped like a [`ToolResult`] (it has a boolean `success`) is taken
/// as one. Anything else is the raw output of a successful call. Identity
/// fields always come from the call, never the reply.
pub(crate) fn parse_reply(call: &ToolCall, reply: Value) -> ToolResult {
    let looks_like_result = reply
        .get("success")
        .map(Value::is_boolean)
        .unwrap_or(false);
    if looks_like_result {
        if let Ok(mut result) = serde_json::from_value::<ToolResult>(with_identity(call, reply.clone())) {
            result.step_id = call.step_id.clone();
            result.tool = call.tool.clone();
            return result;
        }
    }
    ToolResult::success(call, reply)
}

fn with_identity(call: &ToolCall, mut reply: Value) -> Value {
    if let Value::Object(map) = &mut reply {
        map.entry("step_id")
            .or_insert_with(|| Value::String(call.step_id.clone()));
        map.entry("tool")
            .or_insert_with(|| Value::String(call.tool.clone()));
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> ToolCall {
        ToolCall {
            step_id: "fetch".into(),
            tool: "http.get".into(),
            input: json!({"url": "https://example.com"}),
            permissions: vec![],
            model: None,
        }
    }

    #[test]
    fn test_raw_reply_is_output() {
        let r = parse_reply(&call(), json!({"body": "ok"}));
        assert!(r.success);
        assert_eq!(r.output, json!({"body": "ok"}));
    }

    #[test]
    fn test_result_shaped_reply() {
        let r = parse_reply(
            &call(),
            json!({"success": false, "error": "boom", "tokens_used": 12}),
        );
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("boom"));
        assert_eq!(r.tokens_used, 12);
        assert_eq!(r.step_id, "fetch");
    }

    #[test]
    fn test_reply_cannot_spoof_identity() {
        let r = parse_reply(
            &call(),
            json!({"success": true, "output": 1, "step_id": "other", "tool": "rm"}),
        );
        assert_eq!(r.step_id, "fetch");
        assert_eq!(r.tool, "http.get");
        assert_eq!(r.output, json!(1));
    }
}
