//! Fixtures and scripted collaborators shared by the Reach test suites.
//!
//! Workflows are handed out as JSON so any crate can compile them without
//! this crate depending on the engine.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use reach_core::error::{ReachError, Result};
use reach_core::policy::{Capability, PackContext, PackIntegrity, Policy};
use reach_core::traits::{StorageDriver, ToolAdapter};
use reach_core::types::{AdapterKind, Event, RunId, ToolCall, ToolResult};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Fixtures ────────────────────────────────────────────────────

/// fetch (http.get) → summarize (llm.summarize, model "small") → done
pub fn linear_workflow() -> Value {
    json!({
        "id": "linear",
        "metadata": {"owner": "tests"},
        "nodes": [
            {
                "id": "fetch",
                "kind": {"type": "tool", "tool": "http.get", "permissions": ["net.read"]},
                "declared_capabilities": ["http.get"],
                "input_schema": {"type": "object", "required": ["url"]},
                "args": {"method": "GET"}
            },
            {
                "id": "summarize",
                "kind": {"type": "tool", "tool": "llm.summarize", "model": "small"},
                "declared_capabilities": ["llm.summarize"]
            },
            {
                "id": "done",
                "kind": {"type": "terminal"},
                "declared_capabilities": ["control"]
            }
        ],
        "edges": [
            {"from": "fetch", "to": "summarize"},
            {"from": "summarize", "to": "done"}
        ]
    })
}

/// `poll` repeats until its output has `ready == true`, at most `max` visits.
pub fn loop_workflow(max: u32) -> Value {
    json!({
        "id": "poller",
        "nodes": [
            {
                "id": "poll",
                "kind": {"type": "tool", "tool": "queue.poll"},
                "declared_capabilities": ["queue.poll"],
                "max_iterations": max
            },
            {
                "id": "done",
                "kind": {"type": "terminal"},
                "declared_capabilities": ["control"]
            }
        ],
        "edges": [
            {"from": "poll", "to": "done", "guard": {"type": "equals", "path": "/steps/poll/ready", "value": true}},
            {"from": "poll", "to": "poll"}
        ]
    })
}

/// A chain of `n` tool calls to `echo` ending in a terminal step.
pub fn chain_workflow(n: usize) -> Value {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    for i in 0..n {
        nodes.push(json!({
            "id": format!("step{}", i),
            "kind": {"type": "tool", "tool": "echo"},
            "declared_capabilities": ["echo"],
            "args": {"index": i}
        }));
        let next = if i + 1 == n {
            "done".to_string()
        } else {
            format!("step{}", i + 1)
        };
        edges.push(json!({"from": format!("step{}", i), "to": next}));
    }
    nodes.push(json!({
        "id": "done",
        "kind": {"type": "terminal"},
        "declared_capabilities": ["control"]
    }));
    json!({"id": format!("chain{}", n), "nodes": nodes, "edges": edges})
}

/// `write` asks for the `fs.write` permission, which [`sample_policy`] never
/// grants even though it allows the tool. A denial
/// is routed to `report`; without the `on_deny` edge the run fails.
pub fn deny_workflow(with_on_deny: bool) -> Value {
    let mut edges = vec![json!({"from": "write", "to": "done"})];
    let mut nodes = vec![
        json!({
            "id": "write",
            "kind": {"type": "tool", "tool": "fs.write", "permissions": ["fs.write"]},
            "declared_capabilities": ["fs.write"]
        }),
        json!({
            "id": "done",
            "kind": {"type": "terminal"},
            "declared_capabilities": ["control"]
        }),
    ];
    if with_on_deny {
        nodes.push(json!({
            "id": "report",
            "kind": {"type": "tool", "tool": "echo"},
            "declared_capabilities": ["echo"]
        }));
        edges.push(json!({"from": "write", "to": "report", "guard": {"type": "on_deny"}}));
        edges.push(json!({"from": "report", "to": "done"}));
    }
    json!({"id": "denied", "nodes": nodes, "edges": edges})
}

/// `decide` scores two actions and routes on the recommendation.
pub fn decision_workflow() -> Value {
    json!({
        "id": "decider",
        "nodes": [
            {
                "id": "decide",
                "kind": {"type": "decision", "model": {
                    "actions": [{"id": "ship"}, {"id": "hold"}],
                    "scenarios": [
                        {"id": "calm", "probability": 0.7},
                        {"id": "storm", "probability": 0.3, "adversarial": true}
                    ],
                    "outcomes": [
                        ["ship", "calm", 10.0], ["ship", "storm", 4.0],
                        ["hold", "calm", 2.0], ["hold", "storm", 1.0]
                    ]
                }},
                "declared_capabilities": ["control"]
            },
            {
                "id": "deploy",
                "kind": {"type": "tool", "tool": "echo"},
                "declared_capabilities": ["echo"],
                "args": {"action": "deploy"}
            },
            {
                "id": "wait",
                "kind": {"type": "tool", "tool": "echo"},
                "declared_capabilities": ["echo"],
                "args": {"action": "wait"}
            },
            {"id": "done", "kind": {"type": "terminal"}, "declared_capabilities": ["control"]}
        ],
        "edges": [
            {"from": "decide", "to": "deploy", "guard": {"type": "choice", "action": "ship"}},
            {"from": "decide", "to": "wait", "guard": {"type": "choice", "action": "hold"}},
            {"from": "deploy", "to": "done"},
            {"from": "wait", "to": "done"}
        ]
    })
}

/// outer: prepare → nested{inner echo} → done
pub fn subworkflow_workflow() -> Value {
    json!({
        "id": "outer",
        "nodes": [
            {"id": "prepare", "kind": {"type": "tool", "tool": "echo"}, "declared_capabilities": ["echo"]},
            {
                "id": "nested",
                "kind": {"type": "subworkflow", "workflow": {
                    "id": "inner",
                    "nodes": [
                        {"id": "work", "kind": {"type": "tool", "tool": "echo"}, "declared_capabilities": ["echo"]},
                        {"id": "end", "kind": {"type": "terminal"}, "declared_capabilities": ["control"]}
                    ],
                    "edges": [{"from": "work", "to": "end"}]
                }},
                "declared_capabilities": ["control"]
            },
            {"id": "done", "kind": {"type": "terminal"}, "declared_capabilities": ["control"]}
        ],
        "edges": [
            {"from": "prepare", "to": "nested"},
            {"from": "nested", "to": "done"}
        ]
    })
}

/// Grants every tool the fixtures use. `fs.write` is allowed as a tool but
/// without its permission.
pub fn sample_policy() -> Policy {
    Policy::new("test-1")
        .with_capability(
            Capability::new("web")
                .with_tools(["http.get"])
                .with_permissions(["net.read"]),
        )
        .with_capability(
            Capability::new("llm")
                .with_tools(["llm.summarize"])
                .with_models(["small"]),
        )
        .with_capability(Capability::new("util").with_tools(["echo", "queue.poll"]))
        .with_capability(Capability::new("files").with_tools(["fs.write"]))
}

/// A verified pack declaring the permissions the fixtures use.
pub fn sample_pack() -> PackContext {
    PackContext::new(
        "a3f1c0de5b7e4f2a9c8d6b5a4e3f2d1c0b9a8f7e6d5c4b3a2f1e0d9c8b7a6f5e",
        PackIntegrity::Verified {
            signer: "test-signer".into(),
        },
    )
    .with_tools(["http.get", "llm.summarize", "echo", "queue.poll", "fs.write"])
    .with_permissions(["net.read", "fs.write"])
}

pub fn sample_input() -> Value {
    json!({"url": "https://example.com/report", "limit": 3})
}

// ── Scripted adapter ────────────────────────────────────────────

/// Adapter that answers from per-tool scripts.
///
/// Each tool has a queue of replies. The last reply repeats once the queue
/// runs dry. Tools with no script echo their input.
pub struct ScriptedAdapter {
    name: String,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Arc<Mutex<Vec<ToolCall>>>,
    delay: Option<Duration>,
}

#[derive(Clone)]
enum Reply {
    Ok { output: Value, tokens: u64 },
    Fail(String),
    Error(String),
}

impl ScriptedAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    fn push(self, tool: &str, reply: Reply) -> Self {
        lock(&self.scripts)
            .entry(tool.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn respond(self, tool: &str, output: Value) -> Self {
        self.push(tool, Reply::Ok { output, tokens: 0 })
    }

    pub fn respond_with_tokens(self, tool: &str, output: Value, tokens: u64) -> Self {
        self.push(tool, Reply::Ok { output, tokens })
    }

    /// Reply with a failed [`ToolResult`].
    pub fn fail(self, tool: &str, error: &str) -> Self {
        self.push(tool, Reply::Fail(error.to_string()))
    }

    /// Return an adapter error instead of a result.
    pub fn error(self, tool: &str, message: &str) -> Self {
        self.push(tool, Reply::Error(message.to_string()))
    }

    /// Sleep before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Handle onto the recorded calls, usable after the adapter is moved.
    pub fn call_log(&self) -> Arc<Mutex<Vec<ToolCall>>> {
        Arc::clone(&self.calls)
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        lock(&self.calls).clone()
    }

    fn next_reply(&self, tool: &str) -> Option<Reply> {
        let mut scripts = lock(&self.scripts);
        let queue = scripts.get_mut(tool)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl ToolAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Local
    }

    fn invoke(&self, call: ToolCall) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            lock(&self.calls).push(call.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.next_reply(&call.tool) {
                Some(Reply::Ok { output, tokens }) => {
                    Ok(ToolResult::success(&call, output).with_tokens(tokens))
                }
                Some(Reply::Fail(error)) => Ok(ToolResult::failure(&call, error)),
                Some(Reply::Error(message)) => Err(ReachError::Adapter {
                    adapter: self.name.clone(),
                    message,
                }),
                None => Ok(ToolResult::success(
                    &call,
                    json!({"tool": call.tool, "echo": call.input}),
                )),
            }
        })
    }
}

// ── In-memory storage ───────────────────────────────────────────

/// Storage driver backed by a map. Clones share the same events.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    events: Arc<Mutex<HashMap<RunId, BTreeMap<u64, Event>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self, run_id: &RunId) -> usize {
        lock(&self.events).get(run_id).map(BTreeMap::len).unwrap_or(0)
    }
}

impl StorageDriver for InMemoryStorage {
    fn put(&self, run_id: &RunId, event: &Event) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let event = event.clone();
        Box::pin(async move {
            lock(&self.events)
                .entry(run_id)
                .or_default()
                .entry(event.seq)
                .or_insert(event);
            Ok(())
        })
    }

    fn get_events(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Event>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            Ok(lock(&self.events)
                .get(&run_id)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default())
        })
    }
}

/// Storage driver whose writes always fail.
#[derive(Clone, Default)]
pub struct FailingStorage;

impl StorageDriver for FailingStorage {
    fn put(&self, _run_id: &RunId, _event: &Event) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(ReachError::Storage("disk full".into())) })
    }

    fn get_events(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Event>>> {
        let run_id = run_id.to_string();
        Box::pin(async move { Err(ReachError::RunNotFound(run_id)) })
    }
}
