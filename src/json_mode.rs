//! One-shot JSON protocol: a single command object on stdin, a single
//! response object on stdout.
//!
//! ```json
//! {"command": "canon", "value": {"b": 1, "a": 2}}
//! {"ok": true, "result": {"canonical": "{\"a\":2,\"b\":1}", "hash": "..."}}
//! ```
//!
//! Failures come back as `{"ok": false, "error": <envelope>}`. Everything
//! here is pure, so identical requests yield byte-identical responses.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use reach_core::canon::{canonical_hash, canonical_string};
use reach_core::error::{ReachError, Result};
use reach_core::fingerprint::{compute_fingerprint, ENGINE_VERSION};
use reach_core::policy::{PackContext, Policy};
use reach_core::types::{Event, RunId};
use reach_engine::decision::DecisionInput;
use reach_engine::graph::Workflow;

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Request {
    Canon {
        value: Value,
    },
    Validate {
        workflow: Workflow,
    },
    Decide {
        input: DecisionInput,
    },
    Fingerprint {
        run_id: RunId,
        events: Vec<Event>,
    },
    VerifyReplay {
        workflow: Workflow,
        policy: Policy,
        pack: PackContext,
        events: Vec<Event>,
        #[serde(default)]
        fingerprint: Option<String>,
    },
}

fn dispatch(request: Request) -> Result<Value> {
    match request {
        Request::Canon { value } => Ok(json!({
            "canonical": canonical_string(&value)?,
            "hash": canonical_hash(&value)?,
        })),
        Request::Validate { workflow } => {
            let validated = reach_engine::validate(workflow)?;
            Ok(json!({
                "id": validated.id,
                "hash": validated.hash()?,
                "steps": validated.nodes.len(),
            }))
        }
        Request::Decide { input } => {
            let output = reach_engine::evaluate_decision(&input)?;
            Ok(serde_json::to_value(output)?)
        }
        Request::Fingerprint { run_id, events } => Ok(json!({
            "fingerprint": compute_fingerprint(&run_id, ENGINE_VERSION, events.iter())?,
        })),
        Request::VerifyReplay {
            workflow,
            policy,
            pack,
            events,
            fingerprint,
        } => {
            let workflow = reach_engine::validate(workflow)?;
            let outcome = reach_engine::verify_replay(
                &events,
                &workflow,
                Arc::new(policy.normalize()),
                pack,
                fingerprint.as_deref(),
            )?;
            Ok(serde_json::to_value(outcome)?)
        }
    }
}

/// Answer one request line.
pub fn handle(line: &str) -> Value {
    let result = serde_json::from_str::<Request>(line)
        .map_err(|e| ReachError::Schema(format!("request: {}", e)))
        .and_then(dispatch);
    match result {
        Ok(result) => json!({"ok": true, "result": result}),
        Err(e) => json!({"ok": false, "error": e.envelope()}),
    }
}
