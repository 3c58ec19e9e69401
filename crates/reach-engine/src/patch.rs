//! Structural diff between JSON values.
//!
//! Changes are addressed by JSON Pointer (RFC 6901). Objects are compared
//! key by key in sorted order; arrays index by index, with a length change
//! reported as adds or removes at the tail.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl Change {
    pub fn op(&self) -> &'static str {
        match (&self.before, &self.after) {
            (None, Some(_)) => "add",
            (Some(_), None) => "remove",
            _ => "replace",
        }
    }
}

/// Escape one pointer segment.
pub fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Pointer built from unescaped segments.
pub fn pointer<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for s in segments {
        out.push('/');
        out.push_str(&escape_segment(s.as_ref()));
    }
    out
}

/// Every difference between `before` and `after`, rooted at `base`.
pub fn diff_at(base: &str, before: Option<&Value>, after: Option<&Value>) -> Vec<Change> {
    let mut out = Vec::new();
    walk(base.to_string(), before, after, &mut out);
    out
}

pub fn diff(before: &Value, after: &Value) -> Vec<Change> {
    diff_at("", Some(before), Some(after))
}

fn walk(path: String, before: Option<&Value>, after: Option<&Value>, out: &mut Vec<Change>) {
    match (before, after) {
        (None, None) => {}
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = format!("{}/{}", path, escape_segment(key));
                walk(child, a.get(key), b.get(key), out);
            }
        }
        (Some(Value::Array(a)), Some(Value::Array(b))) => {
            for i in 0..a.len().max(b.len()) {
                walk(format!("{}/{}", path, i), a.get(i), b.get(i), out);
            }
        }
        (Some(a), Some(b)) if a == b => {}
        (before, after) => out.push(Change {
            path,
            before: before.cloned(),
            after: after.cloned(),
        }),
    }
}
