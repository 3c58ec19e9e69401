use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A directed transition between two steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// No guard means "on success".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Guard {
    OnSuccess,
    OnFailure,
    OnDeny,
    /// JSON pointer into the run's output state compared for equality.
    Equals { path: String, value: Value },
    /// Matches the decision engine's recommended action.
    Choice { action: String },
}

/// How the source step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Denied,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: None,
        }
    }

    pub fn guarded(from: impl Into<String>, to: impl Into<String>, guard: Guard) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            guard: Some(guard),
        }
    }

    /// Whether this edge fires. `state` is the run output state and `choice`
    /// the recommendation of a decision step, if the source was one.
    pub fn matches(&self, outcome: Outcome, state: &Value, choice: Option<&str>) -> bool {
        match &self.guard {
            None | Some(Guard::OnSuccess) => outcome == Outcome::Success,
            Some(Guard::OnFailure) => outcome == Outcome::Failure,
            Some(Guard::OnDeny) => outcome == Outcome::Denied,
            Some(Guard::Equals { path, value }) => {
                outcome == Outcome::Success && state.pointer(path) == Some(value)
            }
            Some(Guard::Choice { action }) => {
                outcome == Outcome::Success && choice == Some(action.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unguarded_edge_is_success_only() {
        let e = Edge::new("a", "b");
        let s = json!({});
        assert!(e.matches(Outcome::Success, &s, None));
        assert!(!e.matches(Outcome::Failure, &s, None));
        assert!(!e.matches(Outcome::Denied, &s, None));
    }

    #[test]
    fn test_outcome_guards() {
        let s = json!({});
        let fail = Edge::guarded("a", "b", Guard::OnFailure);
        assert!(fail.matches(Outcome::Failure, &s, None));
        assert!(!fail.matches(Outcome::Success, &s, None));
        let deny = Edge::guarded("a", "b", Guard::OnDeny);
        assert!(deny.matches(Outcome::Denied, &s, None));
    }

    #[test]
    fn test_equals_guard() {
        let e = Edge::guarded(
            "poll",
            "done",
            Guard::Equals {
                path: "/steps/poll/ready".into(),
                value: json!(true),
            },
        );
        assert!(e.matches(Outcome::Success, &json!({"steps": {"poll": {"ready": true}}}), None));
        assert!(!e.matches(Outcome::Success, &json!({"steps": {"poll": {"ready": false}}}), None));
        assert!(!e.matches(Outcome::Success, &json!({}), None));
    }

    #[test]
    fn test_choice_guard() {
        let e = Edge::guarded("d", "x", Guard::Choice { action: "ship".into() });
        assert!(e.matches(Outcome::Success, &json!({}), Some("ship")));
        assert!(!e.matches(Outcome::Success, &json!({}), Some("hold")));
        assert!(!e.matches(Outcome::Success, &json!({}), None));
    }

    #[test]
    fn test_guard_serialization() {
        let e: Edge = serde_json::from_value(json!({
            "from": "a", "to": "b", "guard": {"type": "on_deny"}
        }))
        .unwrap();
        assert_eq!(e.guard, Some(Guard::OnDeny));
        let plain: Edge = serde_json::from_value(json!({"from": "a", "to": "b"})).unwrap();
        assert!(plain.guard.is_none());
    }
}
