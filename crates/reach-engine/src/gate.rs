//! Policy gate.
//!
//! Pure function of (action, policy, pack). Rules run in a fixed order and
//! the first failure decides:
//!
//! 1. pack integrity
//! 2. tool declared by the step, the pack, and some policy capability
//! 3. requested permissions within pack-declared ∩ policy-allowed
//! 4. model on the policy allowlist for the tool
//! 5. determinism requirement
//!
//! Non-tool actions have no tool, permissions, or model, so rules 2-4 pass.

use serde::{Deserialize, Serialize};

use reach_core::policy::{DenyReason, PackContext, PackIntegrity, Policy};

use crate::graph::{Step, StepKind};

/// What a step is about to do, as seen by the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRequest {
    pub step_id: String,
    pub kind: String,
    pub declared_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub nondeterministic: bool,
}

impl GateRequest {
    pub fn for_step(step_id: impl Into<String>, step: &Step) -> Self {
        let mut req = Self {
            step_id: step_id.into(),
            kind: step.kind.label().to_string(),
            declared_capabilities: step.declared_capabilities.clone(),
            tool: None,
            permissions: Vec::new(),
            model: None,
            nondeterministic: false,
        };
        if let StepKind::Tool {
            tool,
            permissions,
            model,
            nondeterministic,
        } = &step.kind
        {
            req.tool = Some(tool.clone());
            req.permissions = permissions.clone();
            req.model = model.clone();
            req.nondeterministic = *nondeterministic;
        }
        req
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny(DenyReason),
}

impl GateDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decision view safe to hand to external callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactedDecision {
    pub decision: String,
    pub step: String,
    pub pack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub decision: GateDecision,
    pub redacted: RedactedDecision,
}

/// Mask an identifier: short values vanish, long ones keep 4 chars each end.
pub fn redact(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "redacted".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

fn decide(req: &GateRequest, policy: &Policy, pack: &PackContext) -> GateDecision {
    if matches!(pack.integrity, PackIntegrity::Invalid { .. }) {
        return GateDecision::Deny(DenyReason::InvalidSignature);
    }

    if let Some(tool) = &req.tool {
        let declared_by_step = req.declared_capabilities.iter().any(|c| c == tool);
        let declared_by_pack = pack.declared_tools.is_empty() || pack.declared_tools.contains(tool);
        if !declared_by_step || !declared_by_pack || !policy.allows_tool(tool) {
            return GateDecision::Deny(DenyReason::UndeclaredTool);
        }

        let allowed = policy.permissions_for(tool);
        let within = req
            .permissions
            .iter()
            .all(|p| allowed.contains(p) && pack.declared_permissions.contains(p));
        if !within {
            return GateDecision::Deny(DenyReason::PermissionScopeExceedsPolicy);
        }

        if let Some(model) = &req.model {
            if !policy.models_for(tool).contains(model) {
                return GateDecision::Deny(DenyReason::ModelRequirementNotAllowed);
            }
        }
    }

    if policy.determinism_required && req.nondeterministic {
        return GateDecision::Deny(DenyReason::DeterminismRequired);
    }

    GateDecision::Allow
}

/// Evaluate `req`. Holds no state and has no side effects.
pub fn evaluate(req: &GateRequest, policy: &Policy, pack: &PackContext) -> GateVerdict {
    let decision = decide(req, policy, pack);
    let redacted = RedactedDecision {
        decision: if decision.is_allow() { "allow" } else { "deny" }.to_string(),
        step: redact(&req.step_id),
        pack: redact(&pack.pack_hash),
        reason: match &decision {
            GateDecision::Allow => None,
            GateDecision::Deny(r) => Some(r.as_str().to_string()),
        },
    };
    GateVerdict { decision, redacted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reach_core::policy::Capability;
    use reach_test_utils::{sample_pack, sample_policy};

    fn tool_req(tool: &str) -> GateRequest {
        GateRequest {
            step_id: "fetch-remote-page".into(),
            kind: "tool".into(),
            declared_capabilities: vec![tool.to_string()],
            tool: Some(tool.to_string()),
            permissions: vec![],
            model: None,
            nondeterministic: false,
        }
    }

    fn deny(req: &GateRequest, policy: &Policy, pack: &PackContext) -> Option<DenyReason> {
        match evaluate(req, policy, pack).decision {
            GateDecision::Allow => None,
            GateDecision::Deny(r) => Some(r),
        }
    }

    #[test]
    fn test_allow() {
        let mut req = tool_req("http.get");
        req.permissions = vec!["net.read".into()];
        assert_eq!(deny(&req, &sample_policy(), &sample_pack()), None);
    }

    #[test]
    fn test_invalid_pack_wins_over_everything() {
        let mut pack = sample_pack();
        pack.integrity = PackIntegrity::Invalid {
            reason: "bad sig".into(),
        };
        let mut req = tool_req("not.allowed");
        req.nondeterministic = true;
        let policy = sample_policy().require_determinism(true);
        assert_eq!(deny(&req, &policy, &pack), Some(DenyReason::InvalidSignature));
    }

    #[test]
    fn test_undeclared_tool() {
        let mut req = tool_req("http.get");
        req.declared_capabilities = vec!["echo".into()];
        assert_eq!(
            deny(&req, &sample_policy(), &sample_pack()),
            Some(DenyReason::UndeclaredTool)
        );
        assert_eq!(
            deny(&tool_req("shell.exec"), &sample_policy(), &sample_pack()),
            Some(DenyReason::UndeclaredTool)
        );
    }

    #[test]
    fn test_permission_needs_pack_and_policy() {
        let mut req = tool_req("http.get");
        req.permissions = vec!["fs.write".into()];
        assert_eq!(
            deny(&req, &sample_policy(), &sample_pack()),
            Some(DenyReason::PermissionScopeExceedsPolicy)
        );

        let pack_without = PackContext::new("p", PackIntegrity::UnsignedOverride);
        req.permissions = vec!["net.read".into()];
        assert_eq!(
            deny(&req, &sample_policy(), &pack_without),
            Some(DenyReason::PermissionScopeExceedsPolicy)
        );
    }

    #[test]
    fn test_model_allowlist() {
        let mut req = tool_req("llm.summarize");
        req.model = Some("small".into());
        assert_eq!(deny(&req, &sample_policy(), &sample_pack()), None);
        req.model = Some("huge".into());
        assert_eq!(
            deny(&req, &sample_policy(), &sample_pack()),
            Some(DenyReason::ModelRequirementNotAllowed)
        );
    }

    #[test]
    fn test_determinism_required() {
        let mut req = tool_req("echo");
        req.nondeterministic = true;
        assert_eq!(deny(&req, &sample_policy(), &sample_pack()), None);
        let strict = sample_policy().require_determinism(true);
        assert_eq!(
            deny(&req, &strict, &sample_pack()),
            Some(DenyReason::DeterminismRequired)
        );
    }

    #[test]
    fn test_rule_order_scope_before_model() {
        let policy = Policy::new("v").with_capability(
            Capability::new("c")
                .with_tools(["t"])
                .with_permissions(["p"]),
        );
        let pack = PackContext::new("hash", PackIntegrity::UnsignedOverride).with_permissions(["p"]);
        let mut req = tool_req("t");
        req.permissions = vec!["q".into()];
        req.model = Some("m".into());
        assert_eq!(
            deny(&req, &policy, &pack),
            Some(DenyReason::PermissionScopeExceedsPolicy)
        );
    }

    #[test]
    fn test_non_tool_actions_pass_tool_rules() {
        let req = GateRequest {
            step_id: "end".into(),
            kind: "terminal".into(),
            declared_capabilities: vec!["control".into()],
            tool: None,
            permissions: vec![],
            model: None,
            nondeterministic: false,
        };
        let strict = Policy::new("empty").require_determinism(true);
        assert_eq!(deny(&req, &strict, &sample_pack()), None);
    }

    #[test]
    fn test_redaction() {
        assert_eq!(redact("short"), "redacted");
        assert_eq!(redact("12345678"), "redacted");
        assert_eq!(redact("123456789"), "1234...6789");
        let verdict = evaluate(&tool_req("shell.exec"), &sample_policy(), &sample_pack());
        assert_eq!(verdict.redacted.step, "fetc...page");
        assert_eq!(verdict.redacted.pack, "a3f1...6f5e");
        assert_eq!(verdict.redacted.reason.as_deref(), Some("undeclared_tool"));
        assert_eq!(verdict.redacted.decision, "deny");
    }

    #[test]
    fn test_same_inputs_same_verdict() {
        let req = tool_req("http.get");
        let a = evaluate(&req, &sample_policy(), &sample_pack());
        let b = evaluate(&req, &sample_policy(), &sample_pack());
        assert_eq!(a, b);
    }
}
