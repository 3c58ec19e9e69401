use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decision::DecisionInput;
use crate::graph::Workflow;

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
    /// Capabilities this step may exercise. Must be explicit and non-empty.
    #[serde(default)]
    pub declared_capabilities: Vec<String>,
    /// Schema the run input must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Marks a bounded loop step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Static arguments passed to the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Tool {
        tool: String,
        #[serde(default)]
        permissions: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// The tool's output is not a pure function of its input.
        #[serde(default)]
        nondeterministic: bool,
    },
    Decision {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<DecisionInput>,
    },
    Subworkflow {
        workflow: Box<Workflow>,
    },
    Terminal,
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tool { .. } => "tool",
            Self::Decision { .. } => "decision",
            Self::Subworkflow { .. } => "subworkflow",
            Self::Terminal => "terminal",
        }
    }
}

impl Step {
    pub fn tool(id: impl Into<String>, tool: impl Into<String>) -> Self {
        let tool = tool.into();
        Self {
            id: id.into(),
            declared_capabilities: vec![tool.clone()],
            kind: StepKind::Tool {
                tool,
                permissions: Vec::new(),
                model: None,
                nondeterministic: false,
            },
            input_schema: None,
            max_iterations: None,
            timeout_ms: None,
            args: None,
        }
    }

    pub fn terminal(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: StepKind::Terminal,
            declared_capabilities: vec!["control".to_string()],
            input_schema: None,
            max_iterations: None,
            timeout_ms: None,
            args: None,
        }
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StepKind::Terminal)
    }

    pub fn is_loop(&self) -> bool {
        self.max_iterations.map(|n| n > 0).unwrap_or(false)
    }
}
