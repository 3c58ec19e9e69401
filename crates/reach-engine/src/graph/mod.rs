//! Workflow graph IR.
//!
//! A workflow is an arena of [`Step`]s keyed by string id, joined by
//! [`Edge`]s evaluated in declaration order. Cycles are allowed only through
//! steps with an explicit `max_iterations`. A workflow becomes runnable once
//! [`validate`] wraps it in a [`ValidatedWorkflow`], which is shared by `Arc`
//! and never re-checked.

pub mod edge;
pub mod schema;
pub mod step;
pub mod validate;

use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use reach_core::canon::{Canonicalizer, DEFAULT_MAX_DEPTH};
use reach_core::error::Result;

pub use edge::{Edge, Guard, Outcome};
pub use step::{Step, StepKind};
pub use validate::{compile, validate, MAX_NESTING};

/// Hash cap for a whole workflow. Each subworkflow level adds four
/// containers (`nodes`, step, `kind`, `workflow`); the deepest embedded
/// value is an edge guard's, three containers below its workflow.
pub const WORKFLOW_MAX_DEPTH: usize = 4 * MAX_NESTING + 4 + DEFAULT_MAX_DEPTH;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub nodes: Vec<Step>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    /// Entry step. Defaults to the first node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
}

impl Workflow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            metadata: Value::Null,
            start: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.nodes.push(step);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn start_id(&self) -> Option<&str> {
        self.start
            .as_deref()
            .or_else(|| self.nodes.first().map(|s| s.id.as_str()))
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.nodes.iter().find(|s| s.id == id)
    }

    /// Edges leaving `id`, in declaration order.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Follow a path of step ids through nested subworkflows. The last id
    /// names the step; every earlier one must be a subworkflow step.
    pub fn resolve(&self, path: &[String]) -> Option<(&Workflow, &Step)> {
        let (last, parents) = path.split_last()?;
        let mut wf = self;
        for id in parents {
            match &wf.step(id)?.kind {
                StepKind::Subworkflow { workflow } => wf = &**workflow,
                _ => return None,
            }
        }
        Some((wf, wf.step(last)?))
    }

    pub fn hash(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        Canonicalizer::new(WORKFLOW_MAX_DEPTH).hash(&value)
    }
}

/// A workflow that passed [`validate`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ValidatedWorkflow(Arc<Workflow>);

impl ValidatedWorkflow {
    pub(crate) fn new_unchecked(workflow: Workflow) -> Self {
        Self(Arc::new(workflow))
    }

    pub fn arc(&self) -> &Arc<Workflow> {
        &self.0
    }
}

impl Deref for ValidatedWorkflow {
    type Target = Workflow;

    fn deref(&self) -> &Workflow {
        &self.0
    }
}
