use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use reach_core::canon::Canonicalizer;
use reach_core::error::{ReachError, Result};

use super::schema;
use super::edge::Guard;
use super::step::StepKind;
use super::{ValidatedWorkflow, Workflow};
use crate::decision::evaluate_decision;

/// Deepest allowed subworkflow nesting.
pub const MAX_NESTING: usize = 8;

fn id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]{1,256}$").ok())
        .as_ref()
}

fn invalid(wf: &Workflow, msg: impl std::fmt::Display) -> ReachError {
    ReachError::InvalidWorkflow(format!("{}: {}", wf.id, msg))
}

/// Validate once; the result is immutable and shared by every run.
pub fn validate(workflow: Workflow) -> Result<ValidatedWorkflow> {
    check(&workflow, 0)?;
    workflow.hash().map_err(|e| invalid(&workflow, e))?;
    debug!(workflow = %workflow.id, steps = workflow.nodes.len(), "Workflow validated");
    Ok(ValidatedWorkflow::new_unchecked(workflow))
}

/// Parse JSON and validate in one call.
pub fn compile(json: &str) -> Result<ValidatedWorkflow> {
    let workflow: Workflow = serde_json::from_str(json)?;
    validate(workflow)
}

fn check_id(wf: &Workflow, id: &str) -> Result<()> {
    let pattern = id_pattern()
        .ok_or_else(|| ReachError::Internal("id pattern failed to compile".into()))?;
    if !pattern.is_match(id) {
        return Err(invalid(wf, format!("invalid id '{}'", id)));
    }
    Ok(())
}

/// Embedded values end up in events and run state, so they get the same
/// nesting cap as run inputs.
fn check_value(wf: &Workflow, what: &str, value: &Value) -> Result<()> {
    Canonicalizer::default()
        .to_bytes(value)
        .map(|_| ())
        .map_err(|e| invalid(wf, format!("{}: {}", what, e)))
}

fn check(wf: &Workflow, depth: usize) -> Result<()> {
    if depth > MAX_NESTING {
        return Err(invalid(
            wf,
            format!("subworkflow nesting exceeds {}", MAX_NESTING),
        ));
    }
    check_id(wf, &wf.id)?;
    if wf.nodes.is_empty() {
        return Err(invalid(wf, "workflow has no steps"));
    }
    check_value(wf, "metadata", &wf.metadata)?;

    let mut ids = HashSet::new();
    for step in &wf.nodes {
        check_id(wf, &step.id)?;
        if !ids.insert(step.id.as_str()) {
            return Err(invalid(wf, format!("duplicate step id '{}'", step.id)));
        }
        if step.declared_capabilities.is_empty()
            || step.declared_capabilities.iter().any(|c| c.is_empty())
        {
            return Err(invalid(
                wf,
                format!("step '{}' must declare its capabilities", step.id),
            ));
        }
        if let Some(args) = &step.args {
            check_value(wf, &format!("step '{}' args", step.id), args)?;
        }
        if let Some(schema) = &step.input_schema {
            check_value(wf, &format!("step '{}' input_schema", step.id), schema)?;
            if !schema.is_object() {
                return Err(invalid(
                    wf,
                    format!("step '{}' input_schema must be an object", step.id),
                ));
            }
        }
        match &step.kind {
            StepKind::Subworkflow { workflow } => check(workflow, depth + 1)?,
            StepKind::Decision { model: Some(model) } => {
                evaluate_decision(model)
                    .map_err(|e| invalid(wf, format!("decision step '{}': {}", step.id, e)))?;
            }
            StepKind::Tool { tool, .. } if tool.is_empty() => {
                return Err(invalid(wf, format!("step '{}' names no tool", step.id)));
            }
            _ => {}
        }
    }

    if let Some(start) = wf.start_id() {
        if !ids.contains(start) {
            return Err(invalid(wf, format!("start step '{}' does not exist", start)));
        }
    }

    let mut out_degree: BTreeMap<&str, usize> = BTreeMap::new();
    for edge in &wf.edges {
        for end in [&edge.from, &edge.to] {
            if !ids.contains(end.as_str()) {
                return Err(invalid(
                    wf,
                    format!("edge {} -> {} references unknown step '{}'", edge.from, edge.to, end),
                ));
            }
        }
        if let Some(Guard::Equals { value, .. }) = &edge.guard {
            check_value(wf, &format!("guard on {} -> {}", edge.from, edge.to), value)?;
        }
        *out_degree.entry(edge.from.as_str()).or_default() += 1;
    }

    for step in &wf.nodes {
        let outgoing = out_degree.get(step.id.as_str()).copied().unwrap_or(0);
        if step.is_terminal() && outgoing > 0 {
            return Err(invalid(
                wf,
                format!("terminal step '{}' has outgoing edges", step.id),
            ));
        }
        if !step.is_terminal() && outgoing == 0 {
            return Err(invalid(
                wf,
                format!("step '{}' has no outgoing edges", step.id),
            ));
        }
    }

    check_cycles(wf)
}

/// Every cycle must pass through a loop step. Equivalently, the graph with
/// loop steps removed is acyclic.
fn check_cycles(wf: &Workflow) -> Result<()> {
    let bounded: HashSet<&str> = wf
        .nodes
        .iter()
        .filter(|s| s.is_loop())
        .map(|s| s.id.as_str())
        .collect();

    let mut adjacency: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for edge in &wf.edges {
        if bounded.contains(edge.from.as_str()) || bounded.contains(edge.to.as_str()) {
            continue;
        }
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .insert(edge.to.as_str());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

    for root in adjacency.keys().copied() {
        if marks.contains_key(root) {
            continue;
        }
        // Iterative DFS; each frame holds a node and its remaining successors.
        let mut stack: Vec<(&str, Vec<&str>)> = Vec::new();
        marks.insert(root, Mark::Visiting);
        stack.push((root, successors(&adjacency, root)));
        while let Some((node, pending)) = stack.last_mut() {
            let node = *node;
            let Some(next) = pending.pop() else {
                marks.insert(node, Mark::Done);
                stack.pop();
                continue;
            };
            match marks.get(next) {
                Some(Mark::Visiting) => {
                    return Err(invalid(
                        wf,
                        format!(
                            "unbounded cycle through '{}' (mark a step with max_iterations)",
                            next
                        ),
                    ));
                }
                Some(Mark::Done) => {}
                None => {
                    marks.insert(next, Mark::Visiting);
                    stack.push((next, successors(&adjacency, next)));
                }
            }
        }
    }
    Ok(())
}

fn successors<'a>(adjacency: &BTreeMap<&'a str, BTreeSet<&'a str>>, node: &str) -> Vec<&'a str> {
    adjacency
        .get(node)
        .map(|s| s.iter().rev().copied().collect())
        .unwrap_or_default()
}

/// Check the run input against every step schema, nested steps included.
pub fn check_input(wf: &Workflow, input: &Value) -> Result<()> {
    for step in &wf.nodes {
        if let Some(s) = &step.input_schema {
            schema::check(s, input).map_err(|e| {
                ReachError::Schema(format!("input rejected by step '{}': {}", step.id, e))
            })?;
        }
        if let StepKind::Subworkflow { workflow } = &step.kind {
            check_input(workflow, input)?;
        }
    }
    Ok(())
}
