//! DAG builder, validation, and stage-group computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph (edge
//! direction: dependency -> dependent) and Kahn's algorithm to peel it into
//! stage groups: each round removes every zero-in-degree node, and the nodes
//! removed together form one group. Nodes never removed sit on or behind a
//! cycle.

use std::collections::{BTreeSet, HashMap};

use gantry_types::workflow::StepDefinition;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// Ordered stage groups for one workflow.
///
/// Steps in a group do not depend on each other; every dependency of a step
/// lives in a strictly earlier group. Ids inside a group are sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub groups: Vec<Vec<String>>,
    /// Steps with neither dependencies nor dependents in a multi-step workflow.
    /// They still run (in the first group) but are likely wiring mistakes.
    pub orphans: Vec<String>,
}

impl ExecutionPlan {
    /// Index of the group containing `step_id`.
    pub fn group_of(&self, step_id: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|group| group.iter().any(|id| id == step_id))
    }

    pub fn step_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    /// Human-readable warnings produced while planning.
    pub fn warnings(&self) -> Vec<String> {
        self.orphans
            .iter()
            .map(|id| format!("step '{id}' has no dependencies and no dependents"))
            .collect()
    }
}

/// Validate the dependency graph and group steps into stages.
///
/// Validates, in order:
/// 1. Every `depends_on` id names a declared step.
/// 2. The graph is acyclic; otherwise every step that could not be scheduled
///    is listed in the error.
///
/// Orphans are reported on the plan, not as errors.
pub fn build_execution_plan(steps: &[StepDefinition]) -> Result<ExecutionPlan, WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, NodeIndex> = steps
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();

    for step in steps {
        let to = nodes[step.id.as_str()];
        let deps: BTreeSet<&str> = step.depends_on.iter().map(String::as_str).collect();
        for dep in deps {
            let from = nodes
                .get(dep)
                .ok_or_else(|| WorkflowError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.to_string(),
                })?;
            graph.add_edge(*from, to, ());
        }
    }

    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut ready: Vec<NodeIndex> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| *node)
        .collect();

    let mut groups = Vec::new();
    let mut scheduled = 0;
    while !ready.is_empty() {
        let mut next = Vec::new();
        for &node in &ready {
            for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(dependent);
                    }
                }
            }
        }

        let mut group: Vec<String> = ready.iter().map(|n| graph[*n].to_string()).collect();
        group.sort();
        scheduled += group.len();
        groups.push(group);
        ready = next;
    }

    if scheduled < steps.len() {
        let mut stuck: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(node, _)| graph[*node].to_string())
            .collect();
        stuck.sort();
        return Err(WorkflowError::CycleDetected { steps: stuck });
    }

    let mut orphans: Vec<String> = if steps.len() > 1 {
        graph
            .node_indices()
            .filter(|n| graph.neighbors_undirected(*n).next().is_none())
            .map(|n| graph[n].to_string())
            .collect()
    } else {
        Vec::new()
    };
    orphans.sort();
    for orphan in &orphans {
        tracing::warn!(step_id = %orphan, "step has no dependencies and no dependents");
    }

    Ok(ExecutionPlan { groups, orphans })
}
