use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::core::ArcStr;
use crate::engine::cycle::find_cycle;
use crate::error::ConfigError;

/// A named stage of task execution.
///
/// Phases are ordered by their relations: a phase runs after every phase it
/// consumes output from, and before every phase it adds dynamic tasks to.
/// Tasks that name no phase run in an implicit default phase, ahead of all
/// declared ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub(crate) name: ArcStr,
    pub(crate) consumes_output_from: Vec<ArcStr>,
    pub(crate) adds_dynamic_tasks_to: Vec<ArcStr>,
}

impl Phase {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            consumes_output_from: Vec::new(),
            adds_dynamic_tasks_to: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This phase must run after `other`.
    pub fn consumes_output_from(mut self, other: &Phase) -> Self {
        self.consumes_output_from.push(other.name.clone());
        self
    }

    /// This phase may add tasks to `other`, so it must run before it.
    pub fn adds_dynamic_tasks_to(mut self, other: &Phase) -> Self {
        self.adds_dynamic_tasks_to.push(other.name.clone());
        self
    }

    pub(crate) fn may_add_tasks_to(&self, other: &str) -> bool {
        self.adds_dynamic_tasks_to.iter().any(|p| p.as_ref() == other)
    }
}

/// Sorts phases so that every relation is respected.
///
/// Fails on duplicate names, references to undeclared phases and cycles.
pub fn sort_phases(phases: &[Phase]) -> Result<Vec<Phase>, ConfigError> {
    let mut graph = DiGraph::<usize, ()>::with_capacity(phases.len(), 0);
    let mut nodes = HashMap::new();

    for (i, phase) in phases.iter().enumerate() {
        let node = graph.add_node(i);
        if nodes.insert(phase.name.clone(), node).is_some() {
            return Err(ConfigError::DuplicatePhase(phase.name.to_string()));
        }
    }

    let lookup = |name: &ArcStr, referenced_by: &Phase| {
        nodes
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownPhase {
                phase: name.to_string(),
                referenced_by: referenced_by.name.to_string(),
            })
    };

    let mut edges = Vec::new();
    for phase in phases {
        let this = nodes[&phase.name];
        for before in &phase.consumes_output_from {
            edges.push((lookup(before, phase)?, this));
        }
        for after in &phase.adds_dynamic_tasks_to {
            edges.push((this, lookup(after, phase)?));
        }
    }

    for (from, to) in edges {
        graph.update_edge(from, to, ());
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order
            .into_iter()
            .map(|node| phases[graph[node]].clone())
            .collect()),
        Err(_) => {
            let cycle = find_cycle(&graph).unwrap_or_default();
            Err(ConfigError::PhaseCycle(
                cycle
                    .into_iter()
                    .map(|node| phases[graph[node]].name.to_string())
                    .collect(),
            ))
        }
    }
}
