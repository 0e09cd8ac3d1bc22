//! DAG planner: dependency validation, cycle detection and layering.
//!
//! Steps are modelled as a `petgraph` graph with an edge `A -> B` whenever
//! `B.needs` contains `A`. Cycles are found with a three-colour depth-first
//! search so each one is reported with its full path; layering uses Kahn's
//! algorithm with document order as the tie-break inside a layer.

use std::collections::{BTreeSet, HashMap};

use petal_types::step::CanonicalStep;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::diagnostic::{Diagnostic, DiagnosticKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle {
        /// Step ids along the cycle; the first id is repeated at the end.
        path: Vec<String>,
    },

    #[error("step '{step}' needs unknown step '{need}'")]
    MissingDependency { step: String, need: String },

    #[error("step id '{0}' is defined more than once")]
    DuplicateId(String),
}

impl PlanError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        let location = match self {
            PlanError::Cycle { path } => format!("steps.{}", path.first().map(String::as_str).unwrap_or_default()),
            PlanError::MissingDependency { step, .. } => format!("steps.{step}.needs"),
            PlanError::DuplicateId(id) => format!("steps.{id}"),
        };
        Diagnostic::error(DiagnosticKind::Plan, location, self.to_string())
    }
}

/// Topological layering of a compiled plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Layer `n` holds steps whose dependencies all sit in layers `< n`.
    pub layers: Vec<Vec<String>>,
}

impl ExecutionPlan {
    /// Flattened dispatch order.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().flatten().map(String::as_str)
    }

    pub fn layer_of(&self, id: &str) -> Option<usize> {
        self.layers.iter().position(|layer| layer.iter().any(|s| s == id))
    }
}

/// Build the execution plan, reporting every problem found.
pub fn plan(steps: &[CanonicalStep]) -> Result<ExecutionPlan, Vec<PlanError>> {
    let mut errors = Vec::new();
    let mut graph = DiGraph::<&str, ()>::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for step in steps {
        if index.contains_key(step.id.as_str()) {
            errors.push(PlanError::DuplicateId(step.id.clone()));
            continue;
        }
        index.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
    }

    for step in steps {
        let to = index[step.id.as_str()];
        for need in &step.needs {
            match index.get(need.as_str()) {
                Some(&from) => {
                    graph.update_edge(from, to, ());
                }
                None => errors.push(PlanError::MissingDependency {
                    step: step.id.clone(),
                    need: need.clone(),
                }),
            }
        }
    }

    errors.extend(find_cycles(&graph));
    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(ExecutionPlan {
        layers: kahn_layers(&graph),
    })
}

/// Same as [`plan`], with errors as diagnostics.
pub fn plan_diagnostics(steps: &[CanonicalStep]) -> Result<ExecutionPlan, Vec<Diagnostic>> {
    plan(steps).map_err(|errors| errors.iter().map(PlanError::to_diagnostic).collect())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Successors, last in document order first, so `pop` visits them in order.
fn successors(graph: &DiGraph<&str, ()>, node: NodeIndex) -> Vec<NodeIndex> {
    let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
    next.sort_by(|a, b| b.cmp(a));
    next
}

fn find_cycles(graph: &DiGraph<&str, ()>) -> Vec<PlanError> {
    let mut color = vec![Color::White; graph.node_count()];
    let mut seen: BTreeSet<BTreeSet<NodeIndex>> = BTreeSet::new();
    let mut cycles = Vec::new();

    for start in graph.node_indices() {
        if color[start.index()] != Color::White {
            continue;
        }
        // Iterative DFS: each frame is a node and its remaining successors.
        let mut path: Vec<NodeIndex> = vec![start];
        let mut stack: Vec<Vec<NodeIndex>> = vec![successors(graph, start)];
        color[start.index()] = Color::Gray;

        while let Some(pending) = stack.last_mut() {
            let Some(next) = pending.pop() else {
                if let Some(done) = path.pop() {
                    color[done.index()] = Color::Black;
                }
                stack.pop();
                continue;
            };
            match color[next.index()] {
                Color::White => {
                    color[next.index()] = Color::Gray;
                    path.push(next);
                    stack.push(successors(graph, next));
                }
                Color::Gray => {
                    let from = path.iter().position(|&n| n == next).unwrap_or(0);
                    let members: BTreeSet<NodeIndex> = path[from..].iter().copied().collect();
                    if seen.insert(members) {
                        let mut ids: Vec<String> = path[from..].iter().map(|&n| graph[n].to_string()).collect();
                        ids.push(graph[next].to_string());
                        cycles.push(PlanError::Cycle { path: ids });
                    }
                }
                Color::Black => {}
            }
        }
    }
    cycles
}

fn kahn_layers(graph: &DiGraph<&str, ()>) -> Vec<Vec<String>> {
    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut current: Vec<NodeIndex> = graph.node_indices().filter(|n| indegree[n.index()] == 0).collect();
    let mut layers = Vec::new();

    while !current.is_empty() {
        current.sort();
        let mut next = Vec::new();
        for &node in &current {
            for succ in graph.neighbors_directed(node, Direction::Outgoing) {
                indegree[succ.index()] -= 1;
                if indegree[succ.index()] == 0 {
                    next.push(succ);
                }
            }
        }
        layers.push(current.iter().map(|&n| graph[n].to_string()).collect());
        current = next;
    }
    layers
}

/// Every step that transitively needs `id`.
pub fn dependents(steps: &[CanonicalStep], id: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let mut frontier = vec![id.to_string()];
    while let Some(current) = frontier.pop() {
        for step in steps {
            if step.needs.contains(&current) && out.insert(step.id.clone()) {
                frontier.push(step.id.clone());
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
