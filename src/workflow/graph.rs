//! Execution Graph
//!
//! Resolves the raw `previous`/`next` IDs carried by step instances into
//! index-based adjacency, rejecting dangling references and cycles.

use std::collections::{HashMap, VecDeque};

use log::{debug, info};

use crate::error::StructuralError;

use super::model::StepInstance;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// The DAG of step instances.
///
/// Instance indices follow the expansion order (template declaration order,
/// then wildcard-value order) and double as the scheduling tie-break.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    instances: Vec<StepInstance>,
    index: HashMap<String, usize>,
    predecessors: Vec<Vec<usize>>,
    successors: Vec<Vec<usize>>,
}

impl ExecutionGraph {
    /// Builds the graph, failing on the first structural problem found.
    ///
    /// Edges are the union of every instance's `previous` list and the
    /// reversed `next` lists; duplicates collapse.
    pub fn build(instances: Vec<StepInstance>) -> Result<Self, StructuralError> {
        let mut index = HashMap::with_capacity(instances.len());
        for (i, instance) in instances.iter().enumerate() {
            if index.insert(instance.id.clone(), i).is_some() {
                return Err(StructuralError::DuplicateInstance(instance.id.clone()));
            }
        }

        let resolve = |step: &str, reference: &str| -> Result<usize, StructuralError> {
            index
                .get(reference)
                .copied()
                .ok_or_else(|| StructuralError::DanglingReference {
                    step: step.to_string(),
                    reference: reference.to_string(),
                })
        };

        let mut predecessors = vec![Vec::new(); instances.len()];
        let mut successors = vec![Vec::new(); instances.len()];

        let mut add_edge = |from: usize, to: usize| {
            if !successors[from].contains(&to) {
                successors[from].push(to);
                predecessors[to].push(from);
            }
        };

        for (i, instance) in instances.iter().enumerate() {
            for reference in &instance.previous {
                add_edge(resolve(&instance.id, reference)?, i);
            }
            for reference in &instance.next {
                add_edge(i, resolve(&instance.id, reference)?);
            }
        }

        for list in predecessors.iter_mut().chain(successors.iter_mut()) {
            list.sort_unstable();
        }

        let graph = Self {
            instances,
            index,
            predecessors,
            successors,
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(StructuralError::Cycle(cycle));
        }

        info!(
            "Execution graph: {} instances, {} edges",
            graph.len(),
            graph.edge_count()
        );
        Ok(graph)
    }

    /// Three-color DFS along successor edges; reaching an in-progress node
    /// closes a cycle. Returns the cycle path with its first node repeated.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut path = Vec::new();

        for start in 0..self.len() {
            if marks[start] == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(&self, node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<String>> {
        marks[node] = Mark::InProgress;
        path.push(node);

        for &next in &self.successors[node] {
            match marks[next] {
                Mark::InProgress => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..]
                        .iter()
                        .map(|&n| self.instances[n].id.clone())
                        .collect();
                    cycle.push(self.instances[next].id.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[node] = Mark::Done;
        None
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.successors.iter().map(Vec::len).sum()
    }

    pub fn instances(&self) -> &[StepInstance] {
        &self.instances
    }

    pub fn instance(&self, idx: usize) -> &StepInstance {
        &self.instances[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn predecessors(&self, idx: usize) -> &[usize] {
        &self.predecessors[idx]
    }

    pub fn successors(&self, idx: usize) -> &[usize] {
        &self.successors[idx]
    }

    /// Every instance reachable forward from `idx`, in index order, excluding `idx`.
    pub fn downstream(&self, idx: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut queue: VecDeque<usize> = self.successors[idx].iter().copied().collect();

        while let Some(node) = queue.pop_front() {
            if !seen[node] {
                seen[node] = true;
                queue.extend(self.successors[node].iter().copied());
            }
        }

        let cone: Vec<usize> = (0..self.len()).filter(|&n| seen[n]).collect();
        debug!(
            "Downstream of '{}': {} instance(s)",
            self.instances[idx].id,
            cone.len()
        );
        cone
    }
}
