//! DAG builder for constructing dependency graphs from units.
//!
//! The builder takes an ordered list of units with their declared
//! dependencies and produces a validated, immutable graph annotated with a
//! deterministic topological order and execution waves.

use crate::errors::GraphValidationError;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Index into the unit list (original input order).
pub type UnitIndex = usize;

/// Input to the builder: a unit id and the ids it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitNode {
    pub id: String,
    pub depends_on: Vec<String>,
}

impl UnitNode {
    pub fn new(id: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            depends_on,
        }
    }
}

/// A validated directed acyclic graph of units.
#[derive(Debug, Clone)]
pub struct UnitGraph {
    /// Unit ids in input order
    ids: Vec<String>,
    /// Map from unit id to index
    index_map: HashMap<String, UnitIndex>,
    /// Forward edges: index -> units that depend on it
    forward_edges: Vec<Vec<UnitIndex>>,
    /// Reverse edges: index -> units it depends on
    reverse_edges: Vec<Vec<UnitIndex>>,
    /// Topological order, ties broken by input order
    order: Vec<UnitIndex>,
    /// Position of each unit within `order`
    rank: Vec<usize>,
    /// Wave number of each unit
    wave_of: Vec<usize>,
}

impl UnitGraph {
    /// Get the number of units in the graph.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Get a unit id by index.
    pub fn id(&self, index: UnitIndex) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    /// All unit ids in input order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Get the index for a unit id.
    pub fn index_of(&self, id: &str) -> Option<UnitIndex> {
        self.index_map.get(id).copied()
    }

    /// Units that depend on the given unit (forward edges).
    pub fn dependents(&self, index: UnitIndex) -> &[UnitIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Units the given unit depends on (reverse edges).
    pub fn dependencies(&self, index: UnitIndex) -> &[UnitIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// A valid execution order. Among units whose dependencies are met at the
    /// same time, the one declared first comes first.
    pub fn topological_order(&self) -> &[UnitIndex] {
        &self.order
    }

    /// Unit ids in topological order.
    pub fn topological_ids(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    /// Position of a unit in the topological order.
    pub fn rank(&self, index: UnitIndex) -> usize {
        self.rank.get(index).copied().unwrap_or(usize::MAX)
    }

    /// Wave a unit belongs to.
    pub fn wave_of(&self, index: UnitIndex) -> usize {
        self.wave_of.get(index).copied().unwrap_or(0)
    }

    /// Execution waves - groups of units whose dependencies are all in
    /// earlier waves. Units within a wave keep topological order.
    pub fn waves(&self) -> Vec<Vec<String>> {
        let count = self.wave_of.iter().copied().max().map_or(0, |w| w + 1);
        let mut waves = vec![Vec::new(); count];
        for &i in &self.order {
            waves[self.wave_of[i]].push(self.ids[i].clone());
        }
        waves
    }

    /// Every unit that transitively depends on the given unit, in topological order.
    pub fn transitive_dependents(&self, index: UnitIndex) -> Vec<UnitIndex> {
        let mut seen = vec![false; self.len()];
        let mut stack: Vec<UnitIndex> = self.dependents(index).to_vec();
        while let Some(next) = stack.pop() {
            if !seen[next] {
                seen[next] = true;
                stack.extend_from_slice(self.dependents(next));
            }
        }
        self.order.iter().copied().filter(|&i| seen[i]).collect()
    }
}

/// Builder for constructing unit graphs.
pub struct DagBuilder {
    units: Vec<UnitNode>,
}

impl DagBuilder {
    /// Create a new builder with the given units.
    pub fn new(units: Vec<UnitNode>) -> Self {
        Self { units }
    }

    /// Build the unit graph.
    ///
    /// This validates the graph structure:
    /// - Ids are non-empty and unique
    /// - All dependencies reference existing units
    /// - No unit depends on itself
    /// - No cycles are allowed
    pub fn build(self) -> Result<UnitGraph, GraphValidationError> {
        let mut index_map = HashMap::with_capacity(self.units.len());
        for (i, unit) in self.units.iter().enumerate() {
            if unit.id.is_empty() {
                return Err(GraphValidationError::EmptyId { position: i });
            }
            if index_map.insert(unit.id.clone(), i).is_some() {
                return Err(GraphValidationError::DuplicateUnit {
                    unit: unit.id.clone(),
                });
            }
        }

        let mut forward_edges: Vec<Vec<UnitIndex>> = vec![Vec::new(); self.units.len()];
        let mut reverse_edges: Vec<Vec<UnitIndex>> = vec![Vec::new(); self.units.len()];

        for (to_idx, unit) in self.units.iter().enumerate() {
            for dep in &unit.depends_on {
                if dep == &unit.id {
                    return Err(GraphValidationError::SelfDependency {
                        unit: unit.id.clone(),
                    });
                }
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    GraphValidationError::UnknownDependency {
                        unit: unit.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;

                // Repeated declarations of the same dependency collapse to one edge
                if !reverse_edges[to_idx].contains(&from_idx) {
                    forward_edges[from_idx].push(to_idx);
                    reverse_edges[to_idx].push(from_idx);
                }
            }
        }

        let ids: Vec<String> = self.units.into_iter().map(|u| u.id).collect();

        if let Some(cycle) = find_cycle(&ids, &reverse_edges) {
            return Err(GraphValidationError::CircularDependency { cycle });
        }

        let order = topological_order(&forward_edges, &reverse_edges);
        let mut rank = vec![0; ids.len()];
        for (pos, &i) in order.iter().enumerate() {
            rank[i] = pos;
        }

        let mut wave_of = vec![0; ids.len()];
        for &i in &order {
            wave_of[i] = reverse_edges[i]
                .iter()
                .map(|&dep| wave_of[dep] + 1)
                .max()
                .unwrap_or(0);
        }

        Ok(UnitGraph {
            ids,
            index_map,
            forward_edges,
            reverse_edges,
            order,
            rank,
            wave_of,
        })
    }
}

/// Depth-first search along dependency edges, tracking which nodes are on
/// the current path. Returns the cycle members in path order, starting at
/// the node the back edge points to.
fn find_cycle(ids: &[String], reverse_edges: &[Vec<UnitIndex>]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        OnPath,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; ids.len()];
    let mut path: Vec<UnitIndex> = Vec::new();

    for root in 0..ids.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }

        // (node, position of the next dependency to visit)
        let mut stack: Vec<(UnitIndex, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnPath;
        path.push(root);

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            match reverse_edges[node].get(frame.1) {
                Some(&dep) => {
                    frame.1 += 1;
                    match marks[dep] {
                        Mark::OnPath => {
                            let start = path.iter().position(|&i| i == dep).unwrap_or(0);
                            return Some(path[start..].iter().map(|&i| ids[i].clone()).collect());
                        }
                        Mark::Unvisited => {
                            marks[dep] = Mark::OnPath;
                            path.push(dep);
                            stack.push((dep, 0));
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    path.pop();
                    stack.pop();
                }
            }
        }
    }

    None
}

/// Kahn's algorithm with a min-heap so ties resolve to input order.
fn topological_order(
    forward_edges: &[Vec<UnitIndex>],
    reverse_edges: &[Vec<UnitIndex>],
) -> Vec<UnitIndex> {
    let mut in_degree: Vec<usize> = reverse_edges.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<UnitIndex>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &dependent in &forward_edges[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }
    order
}
