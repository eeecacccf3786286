//! The dependency graph: an arena of nodes indexed by target identifier.
//!
//! Edges store identifiers, never pointers, so no reference cycles exist at
//! the language level regardless of what the build declares. The graph is
//! mutable during construction (single-threaded), then effectively
//! immutable during execution except for the per-node atomic status cells.

mod node;

pub use node::{Node, NodeOutcome, NodeStatus};

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::{
    envelope::{self, SigningKey, magic},
    error::{BuildError, BuildErrorKind, Result},
    hash::Digest,
    target::{Target, TargetId},
};

/// DAG of build targets with forward and reverse adjacency.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<TargetId, Node>,
    deps: BTreeMap<TargetId, BTreeSet<TargetId>>,
    dependents: BTreeMap<TargetId, BTreeSet<TargetId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Idempotent: re-adding an existing target id is a no-op.
    #[instrument(skip(self, target), fields(id = %target.id))]
    pub fn add_node(&mut self, target: Target) {
        let id = target.id.clone();
        self.deps.entry(id.clone()).or_default();
        self.dependents.entry(id.clone()).or_default();
        self.nodes.entry(id).or_insert_with(|| Node::new(target));
    }

    /// Add a dependency edge `from -> to` (`from` depends on `to`).
    ///
    /// Fails atomically with `GraphCyclic` (carrying the offending path) if
    /// `to` transitively reaches `from`; the graph is unchanged on failure.
    #[instrument(skip(self))]
    pub fn add_edge(&mut self, from: &TargetId, to: &TargetId) -> Result<()> {
        for id in [from, to] {
            if !self.nodes.contains_key(id) {
                return Err(BuildError::new(BuildErrorKind::GraphMissingNode {
                    id: id.clone(),
                    wanted_by: from.clone(),
                }));
            }
        }
        if let Some(mut path) = self.path_between(to, from) {
            // Render the cycle starting and ending at `from`.
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(from.clone());
            cycle.append(&mut path);
            return Err(BuildError::new(BuildErrorKind::GraphCyclic { path: cycle }));
        }

        self.deps.entry(from.clone()).or_default().insert(to.clone());
        self.dependents.entry(to.clone()).or_default().insert(from.clone());
        trace!("edge added");
        Ok(())
    }

    /// Iterative DFS from `start` to `goal` along dependency edges.
    /// Returns the path `[start, .., goal]` if one exists. No recursion:
    /// real graphs exceed comfortable stack depths.
    fn path_between(&self, start: &TargetId, goal: &TargetId) -> Option<Vec<TargetId>> {
        if start == goal {
            return Some(vec![start.clone()]);
        }
        let mut parents: BTreeMap<TargetId, TargetId> = BTreeMap::new();
        let mut visited: BTreeSet<&TargetId> = BTreeSet::new();
        let mut stack: Vec<&TargetId> = vec![start];
        visited.insert(start);

        while let Some(current) = stack.pop() {
            let Some(nexts) = self.deps.get(current) else {
                continue;
            };
            for next in nexts {
                if visited.contains(next) {
                    continue;
                }
                parents.insert(next.clone(), current.clone());
                if next == goal {
                    let mut path = vec![goal.clone()];
                    let mut cursor = goal;
                    while let Some(parent) = parents.get(cursor) {
                        path.push(parent.clone());
                        cursor = parent;
                    }
                    path.reverse();
                    return Some(path);
                }
                visited.insert(next);
                stack.push(next);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &TargetId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TargetId> {
        self.nodes.keys()
    }

    /// Direct dependencies of a node.
    pub fn deps_of(&self, id: &TargetId) -> impl Iterator<Item = &TargetId> {
        self.deps.get(id).into_iter().flatten()
    }

    /// Direct dependents of a node: the primary reverse index used during
    /// scheduling.
    pub fn dependents_of(&self, id: &TargetId) -> impl Iterator<Item = &TargetId> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// Validate the graph and assign depths.
    ///
    /// Checks that every referenced dependency exists, that no cycle
    /// survived construction, and computes `depth(n) = 1 + max(depth(d))`
    /// with leaves at 0.
    #[instrument(skip(self))]
    pub fn validate(&self) -> Result<()> {
        for (id, deps) in &self.deps {
            for dep in deps {
                if !self.nodes.contains_key(dep) {
                    return Err(BuildError::new(BuildErrorKind::GraphMissingNode {
                        id: dep.clone(),
                        wanted_by: id.clone(),
                    }));
                }
            }
        }

        // Kahn over the dependency direction: process leaves first so each
        // node's depth is final when reached.
        let order = self.topo_order()?;
        for id in &order {
            let depth = self
                .deps_of(id)
                .filter_map(|dep| self.nodes.get(dep))
                .map(|node| node.depth() + 1)
                .max()
                .unwrap_or(0);
            if let Some(node) = self.nodes.get(id) {
                node.set_depth(depth);
            }
        }
        debug!(nodes = self.nodes.len(), "graph validated");
        Ok(())
    }

    /// Deterministic topological order, dependencies before dependents.
    /// Ties between equally-ready nodes break by lexicographic target id.
    pub fn topo_order(&self) -> Result<Vec<TargetId>> {
        let mut remaining: BTreeMap<&TargetId, usize> = self
            .nodes
            .keys()
            .map(|id| (id, self.deps_of(id).count()))
            .collect();
        let mut ready: BTreeSet<&TargetId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.clone());
            for dependent in self.dependents_of(id) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            // Unreachable when edges went through add_edge, which rejects
            // cycles; report the cycle anyway if we got here.
            let stuck: Vec<TargetId> = remaining
                .into_iter()
                .filter(|(id, _)| !order.contains(id))
                .map(|(id, _)| id.clone())
                .collect();
            return Err(BuildError::new(BuildErrorKind::GraphCyclic { path: stuck }));
        }
        Ok(order)
    }

    /// Wave layout: nodes grouped by depth. All nodes within one wave are
    /// mutually independent and eligible for concurrent execution once the
    /// previous waves finished.
    pub fn waves(&self) -> Vec<Vec<TargetId>> {
        let mut waves: BTreeMap<u32, Vec<TargetId>> = BTreeMap::new();
        for (id, node) in &self.nodes {
            waves.entry(node.depth()).or_default().push(id.clone());
        }
        waves.into_values().collect()
    }

    /// Serialize to the signed compact binary form cached as `graph.bin`.
    /// `config_digest` is the invalidation key: a digest over every config
    /// input that shaped this graph.
    pub fn serialize(&self, key: &SigningKey, config_digest: &Digest) -> Result<Vec<u8>> {
        let record = GraphRecord {
            config_digest: *config_digest,
            targets: self
                .nodes
                .values()
                .map(|node| node.target().as_ref().clone())
                .collect(),
            edges: self
                .deps
                .iter()
                .flat_map(|(from, tos)| {
                    tos.iter().map(move |to| (from.clone(), to.clone()))
                })
                .collect(),
        };
        envelope::seal_json(magic::GRAPH, key, &record)
    }

    /// Load a serialized graph. Returns `None` when the config digest does
    /// not match (the caller rebuilds from scratch) or the envelope fails
    /// verification.
    pub fn deserialize(
        bytes: &[u8],
        key: &SigningKey,
        expected_config_digest: &Digest,
    ) -> Result<Option<DependencyGraph>> {
        let record: GraphRecord = match envelope::open_json(magic::GRAPH, key, bytes) {
            Ok(record) => record,
            Err(_) => return Ok(None),
        };
        if record.config_digest != *expected_config_digest {
            return Ok(None);
        }

        let mut graph = DependencyGraph::new();
        for target in record.targets {
            graph.add_node(target);
        }
        for (from, to) in record.edges {
            graph.add_edge(&from, &to)?;
        }
        Ok(Some(graph))
    }

    /// The subgraph reachable from `roots` along dependency edges, as a
    /// set of ids. Iterative BFS.
    pub fn reachable_from(&self, roots: &BTreeSet<TargetId>) -> BTreeSet<TargetId> {
        let mut seen: BTreeSet<TargetId> = BTreeSet::new();
        let mut queue: VecDeque<&TargetId> = roots.iter().collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            queue.extend(self.deps_of(id));
        }
        seen
    }
}

#[derive(Serialize, Deserialize)]
struct GraphRecord {
    config_digest: Digest,
    targets: Vec<Target>,
    edges: Vec<(TargetId, TargetId)>,
}
