#![forbid(unsafe_code)]

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;

/// Shared state threaded through one run of a graph.
///
/// The executor clones the state into an immutable snapshot for every step
/// it dispatches and folds returned patches back in through `merge`. A step
/// never mutates the authoritative state directly.
pub trait RunState: Clone + Send + Sync + 'static {
    type Patch: Send + 'static;

    /// Fold a partial update into the state. Fields absent from the patch
    /// MUST be left untouched; fields present replace the current value.
    fn merge(&mut self, patch: Self::Patch);
}

/// A unit of work bound to one named node.
///
/// Steps receive a fully-merged snapshot from a prior superstep and return a
/// partial update. They may perform their own I/O, but they must translate
/// malformed upstream responses into either a degraded-but-valid patch or an
/// error; raw unparsed output never flows into the state.
pub trait Step<S: RunState>: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn execute(&self, state: &S) -> Result<S::Patch>;
}

impl<S, F> Step<S> for F
where
    S: RunState,
    F: Fn(&S) -> Result<S::Patch> + Send + Sync,
{
    fn execute(&self, state: &S) -> Result<S::Patch> {
        self(state)
    }
}

pub type RouteFn<S> = Arc<dyn Fn(&S) -> String + Send + Sync>;

/// Where a conditional-edge label leads.
///
/// A label may enable a whole set of successors at once, so a fan-out from a
/// conditional decision needs no pass-through broadcast node. `End`
/// terminates the run successfully the instant the label is selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    End,
    Nodes(Vec<String>),
}

impl RouteTarget {
    #[must_use]
    pub fn node(name: &str) -> Self {
        Self::Nodes(vec![name.to_string()])
    }

    #[must_use]
    pub fn fan_out<I, T>(names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::Nodes(names.into_iter().map(Into::into).collect())
    }
}

pub struct ConditionalEdge<S: RunState> {
    pub route: RouteFn<S>,
    pub targets: BTreeMap<String, RouteTarget>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate node: {0}")]
    DuplicateNode(String),
    #[error("duplicate edge: {from} -> {to}")]
    DuplicateEdge { from: String, to: String },
    #[error("node {0} already has a conditional edge")]
    ConflictingConditionalEdge(String),
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("entry node {0} must not have incoming edges")]
    EntryHasIncoming(String),
    #[error("entry node not set")]
    MissingEntry,
    #[error("finish node not set")]
    MissingFinish,
    #[error("graph contains a cycle through node {0}")]
    Cycle(String),
    #[error("node {0} is not reachable from the entry node")]
    Unreachable(String),
}

/// Mutable builder for a `GraphDefinition`.
///
/// Node registration fails eagerly on duplicates; everything else (unknown
/// endpoints, cycles, reachability) is validated in `build`, so a topology
/// problem is always a build-time error, never a run-time surprise.
pub struct GraphBuilder<S: RunState> {
    nodes: BTreeMap<String, Arc<dyn Step<S>>>,
    edges: Vec<(String, String)>,
    conditional: BTreeMap<String, ConditionalEdge<S>>,
    entry: Option<String>,
    finish: Option<String>,
}

impl<S: RunState> Default for GraphBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RunState> GraphBuilder<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            conditional: BTreeMap::new(),
            entry: None,
            finish: None,
        }
    }

    /// Register a step under a unique node name.
    ///
    /// # Errors
    /// Returns `GraphError::DuplicateNode` when the name is already taken.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        step: impl Step<S> + 'static,
    ) -> Result<&mut Self, GraphError> {
        match self.nodes.entry(name.into()) {
            Entry::Occupied(occupied) => Err(GraphError::DuplicateNode(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(step));
                Ok(self)
            }
        }
    }

    /// Declare an unconditional dependency: `to` becomes eligible only after
    /// `from` completes (and, with multiple incoming edges, after all of
    /// them complete).
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Declare a conditional edge: after `from` completes, `route` is
    /// evaluated against the post-merge state and the returned label is
    /// looked up in `targets`.
    ///
    /// # Errors
    /// Returns `GraphError::ConflictingConditionalEdge` when `from` already
    /// has a conditional edge.
    pub fn add_conditional_edge(
        &mut self,
        from: impl Into<String>,
        route: impl Fn(&S) -> String + Send + Sync + 'static,
        targets: BTreeMap<String, RouteTarget>,
    ) -> Result<&mut Self, GraphError> {
        match self.conditional.entry(from.into()) {
            Entry::Occupied(occupied) => {
                Err(GraphError::ConflictingConditionalEdge(occupied.key().clone()))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ConditionalEdge {
                    route: Arc::new(route),
                    targets,
                });
                Ok(self)
            }
        }
    }

    pub fn set_entry(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry = Some(name.into());
        self
    }

    pub fn set_finish(&mut self, name: impl Into<String>) -> &mut Self {
        self.finish = Some(name.into());
        self
    }

    /// Validate the topology and freeze it into an immutable definition.
    ///
    /// # Errors
    /// Returns a `GraphError` when the entry or finish node is missing, an
    /// edge references an unregistered node, the entry has incoming edges,
    /// an edge is declared twice, the graph has a cycle, or a node is
    /// unreachable from the entry.
    pub fn build(self) -> Result<GraphDefinition<S>, GraphError> {
        let entry = self.entry.ok_or(GraphError::MissingEntry)?;
        let finish = self.finish.ok_or(GraphError::MissingFinish)?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::UnknownNode(entry));
        }
        if !self.nodes.contains_key(&finish) {
            return Err(GraphError::UnknownNode(finish));
        }

        let mut successors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut required_incoming: BTreeMap<String, usize> = BTreeMap::new();
        for name in self.nodes.keys() {
            successors.insert(name.clone(), Vec::new());
            required_incoming.insert(name.clone(), 0);
        }

        let mut seen_edges: BTreeSet<(String, String)> = BTreeSet::new();
        for (from, to) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::UnknownNode(from.clone()));
            }
            if !self.nodes.contains_key(to) {
                return Err(GraphError::UnknownNode(to.clone()));
            }
            if !seen_edges.insert((from.clone(), to.clone())) {
                return Err(GraphError::DuplicateEdge {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            if let Some(list) = successors.get_mut(from) {
                list.push(to.clone());
            }
            if let Some(count) = required_incoming.get_mut(to) {
                *count += 1;
            }
        }

        // A conditional edge contributes one required incoming edge to each
        // distinct candidate target, whichever label ends up selected.
        for (from, edge) in &self.conditional {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::UnknownNode(from.clone()));
            }
            let mut candidates: BTreeSet<&str> = BTreeSet::new();
            for target in edge.targets.values() {
                if let RouteTarget::Nodes(names) = target {
                    let mut in_label: BTreeSet<&str> = BTreeSet::new();
                    for name in names {
                        if !self.nodes.contains_key(name) {
                            return Err(GraphError::UnknownNode(name.clone()));
                        }
                        if !in_label.insert(name.as_str()) {
                            return Err(GraphError::DuplicateEdge {
                                from: from.clone(),
                                to: name.clone(),
                            });
                        }
                        candidates.insert(name.as_str());
                    }
                }
            }
            for name in candidates {
                if let Some(count) = required_incoming.get_mut(name) {
                    *count += 1;
                }
            }
        }

        if required_incoming.get(&entry).copied().unwrap_or(0) != 0 {
            return Err(GraphError::EntryHasIncoming(entry));
        }

        let graph = GraphDefinition {
            nodes: self.nodes,
            successors,
            conditional: self.conditional,
            required_incoming,
            entry,
            finish,
        };
        graph.check_acyclic()?;
        graph.check_reachable()?;
        Ok(graph)
    }
}

/// Immutable description of nodes and edges, fixed before any run starts.
pub struct GraphDefinition<S: RunState> {
    nodes: BTreeMap<String, Arc<dyn Step<S>>>,
    successors: BTreeMap<String, Vec<String>>,
    conditional: BTreeMap<String, ConditionalEdge<S>>,
    required_incoming: BTreeMap<String, usize>,
    entry: String,
    finish: String,
}

impl<S: RunState> GraphDefinition<S> {
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    #[must_use]
    pub fn finish(&self) -> &str {
        &self.finish
    }

    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Arc<dyn Step<S>>> {
        self.nodes.get(name)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    #[must_use]
    pub fn successors(&self, name: &str) -> &[String] {
        self.successors.get(name).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn conditional_edge(&self, name: &str) -> Option<&ConditionalEdge<S>> {
        self.conditional.get(name)
    }

    #[must_use]
    pub fn required_incoming(&self, name: &str) -> usize {
        self.required_incoming.get(name).copied().unwrap_or(0)
    }

    /// Every edge a node may enable, conditional candidates included.
    fn all_successors(&self, name: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .successors(name)
            .iter()
            .map(String::as_str)
            .collect();
        if let Some(edge) = self.conditional.get(name) {
            for target in edge.targets.values() {
                if let RouteTarget::Nodes(names) = target {
                    out.extend(names.iter().map(String::as_str));
                }
            }
        }
        out
    }

    fn check_acyclic(&self) -> Result<(), GraphError> {
        // Kahn over the full adjacency (unconditional + conditional candidates).
        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        for name in self.nodes.keys() {
            indegree.insert(name.as_str(), 0);
        }
        for name in self.nodes.keys() {
            for succ in self.all_successors(name) {
                if let Some(count) = indegree.get_mut(succ) {
                    *count += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut visited = 0_usize;
        while let Some(name) = queue.pop_front() {
            visited += 1;
            for succ in self.all_successors(name) {
                if let Some(count) = indegree.get_mut(succ) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }

        if visited == self.nodes.len() {
            return Ok(());
        }
        let stuck = indegree
            .iter()
            .find(|(_, count)| **count > 0)
            .map_or_else(|| self.entry.clone(), |(name, _)| (*name).to_string());
        Err(GraphError::Cycle(stuck))
    }

    fn check_reachable(&self) -> Result<(), GraphError> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        seen.insert(self.entry.as_str());
        queue.push_back(self.entry.as_str());
        while let Some(name) = queue.pop_front() {
            for succ in self.all_successors(name) {
                if seen.insert(succ) {
                    queue.push_back(succ);
                }
            }
        }
        for name in self.nodes.keys() {
            if !seen.contains(name.as_str()) {
                return Err(GraphError::Unreachable(name.clone()));
            }
        }
        Ok(())
    }
}
