#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use gauntlet_graph::{GraphDefinition, RouteTarget, RunState, Step};

/// Shared cancellation flag for one run.
///
/// Covers both caller-initiated cancellation and caller-armed timeouts; the
/// executor owns no timers of its own. Cancellation stops dispatching new
/// nodes and discards the results of the in-flight round; merges that
/// already completed are not rolled back.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Run independent ready nodes on scoped threads. Sequential execution
    /// produces identical results; parallelism is a performance option only.
    pub parallel: bool,
    pub cancel: CancelToken,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("step '{node}' failed: {source}")]
    Step {
        node: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("conditional edge on '{node}' returned unknown label '{label}'")]
    Routing { node: String, label: String },
    #[error("run cancelled before completion")]
    Cancelled,
    #[error("no runnable nodes remain while unfinished nodes exist")]
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeStatus {
    Pending,
    Running,
    Done,
    Pruned,
}

/// Drives one run of a graph definition against one initial state.
///
/// Execution proceeds in supersteps: every node whose incoming edges are all
/// satisfied is dispatched, results are merged one at a time in node-name
/// order, and edge resolution after each merge decides the next ready set.
/// Scheduling decisions and merges live on the caller's thread, so steps
/// never contend on the state even when their bodies run concurrently.
pub struct Executor {
    config: ExecutorConfig,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl Executor {
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    /// Execute one run to completion or early termination.
    ///
    /// # Errors
    /// Returns `ExecuteError::Step` wrapping the first failing step's error,
    /// `ExecuteError::Routing` for an unknown conditional label,
    /// `ExecuteError::Cancelled` when the token fires, or
    /// `ExecuteError::Stalled` when no runnable node remains while
    /// unfinished nodes exist.
    pub fn invoke<S: RunState>(
        &self,
        graph: &GraphDefinition<S>,
        initial: S,
    ) -> Result<S, ExecuteError> {
        let mut status: BTreeMap<String, NodeStatus> = graph
            .node_names()
            .map(|name| (name.to_string(), NodeStatus::Pending))
            .collect();
        let mut satisfied: BTreeMap<String, usize> = graph
            .node_names()
            .map(|name| (name.to_string(), 0))
            .collect();
        let mut state = initial;

        loop {
            if self.config.cancel.is_cancelled() {
                return Err(ExecuteError::Cancelled);
            }

            // BTreeMap order keeps dispatch and merge order deterministic.
            let ready: Vec<String> = status
                .iter()
                .filter(|(name, node_status)| {
                    **node_status == NodeStatus::Pending
                        && satisfied.get(*name).copied().unwrap_or(0)
                            >= graph.required_incoming(name)
                })
                .map(|(name, _)| name.clone())
                .collect();

            if ready.is_empty() {
                return Err(ExecuteError::Stalled);
            }

            for name in &ready {
                status.insert(name.clone(), NodeStatus::Running);
            }

            let results = self.run_round(graph, &state, &ready);

            if self.config.cancel.is_cancelled() {
                return Err(ExecuteError::Cancelled);
            }

            for (name, result) in results {
                let patch = result.map_err(|source| ExecuteError::Step {
                    node: name.clone(),
                    source,
                })?;
                state.merge(patch);
                status.insert(name.clone(), NodeStatus::Done);

                for succ in graph.successors(&name) {
                    if let Some(count) = satisfied.get_mut(succ) {
                        *count += 1;
                    }
                }

                if let Some(edge) = graph.conditional_edge(&name) {
                    // Routing reads the post-merge state.
                    let label = (edge.route)(&state);
                    let Some(target) = edge.targets.get(&label) else {
                        return Err(ExecuteError::Routing { node: name, label });
                    };
                    match target {
                        RouteTarget::End => return Ok(state),
                        RouteTarget::Nodes(selected) => {
                            for node in selected {
                                if let Some(count) = satisfied.get_mut(node) {
                                    *count += 1;
                                }
                            }
                            let chosen: BTreeSet<&str> =
                                selected.iter().map(String::as_str).collect();
                            for other in edge.targets.values() {
                                if let RouteTarget::Nodes(candidates) = other {
                                    for candidate in candidates {
                                        if !chosen.contains(candidate.as_str()) {
                                            prune(graph, &mut status, candidate);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }

                if name == graph.finish() {
                    return Ok(state);
                }
            }
        }
    }

    fn run_round<S: RunState>(
        &self,
        graph: &GraphDefinition<S>,
        state: &S,
        ready: &[String],
    ) -> Vec<(String, anyhow::Result<S::Patch>)> {
        if !self.config.parallel || ready.len() == 1 {
            return ready
                .iter()
                .map(|name| (name.clone(), execute_node(graph, state, name)))
                .collect();
        }

        thread::scope(|scope| {
            let handles: Vec<_> = ready
                .iter()
                .map(|name| {
                    let step = graph.step(name).map(Arc::clone);
                    let snapshot = state.clone();
                    let handle = scope.spawn(move || match step {
                        Some(step) => step.execute(&snapshot),
                        None => Err(anyhow!("node has no registered step")),
                    });
                    (name.clone(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("step panicked")));
                    (name, result)
                })
                .collect()
        })
    }
}

fn execute_node<S: RunState>(
    graph: &GraphDefinition<S>,
    state: &S,
    name: &str,
) -> anyhow::Result<S::Patch> {
    graph
        .step(name)
        .ok_or_else(|| anyhow!("node has no registered step"))?
        .execute(state)
}

/// Mark a never-selected branch unreachable for this run.
///
/// Pruning cascades: a successor joining on a pruned node can never have all
/// of its incoming edges satisfied, so it is pruned too rather than executed
/// as a no-op.
fn prune<S: RunState>(
    graph: &GraphDefinition<S>,
    status: &mut BTreeMap<String, NodeStatus>,
    root: &str,
) {
    let mut stack = vec![root.to_string()];
    while let Some(name) = stack.pop() {
        if status.get(&name) != Some(&NodeStatus::Pending) {
            continue;
        }
        status.insert(name.clone(), NodeStatus::Pruned);
        for succ in graph.successors(&name) {
            stack.push(succ.clone());
        }
        if let Some(edge) = graph.conditional_edge(&name) {
            for target in edge.targets.values() {
                if let RouteTarget::Nodes(names) = target {
                    for candidate in names {
                        stack.push(candidate.clone());
                    }
                }
            }
        }
    }
}
