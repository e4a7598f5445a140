//! Wait-For Graph and cycle analysis
//!
//! A wait-for graph (WFG) has an edge `A -> B` when thread A is blocked on a
//! resource currently held by thread B. A cycle in this graph is a deadlock.
//!
//! # How it works
//!
//! The graph is rebuilt from scratch on every detection tick and then searched
//! with an iterative depth-first traversal:
//! 1. Every node not yet visited starts a new traversal.
//! 2. The traversal keeps the current path and an "on path" set.
//! 3. Reaching a node that is on the current path closes a cycle: the sub-path
//!    from that node's position to the tail is reported.
//! 4. Reaching a node that an earlier traversal already exhausted stops there.
//!
//! Every node is visited once over the whole call, so the search is O(V+E).
//! Cycles are not deduplicated across traversals and their order follows map
//! iteration order, which is unspecified.

use crate::core::types::ThreadId;
use fxhash::{FxHashMap, FxHashSet};

/// Find all cycles in a graph where every thread waits for at most one thread
///
/// This is the explicit-lock case: a thread can only block inside one
/// acquisition call at a time.
///
/// # Arguments
/// * `graph` - Map of waiting thread to the thread holding what it waits for
///
/// # Returns
/// Every cycle found, each ordered along the wait chain
pub fn detect_cycles(graph: &FxHashMap<ThreadId, ThreadId>) -> Vec<Vec<ThreadId>> {
    search_cycles(graph.keys().copied(), |node| graph.get(&node).copied().into_iter())
}

/// Find all cycles in a graph where a thread may wait for several threads
///
/// # Arguments
/// * `graph` - Map of waiting thread to every thread presumed to block it
///
/// # Returns
/// Every cycle found, each ordered along the wait chain
pub fn detect_cycles_multi(graph: &FxHashMap<ThreadId, FxHashSet<ThreadId>>) -> Vec<Vec<ThreadId>> {
    search_cycles(graph.keys().copied(), |node| {
        graph.get(&node).into_iter().flat_map(|targets| targets.iter().copied())
    })
}

/// Iterative DFS shared by both graph shapes
fn search_cycles<R, F, I>(roots: R, neighbors: F) -> Vec<Vec<ThreadId>>
where
    R: Iterator<Item = ThreadId>,
    F: Fn(ThreadId) -> I,
    I: Iterator<Item = ThreadId>,
{
    let mut cycles = Vec::new();
    let mut visited = FxHashSet::default();
    let mut on_path = FxHashSet::default();
    let mut path: Vec<ThreadId> = Vec::new();
    let mut stack: Vec<I> = Vec::new();

    for root in roots {
        if !visited.insert(root) {
            continue;
        }
        on_path.insert(root);
        path.push(root);
        stack.push(neighbors(root));

        while let Some(pending) = stack.last_mut() {
            match pending.next() {
                Some(next) if on_path.contains(&next) => {
                    if let Some(start) = path.iter().position(|&t| t == next) {
                        cycles.push(path[start..].to_vec());
                    }
                }
                Some(next) => {
                    // Already exhausted by an earlier traversal: nothing new there
                    if visited.insert(next) {
                        on_path.insert(next);
                        path.push(next);
                        stack.push(neighbors(next));
                    }
                }
                None => {
                    stack.pop();
                    if let Some(done) = path.pop() {
                        on_path.remove(&done);
                    }
                }
            }
        }
    }

    cycles
}

/// Directed wait-for graph allowing several outgoing edges per thread
///
/// Built fresh for every tick by the heuristic detector, never persisted.
#[derive(Debug, Default, Clone)]
pub struct WaitForGraph {
    /// Maps a thread to all the threads it is presumed to wait for
    pub(crate) edges: FxHashMap<ThreadId, FxHashSet<ThreadId>>,
}

impl WaitForGraph {
    /// Create a new empty wait-for graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directed edge: `from` thread waits for `to` thread
    ///
    /// # Returns
    /// `true` if the edge was not present before
    pub fn add_edge(&mut self, from: ThreadId, to: ThreadId) -> bool {
        self.edges.entry(from).or_default().insert(to)
    }

    /// Threads `from` is presumed to wait for
    pub fn targets(&self, from: ThreadId) -> impl Iterator<Item = ThreadId> + '_ {
        self.edges.get(&from).into_iter().flatten().copied()
    }

    /// Number of edges in the graph
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(FxHashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Find every cycle in the graph
    pub fn find_cycles(&self) -> Vec<Vec<ThreadId>> {
        detect_cycles_multi(&self.edges)
    }
}

/// Union the threads of several cycles, keeping first-seen order
pub fn threads_in_cycles(cycles: &[Vec<ThreadId>]) -> Vec<ThreadId> {
    let mut seen = FxHashSet::default();
    cycles
        .iter()
        .flatten()
        .copied()
        .filter(|t| seen.insert(*t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(edges: &[(ThreadId, ThreadId)]) -> FxHashMap<ThreadId, ThreadId> {
        edges.iter().copied().collect()
    }

    /// Rotate a cycle so it starts at its smallest thread id
    fn normalize(cycle: &[ThreadId]) -> Vec<ThreadId> {
        let min_pos = cycle
            .iter()
            .enumerate()
            .min_by_key(|&(_, t)| *t)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut rotated = cycle[min_pos..].to_vec();
        rotated.extend_from_slice(&cycle[..min_pos]);
        rotated
    }

    fn normalized(cycles: Vec<Vec<ThreadId>>) -> Vec<Vec<ThreadId>> {
        let mut out: Vec<_> = cycles.iter().map(|c| normalize(c)).collect();
        out.sort();
        out
    }

    #[test]
    fn test_three_cycle_with_tail() {
        let graph = single(&[(1, 2), (2, 3), (3, 1), (4, 2)]);
        let cycles = detect_cycles(&graph);
        assert_eq!(normalized(cycles), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_empty_graph_has_no_cycles() {
        assert!(detect_cycles(&FxHashMap::default()).is_empty());
        assert!(WaitForGraph::new().find_cycles().is_empty());
    }

    #[test]
    fn test_acyclic_chain() {
        let graph = single(&[(1, 2), (2, 3), (3, 4)]);
        assert!(detect_cycles(&graph).is_empty());
    }

    #[test]
    fn test_two_independent_cycles() {
        let graph = single(&[(1, 2), (2, 1), (10, 11), (11, 12), (12, 10)]);
        let cycles = detect_cycles(&graph);
        assert_eq!(normalized(cycles), vec![vec![1, 2], vec![10, 11, 12]]);
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let graph = single(&[(7, 7)]);
        assert_eq!(detect_cycles(&graph), vec![vec![7]]);
    }

    #[test]
    fn test_cycle_order_follows_wait_chain() {
        let graph = single(&[(1, 2), (2, 3), (3, 1)]);
        let cycles = detect_cycles(&graph);
        assert_eq!(cycles.len(), 1);
        let cycle = &cycles[0];
        // Every thread waits for the next one, the last for the first
        for (i, &t) in cycle.iter().enumerate() {
            let next = cycle[(i + 1) % cycle.len()];
            assert_eq!(graph[&t], next);
        }
    }

    #[test]
    fn test_multi_edge_cycle_behind_dead_end() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 5); // dead end
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(normalized(graph.find_cycles()), vec![vec![1, 2]]);
    }

    #[test]
    fn test_multi_edge_acyclic_diamond() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(1, 2);
        graph.add_edge(1, 3);
        graph.add_edge(2, 4);
        graph.add_edge(3, 4);
        assert!(graph.find_cycles().is_empty());
    }

    #[test]
    fn test_duplicate_edge_is_ignored() {
        let mut graph = WaitForGraph::new();
        assert!(graph.add_edge(1, 2));
        assert!(!graph.add_edge(1, 2));
        assert_eq!(graph.targets(1).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_threads_in_cycles_dedups() {
        let cycles = vec![vec![1, 2], vec![2, 3, 1]];
        assert_eq!(threads_in_cycles(&cycles), vec![1, 2, 3]);
    }
}
