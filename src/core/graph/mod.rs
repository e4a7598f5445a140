//! Graph module for deadlock detection
//!
//! The wait-for graph tracks which threads are waiting for which other threads
//! and finds the cycles among them. Both the explicit-lock detector (one edge
//! per thread) and the monitor heuristic (many edges per thread) use it.

pub(crate) mod wait_for_graph;

pub use wait_for_graph::{WaitForGraph, detect_cycles, detect_cycles_multi, threads_in_cycles};
