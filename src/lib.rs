//! # TileOpt - Tile Scheduling for Neural-Network Kernels
//!
//! Chooses loop tilings, fusion and buffer placement for a dataflow graph of
//! tensor operations over a multi-level memory hierarchy:
//! - Affine maps relating nested tile domains
//! - Tile trees and the tile graph of independent top-level trees
//! - Constraint-based tile sizing and buffer placement per tree
//! - Monte Carlo search over merge points (which trees to fuse)
//! - Offset assignment for outer-memory buffers
//!
//! ## Architecture
//!
//! ```text
//! DataflowGraph → TileGraph → MCTS (merge) → TreeTiler (solve) → SolvedTree → DdrBufferScheduler
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tileopt::prelude::*;
//!
//! let mut graph = DataflowGraph::new("chain");
//! let a = graph.add_elementwise("relu", &[64, 64], &[None]);
//! graph.add_elementwise("exp", &[64, 64], &[Some(a)]);
//!
//! let outcome = tileopt::schedule_graph(graph, &TargetOptions::default(), &SchedulerConfig::quick())?;
//! println!("{}", outcome.solution.render());
//! ```

#![warn(clippy::all)]

pub mod affine;
pub mod buffer;
pub mod config;
pub mod dump;
pub mod error;
pub mod graph;
pub mod mcts;
pub mod schedule;
pub mod solver;
pub mod target;
pub mod tree;

// Re-export commonly used types
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::affine::{AffineExpr, AffineMap, AffineRange, LoopMask};
    pub use crate::buffer::{DdrBufferScheduler, Function, LifetimeScheduler, LiveBuffer, Module};
    pub use crate::config::SchedulerConfig;
    pub use crate::error::{ScheduleError, ScheduleResult};
    pub use crate::graph::{DataflowGraph, KernelKind, MergePoint, OpId, OpNode, TileGraph};
    pub use crate::mcts::{GraphSolution, ScheduleOutcome, SolveCache};
    pub use crate::schedule::{BufferId, Lifetime, SolvedTree, TreeTiler};
    pub use crate::solver::{new_model, ConstraintModel, SearchBudget, SearchModel, SolveStatus, SolverBackend};
    pub use crate::target::{KernelOverride, MemoryLevel, TargetOptions};
    pub use crate::tree::{NodeKind, TileTree, TreePrinter};
}

use std::sync::Arc;

/// Search merges for `graph` and return the best tiled graph found.
pub fn schedule_graph(
    graph: graph::DataflowGraph,
    target: &target::TargetOptions,
    config: &config::SchedulerConfig,
) -> error::ScheduleResult<mcts::ScheduleOutcome> {
    mcts::run_search(Arc::new(graph), target, config)
}

/// Solve the unmerged graph: every op in its own tree.
pub fn solve_unmerged(
    graph: graph::DataflowGraph,
    target: &target::TargetOptions,
    config: &config::SchedulerConfig,
) -> error::ScheduleResult<mcts::GraphSolution> {
    target.validate_for(&graph)?;
    let tiles = graph::TileGraph::new(Arc::new(graph), target.top_level())?;
    mcts::solve_graph(&tiles, target, &config.solver_budget, &mcts::SolveCache::new())
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
