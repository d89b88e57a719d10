//! Graph-merge search.
//!
//! Starting from one tile tree per op, the search explores sequences of
//! merge points with Monte Carlo tree search. Every state is evaluated by
//! solving all of its top-level trees; trees of equal shape are solved once
//! and shared through a [`SolveCache`].

pub mod searcher;
pub mod state;

pub use searcher::{EnvironmentState, MctsSearcher, NodeDump, SearchNode};
pub use state::{solve_graph, GraphSolution, MergeState, SolveCache};

use crate::config::SchedulerConfig;
use crate::dump::DumpScope;
use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::{DataflowGraph, MergePoint, TileGraph};
use crate::target::TargetOptions;
use log::{info, warn};
use std::sync::Arc;

/// Best tile graph found by the search.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub graph: TileGraph,
    pub solution: GraphSolution,
    /// Merges applied to reach `graph`
    pub merges: Vec<MergePoint>,
    /// Objective of the unmerged graph, if it was feasible
    pub baseline: Option<i64>,
    pub rollouts: usize,
    /// Distinct tree shapes solved
    pub solved_shapes: usize,
}

/// Run the merge search over `dataflow`.
pub fn run_search(
    dataflow: Arc<DataflowGraph>,
    target: &TargetOptions,
    config: &SchedulerConfig,
) -> ScheduleResult<ScheduleOutcome> {
    target.validate_for(&dataflow)?;
    let graph = TileGraph::new(dataflow, target.top_level())?;
    let cache = SolveCache::new();
    let dump = DumpScope::new(config.dump_dir.as_deref());
    let root = MergeState::new(
        graph,
        Arc::new(target.clone()),
        config.solver_budget.clone(),
        cache.clone(),
        dump.clone(),
    );

    let mut searcher =
        MctsSearcher::new(root, config.seed).with_exploration(config.exploration, config.temperature);
    searcher.search(config.search_iterations.max(1))?;
    if let Err(e) = dump.write_json("search_tree.json", &searcher.dump()) {
        warn!("failed to dump search tree: {}", e);
    }

    let best = searcher.best_node().ok_or(ScheduleError::NoFeasibleTree {
        rollouts: searcher.rollouts(),
    })?;
    let state = &searcher.node(best).state;
    let solution = state.solution().cloned().ok_or(ScheduleError::NoFeasibleTree {
        rollouts: searcher.rollouts(),
    })?;
    let baseline = searcher
        .root()
        .state
        .solution()
        .map(|s| s.objective);
    let merges = searcher.path(best);
    info!(
        "best objective {} after {} merges ({} rollouts, {} shapes solved, baseline {:?})",
        solution.objective,
        merges.len(),
        searcher.rollouts(),
        cache.len(),
        baseline
    );

    Ok(ScheduleOutcome {
        graph: state.graph().clone(),
        solution,
        merges,
        baseline,
        rollouts: searcher.rollouts(),
        solved_shapes: cache.len(),
    })
}
