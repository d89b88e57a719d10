//! Search state of the graph-merge search.

use crate::buffer::Function;
use crate::dump::DumpScope;
use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::{MergePoint, TileGraph};
use crate::mcts::searcher::EnvironmentState;
use crate::schedule::{SolvedTree, TreeTiler};
use crate::solver::SearchBudget;
use crate::target::TargetOptions;
use crate::tree::{StructuralKey, TileTree, TreePrinter};
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
enum CachedSolve {
    Solved(Arc<SolvedTree>),
    Failed(String),
}

/// Solved trees keyed by tree shape, shared by every search state.
#[derive(Debug, Clone, Default)]
pub struct SolveCache {
    inner: Arc<RwLock<HashMap<StructuralKey, CachedSolve>>>,
}

impl SolveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct shapes seen.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Solve `tree` unless a tree of the same shape was solved before.
    ///
    /// Recoverable failures are remembered too; invariant violations are
    /// returned without being cached.
    pub fn solve(&self, tiler: &TreeTiler<'_>, tree: &TileTree) -> ScheduleResult<Arc<SolvedTree>> {
        let key = tree.structural_key(tree.root());
        let hit = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned();
        match hit {
            Some(CachedSolve::Solved(solved)) => return Ok(solved),
            Some(CachedSolve::Failed(reason)) => return Err(ScheduleError::Infeasible(reason)),
            None => {}
        }

        let entry = match tiler.solve(tree) {
            Ok(solved) => CachedSolve::Solved(Arc::new(solved)),
            Err(e) if e.is_recoverable() => CachedSolve::Failed(e.to_string()),
            Err(e) => return Err(e),
        };
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entry.clone());
        match entry {
            CachedSolve::Solved(solved) => Ok(solved),
            CachedSolve::Failed(reason) => Err(ScheduleError::Infeasible(reason)),
        }
    }
}

/// Every top-level tree of a graph, solved.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSolution {
    pub trees: Vec<Arc<SolvedTree>>,
    /// Sum of the tree objectives
    pub objective: i64,
}

impl GraphSolution {
    /// Whether every tree was solved to optimality.
    pub fn is_optimal(&self) -> bool {
        self.trees.iter().all(|t| t.is_optimal())
    }

    /// Outer-memory buffers of all trees as one function for the persistent
    /// buffer pass.
    pub fn to_function(&self, name: &str, module_kind: &str) -> Function {
        let trees: Vec<&SolvedTree> = self.trees.iter().map(|t| t.as_ref()).collect();
        Function::from_solved(name, module_kind, &trees)
    }

    /// Render every solved tree.
    pub fn render(&self) -> String {
        let mut printer = TreePrinter::new();
        for tree in &self.trees {
            printer.print_solved(tree);
        }
        printer.take_output()
    }
}

/// Solve every top-level tree of `graph` and sum their objectives.
pub fn solve_graph(
    graph: &TileGraph,
    target: &TargetOptions,
    budget: &SearchBudget,
    cache: &SolveCache,
) -> ScheduleResult<GraphSolution> {
    let tiler = TreeTiler::new(graph.dataflow(), target).with_budget(budget.clone());
    let mut trees = Vec::with_capacity(graph.top_trees().len());
    let mut objective = 0i64;
    for &top in graph.top_trees() {
        let solved = cache.solve(&tiler, &graph.extract_tree(top))?;
        objective = objective.saturating_add(solved.objective);
        trees.push(solved);
    }
    Ok(GraphSolution { trees, objective })
}

/// A graph reached by a sequence of merges.
pub struct MergeState {
    graph: TileGraph,
    target: Arc<TargetOptions>,
    budget: SearchBudget,
    cache: SolveCache,
    dump: DumpScope,
    path: String,
    merge_points: Vec<MergePoint>,
    untried: Vec<usize>,
    performed: usize,
    value: Option<f64>,
    solution: Option<GraphSolution>,
}

impl MergeState {
    pub fn new(
        graph: TileGraph,
        target: Arc<TargetOptions>,
        budget: SearchBudget,
        cache: SolveCache,
        dump: DumpScope,
    ) -> Self {
        Self::with_path(graph, target, budget, cache, dump, String::new())
    }

    fn with_path(
        graph: TileGraph,
        target: Arc<TargetOptions>,
        budget: SearchBudget,
        cache: SolveCache,
        dump: DumpScope,
        path: String,
    ) -> Self {
        let merge_points = graph.merge_points();
        let untried = (0..merge_points.len()).collect();
        Self {
            graph,
            target,
            budget,
            cache,
            dump,
            path,
            merge_points,
            untried,
            performed: 0,
            value: None,
            solution: None,
        }
    }

    pub fn graph(&self) -> &TileGraph {
        &self.graph
    }

    /// Dotted position in the search, e.g. `.1.2`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Rollout value, once simulated.
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Solved trees, once simulated successfully.
    pub fn solution(&self) -> Option<&GraphSolution> {
        self.solution.as_ref()
    }

    fn dump_rollout(&self, solution: &GraphSolution) {
        let scope = self.dump.nested(&format!("RollOut{}", self.path));
        if !scope.is_enabled() {
            return;
        }
        let result = scope
            .write_json("solution.json", solution)
            .and_then(|_| scope.write_text("trees.txt", &solution.render()));
        if let Err(e) = result {
            warn!("failed to dump rollout {}: {}", self.path, e);
        }
    }
}

impl EnvironmentState for MergeState {
    type Action = MergePoint;

    fn legal_actions(&self) -> usize {
        self.untried.len()
    }

    fn next_action(&mut self, index: usize) -> Option<MergePoint> {
        if index >= self.untried.len() {
            return None;
        }
        let k = self.untried.remove(index);
        self.performed += 1;
        Some(self.merge_points[k])
    }

    fn perform_action(&self, action: &MergePoint) -> ScheduleResult<Option<Self>> {
        match self.graph.merge(action) {
            Ok(graph) => Ok(Some(Self::with_path(
                graph,
                self.target.clone(),
                self.budget.clone(),
                self.cache.clone(),
                self.dump.clone(),
                format!("{}.{}", self.path, self.performed),
            ))),
            Err(e) if e.is_recoverable() => {
                debug!("merge {} rejected: {}", action, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn roll_out(&mut self) -> ScheduleResult<f64> {
        if let Some(value) = self.value {
            return Ok(value);
        }
        let value = match solve_graph(&self.graph, &self.target, &self.budget, &self.cache) {
            Ok(solution) => {
                debug!("rollout{} objective {}", self.path, solution.objective);
                self.dump_rollout(&solution);
                let value = solution.objective as f64;
                self.solution = Some(solution);
                value
            }
            Err(e) if e.is_recoverable() => {
                debug!("rollout{} infeasible: {}", self.path, e);
                f64::INFINITY
            }
            Err(e) => return Err(e),
        };
        self.value = Some(value);
        Ok(value)
    }
}
