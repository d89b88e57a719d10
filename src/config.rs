//! Scheduler configuration

use crate::solver::{SearchBudget, SolverBackend};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the graph-merge search and tree solves
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of search iterations (one rollout each)
    pub search_iterations: usize,

    /// Budget for every tree solve
    pub solver_budget: SearchBudget,

    /// Where to write diagnostic dumps, if anywhere
    pub dump_dir: Option<PathBuf>,

    /// Random seed for selection and expansion
    pub seed: u64,

    /// UCB exploration constant
    pub exploration: f64,

    /// Softmax temperature applied to UCB scores
    pub temperature: f64,

    /// Byte alignment of outer-memory offsets
    pub alignment: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            search_iterations: 32,
            solver_budget: SearchBudget::default(),
            dump_dir: None,
            seed: 1010,
            exploration: std::f64::consts::SQRT_2,
            temperature: 0.5,
            alignment: 64,
        }
    }
}

impl SchedulerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of search iterations
    pub fn search_iterations(mut self, iterations: usize) -> Self {
        self.search_iterations = iterations;
        self
    }

    /// Set the per-tree solver budget
    pub fn solver_budget(mut self, budget: SearchBudget) -> Self {
        self.solver_budget = budget;
        self
    }

    /// Set the solver backend for every tree solve
    pub fn solver_backend(mut self, backend: SolverBackend) -> Self {
        self.solver_budget.backend = backend;
        self
    }

    /// Write dumps under `dir`
    pub fn dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    /// Set the random seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the UCB exploration constant
    pub fn exploration(mut self, c: f64) -> Self {
        self.exploration = c;
        self
    }

    /// Set the offset alignment
    pub fn alignment(mut self, bytes: u64) -> Self {
        self.alignment = bytes;
        self
    }

    /// Quick preset (few iterations, small solver budget)
    pub fn quick() -> Self {
        Self {
            search_iterations: 8,
            solver_budget: SearchBudget::nodes(20_000).with_time_limit(Duration::from_secs(10)),
            ..Default::default()
        }
    }

    /// Thorough preset (many iterations, large solver budget)
    pub fn thorough() -> Self {
        Self {
            search_iterations: 256,
            solver_budget: SearchBudget::nodes(2_000_000).with_time_limit(Duration::from_secs(60)),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .search_iterations(4)
            .seed(7)
            .dump_dir("/tmp/dumps");
        assert_eq!(config.search_iterations, 4);
        assert_eq!(config.seed, 7);
        assert_eq!(config.dump_dir, Some(PathBuf::from("/tmp/dumps")));
        assert_eq!(config.temperature, 0.5);

        let config = SchedulerConfig::quick().solver_backend(SolverBackend::BranchAndBound);
        assert_eq!(config.solver_budget.backend, SolverBackend::BranchAndBound);
        assert_eq!(config.solver_budget.node_limit, 20_000);
    }

    #[test]
    fn test_presets() {
        assert!(SchedulerConfig::quick().solver_budget.node_limit < SchedulerConfig::thorough().solver_budget.node_limit);
        assert!(SchedulerConfig::thorough().solver_budget.time_limit.is_some());
    }
}
