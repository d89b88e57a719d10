//! Constraint model interface.
//!
//! The tile scheduler only talks to the solver through [`ConstraintModel`], so
//! the backend can be swapped without touching the tree passes. Every value in
//! the model (decision variable, constant or derived expression) is an
//! [`ExprId`] handle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Handle to a variable or expression inside a constraint model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExprId(pub u32);

impl ExprId {
    /// Arena index of the expression.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Which backend solves the tree models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverBackend {
    /// Z3 optimizing SMT solver
    Smt,
    /// In-crate finite-domain branch and bound
    BranchAndBound,
}

impl Default for SolverBackend {
    fn default() -> Self {
        if cfg!(feature = "z3") {
            SolverBackend::Smt
        } else {
            SolverBackend::BranchAndBound
        }
    }
}

impl fmt::Display for SolverBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverBackend::Smt => write!(f, "smt"),
            SolverBackend::BranchAndBound => write!(f, "branch-and-bound"),
        }
    }
}

/// Backend choice and search limits for [`ConstraintModel::minimize`].
///
/// The SMT backend only honors `time_limit`; `node_limit` bounds the
/// branch-and-bound search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchBudget {
    /// Maximum number of search nodes to explore
    pub node_limit: u64,
    /// Optional wall-clock limit
    pub time_limit: Option<Duration>,
    #[serde(default)]
    pub backend: SolverBackend,
}

impl Default for SearchBudget {
    fn default() -> Self {
        Self {
            node_limit: 200_000,
            time_limit: None,
            backend: SolverBackend::default(),
        }
    }
}

impl SearchBudget {
    /// Budget limited only by the number of search nodes.
    pub fn nodes(node_limit: u64) -> Self {
        Self {
            node_limit,
            ..Self::default()
        }
    }

    /// Add a wall-clock limit.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Solve with `backend`.
    pub fn with_backend(mut self, backend: SolverBackend) -> Self {
        self.backend = backend;
        self
    }
}

/// How a returned solution relates to the true optimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    /// The search space was exhausted; the solution is optimal
    Optimal,
    /// The budget ran out; the solution is the best one found so far
    BudgetExhausted,
}

impl SolveStatus {
    /// Whether the solution is provably optimal.
    pub fn is_optimal(&self) -> bool {
        matches!(self, SolveStatus::Optimal)
    }
}

/// An assignment found by the solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    /// Value of every expression in the model, indexed by [`ExprId`]
    pub values: Vec<i64>,
    /// Objective value
    pub objective: i64,
    /// Optimality status
    pub status: SolveStatus,
    /// Search nodes explored (zero for the SMT backend)
    pub nodes: u64,
}

impl Solution {
    /// Value of an expression under this assignment.
    pub fn value(&self, expr: ExprId) -> i64 {
        self.values.get(expr.index()).copied().unwrap_or(0)
    }

    /// Value of a boolean variable.
    pub fn is_set(&self, expr: ExprId) -> bool {
        self.value(expr) != 0
    }
}

/// Solver failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SolveError {
    /// The whole search space was explored without finding a solution
    #[error("model is infeasible ({nodes} nodes explored)")]
    Infeasible {
        /// Search nodes explored
        nodes: u64,
    },

    /// The budget ran out before the first solution
    #[error("no solution within budget ({nodes} nodes explored)")]
    NoSolutionWithinBudget {
        /// Search nodes explored
        nodes: u64,
    },

    /// The model was built incorrectly
    #[error("invalid model: {0}")]
    InvalidModel(String),
}

/// A generic integer constraint model.
///
/// Booleans are 0/1 integers. Products of variables are first-class
/// expressions; linearizing them is the backend's concern.
pub trait ConstraintModel {
    /// Integer variable whose value is one of `domain`.
    fn new_int(&mut self, name: &str, domain: &[i64]) -> Result<ExprId, SolveError>;

    /// Boolean (0/1) variable.
    fn new_bool(&mut self, name: &str) -> ExprId;

    /// Constant expression.
    fn constant(&mut self, value: i64) -> ExprId;

    /// `constant + sum(coeff * expr)`.
    fn linear(&mut self, terms: &[(i64, ExprId)], constant: i64) -> ExprId;

    /// Product of expressions.
    fn product(&mut self, factors: &[ExprId]) -> ExprId;

    /// Post `lhs == rhs`.
    fn add_equal(&mut self, lhs: ExprId, rhs: ExprId);

    /// Post `lhs <= rhs`.
    fn add_less_equal(&mut self, lhs: ExprId, rhs: ExprId);

    /// Post `sum(bools) == 1`.
    fn add_exactly_one(&mut self, bools: &[ExprId]) -> Result<(), SolveError>;

    /// Number of decision variables.
    fn num_vars(&self) -> usize;

    /// Number of posted constraints.
    fn num_constraints(&self) -> usize;

    /// Minimize `objective` within `budget`.
    fn minimize(&mut self, objective: ExprId, budget: &SearchBudget) -> Result<Solution, SolveError>;

    /// Sum of expressions.
    fn sum(&mut self, exprs: &[ExprId]) -> ExprId {
        match exprs {
            [] => self.constant(0),
            [single] => *single,
            _ => {
                let terms: Vec<(i64, ExprId)> = exprs.iter().map(|&e| (1, e)).collect();
                self.linear(&terms, 0)
            }
        }
    }

    /// Product of two expressions.
    fn mul(&mut self, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.product(&[lhs, rhs])
    }

    /// `expr * factor` for a constant factor.
    fn scale(&mut self, expr: ExprId, factor: i64) -> ExprId {
        if factor == 1 {
            expr
        } else {
            self.linear(&[(factor, expr)], 0)
        }
    }
}
