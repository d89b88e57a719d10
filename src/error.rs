//! Error types for the tile scheduler.
//!
//! Errors are organized by how callers must react to them: infeasible tree
//! shapes are recoverable inside the merge search, invariant violations abort
//! the compile.

use crate::graph::OpId;
use crate::schedule::BufferId;
use crate::solver::SolveError;
use thiserror::Error;

/// Top-level error type for the scheduler.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// The constraint model for a tree shape admits no solution
    #[error("Infeasible tile tree: {0}")]
    Infeasible(String),

    /// The solver budget ran out before any solution was found
    #[error("No solution found within the search budget ({nodes} nodes explored)")]
    NoSolutionWithinBudget {
        /// Search nodes explored before giving up
        nodes: u64,
    },

    /// A buffer expected to exist in a child memo was missing
    #[error("Unresolved buffer dependency: {0}")]
    UnresolvedBuffer(BufferId),

    /// A tile dimension could not be matched to any child dimension
    #[error("Unresolved dimension d{dim} of tile node {node}")]
    UnresolvedDimension {
        /// Arena index of the tile node
        node: usize,
        /// Dimension index
        dim: usize,
    },

    /// A merge point does not preserve tree well-formedness
    #[error("Illegal merge of op{producer} into op{consumer} at level {level}: {reason}")]
    IllegalMerge {
        /// Producer op
        producer: OpId,
        /// Consumer op
        consumer: OpId,
        /// Tiling level
        level: usize,
        /// Why the merge was rejected
        reason: String,
    },

    /// The input dataflow graph is malformed
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Affine map arities do not line up
    #[error("Affine mismatch: {0}")]
    AffineMismatch(String),

    /// Every tree shape the search tried was infeasible
    #[error("No feasible tile tree found after {rollouts} rollouts")]
    NoFeasibleTree {
        /// Rollouts attempted
        rollouts: usize,
    },

    /// Constraint model misuse
    #[error("Invalid constraint model: {0}")]
    InvalidModel(String),

    /// I/O error while writing diagnostics
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error while writing diagnostics
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ScheduleError {
    /// Whether the error only rules out the current tree shape.
    ///
    /// Invariant violations are not recoverable and must abort the compile.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScheduleError::Infeasible(_)
                | ScheduleError::NoSolutionWithinBudget { .. }
                | ScheduleError::IllegalMerge { .. }
        )
    }
}

impl From<SolveError> for ScheduleError {
    fn from(err: SolveError) -> Self {
        match err {
            SolveError::Infeasible { nodes } => {
                ScheduleError::Infeasible(format!("search exhausted after {} nodes", nodes))
            }
            SolveError::NoSolutionWithinBudget { nodes } => {
                ScheduleError::NoSolutionWithinBudget { nodes }
            }
            SolveError::InvalidModel(msg) => ScheduleError::InvalidModel(msg),
        }
    }
}

/// Result type using ScheduleError.
pub type ScheduleResult<T> = Result<T, ScheduleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScheduleError::IllegalMerge {
            producer: OpId(0),
            consumer: OpId(1),
            level: 2,
            reason: "not adjacent".to_string(),
        };
        let s = format!("{}", err);
        assert!(s.contains("op0"));
        assert!(s.contains("not adjacent"));
    }

    #[test]
    fn test_recoverable() {
        assert!(ScheduleError::Infeasible("x".into()).is_recoverable());
        assert!(!ScheduleError::UnresolvedBuffer(BufferId::new(OpId(3), 1)).is_recoverable());
        let from: ScheduleError = SolveError::Infeasible { nodes: 7 }.into();
        assert!(matches!(from, ScheduleError::Infeasible(_)));
    }
}
