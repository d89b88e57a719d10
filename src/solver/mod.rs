//! Constraint solver binding.
//!
//! [`ConstraintModel`] is the small interface the tree passes build their
//! decision variables and cost expressions against. Two backends implement
//! it over a shared expression arena:
//!
//! - [`SmtModel`] hands the model to Z3's optimizer (default, `z3` feature)
//! - [`SearchModel`] is an in-crate finite-domain branch and bound, used when
//!   the crate is built without Z3 or when a budget asks for it explicitly

mod arena;
pub mod model;
pub mod search;
#[cfg(feature = "z3")]
pub mod smt;

pub use model::{
    ConstraintModel, ExprId, SearchBudget, Solution, SolveError, SolveStatus, SolverBackend,
};
pub use search::{divisors, SearchModel};
#[cfg(feature = "z3")]
pub use smt::SmtModel;

/// Empty model for `backend`.
///
/// Without the `z3` feature the SMT backend falls back to branch and bound.
pub fn new_model(backend: SolverBackend) -> Box<dyn ConstraintModel> {
    match backend {
        #[cfg(feature = "z3")]
        SolverBackend::Smt => Box::new(SmtModel::new()),
        #[cfg(not(feature = "z3"))]
        SolverBackend::Smt => {
            log::warn!("built without z3, using branch and bound");
            Box::new(SearchModel::new())
        }
        SolverBackend::BranchAndBound => Box::new(SearchModel::new()),
    }
}
