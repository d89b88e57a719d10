//! Z3-backed [`ConstraintModel`].
//!
//! The model is collected in the shared expression arena and translated to a
//! `z3::Optimize` instance when [`ConstraintModel::minimize`] is called.
//! Boolean variables become Z3 booleans; a product with boolean factors is an
//! `ite` over the remaining factors, so placement terms stay linear whenever
//! the rest of the product is.
//!
//! Z3 reports `unknown` when the time limit expires. If it has a model by
//! then, the model is returned as [`SolveStatus::BudgetExhausted`]; otherwise
//! the solve fails with [`SolveError::NoSolutionWithinBudget`].

use crate::solver::arena::{Constraint, ExprArena, Node};
use crate::solver::model::{
    ConstraintModel, ExprId, SearchBudget, Solution, SolveError, SolveStatus,
};
use log::{debug, trace};
use std::time::Duration;
use z3::ast::{self, Ast};
use z3::{Config, Context, Model, Optimize, SatResult};

/// Time limit applied when the budget has none.
const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(30);

/// Constraint model solved by Z3's optimizer.
#[derive(Debug, Default)]
pub struct SmtModel {
    arena: ExprArena,
}

impl SmtModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert the whole arena into `opt`, returning the integer term of every
    /// expression.
    fn translate<'ctx>(&self, ctx: &'ctx Context, opt: &Optimize<'ctx>) -> Vec<ast::Int<'ctx>> {
        let zero = ast::Int::from_i64(ctx, 0);
        let one = ast::Int::from_i64(ctx, 1);
        let mut bools: Vec<Option<ast::Bool<'ctx>>> = vec![None; self.arena.vars.len()];
        let mut terms: Vec<ast::Int<'ctx>> = Vec::with_capacity(self.arena.nodes.len());

        for node in &self.arena.nodes {
            let term = match node {
                Node::Const(c) => ast::Int::from_i64(ctx, *c),
                Node::Var(v) => {
                    let info = &self.arena.vars[*v];
                    let name = format!("{}#{}", info.name, v);
                    if info.is_bool {
                        let b = ast::Bool::new_const(ctx, name);
                        let term = b.ite(&one, &zero);
                        bools[*v] = Some(b);
                        term
                    } else {
                        let x = ast::Int::new_const(ctx, name);
                        let options: Vec<ast::Bool<'ctx>> = info
                            .domain
                            .iter()
                            .map(|&d| x._eq(&ast::Int::from_i64(ctx, d)))
                            .collect();
                        let refs: Vec<&ast::Bool<'ctx>> = options.iter().collect();
                        opt.assert(&ast::Bool::or(ctx, &refs));
                        x
                    }
                }
                Node::Linear { terms: parts, constant } => {
                    let mut sum: Vec<ast::Int<'ctx>> = Vec::with_capacity(parts.len() + 1);
                    if *constant != 0 {
                        sum.push(ast::Int::from_i64(ctx, *constant));
                    }
                    for &(coeff, e) in parts {
                        let t = &terms[e.index()];
                        if coeff == 1 {
                            sum.push(t.clone());
                        } else {
                            sum.push(ast::Int::mul(ctx, &[&ast::Int::from_i64(ctx, coeff), t]));
                        }
                    }
                    let refs: Vec<&ast::Int<'ctx>> = sum.iter().collect();
                    ast::Int::add(ctx, &refs)
                }
                Node::Product(factors) => {
                    let mut guards: Vec<&ast::Bool<'ctx>> = Vec::new();
                    let mut rest: Vec<&ast::Int<'ctx>> = Vec::new();
                    for f in factors {
                        match self.arena.var_of(*f).and_then(|v| bools[v].as_ref()) {
                            Some(b) => guards.push(b),
                            None => rest.push(&terms[f.index()]),
                        }
                    }
                    let prod = match rest.as_slice() {
                        [] => one.clone(),
                        [single] => (*single).clone(),
                        _ => ast::Int::mul(ctx, &rest),
                    };
                    if guards.is_empty() {
                        prod
                    } else {
                        ast::Bool::and(ctx, &guards).ite(&prod, &zero)
                    }
                }
            };
            terms.push(term);
        }

        for c in &self.arena.constraints {
            match *c {
                Constraint::Equal(a, b) => opt.assert(&terms[a.index()]._eq(&terms[b.index()])),
                Constraint::LessEqual(a, b) => opt.assert(&terms[a.index()].le(&terms[b.index()])),
            }
        }

        for members in &self.arena.groups {
            let group: Vec<&ast::Bool<'ctx>> = members.iter().filter_map(|&v| bools[v].as_ref()).collect();
            opt.assert(&ast::Bool::or(ctx, &group));
            for (i, a) in group.iter().enumerate() {
                for b in &group[i + 1..] {
                    opt.assert(&ast::Bool::and(ctx, &[*a, *b]).not());
                }
            }
        }
        terms
    }

    fn read_values<'ctx>(model: &Model<'ctx>, terms: &[ast::Int<'ctx>]) -> Result<Vec<i64>, SolveError> {
        terms
            .iter()
            .enumerate()
            .map(|(i, t)| {
                model
                    .eval(t, true)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| SolveError::InvalidModel(format!("no integer value for e{}", i)))
            })
            .collect()
    }
}

impl ConstraintModel for SmtModel {
    fn new_int(&mut self, name: &str, domain: &[i64]) -> Result<ExprId, SolveError> {
        self.arena.new_int(name, domain)
    }

    fn new_bool(&mut self, name: &str) -> ExprId {
        self.arena.new_bool(name)
    }

    fn constant(&mut self, value: i64) -> ExprId {
        self.arena.constant(value)
    }

    fn linear(&mut self, terms: &[(i64, ExprId)], constant: i64) -> ExprId {
        self.arena.linear(terms, constant)
    }

    fn product(&mut self, factors: &[ExprId]) -> ExprId {
        self.arena.product(factors)
    }

    fn add_equal(&mut self, lhs: ExprId, rhs: ExprId) {
        self.arena.add_equal(lhs, rhs);
    }

    fn add_less_equal(&mut self, lhs: ExprId, rhs: ExprId) {
        self.arena.add_less_equal(lhs, rhs);
    }

    fn add_exactly_one(&mut self, bools: &[ExprId]) -> Result<(), SolveError> {
        self.arena.add_exactly_one(bools)
    }

    fn num_vars(&self) -> usize {
        self.arena.num_vars()
    }

    fn num_constraints(&self) -> usize {
        self.arena.num_constraints()
    }

    fn minimize(&mut self, objective: ExprId, budget: &SearchBudget) -> Result<Solution, SolveError> {
        self.arena.check_objective(objective)?;
        let limit = budget.time_limit.unwrap_or(DEFAULT_TIME_LIMIT);
        let mut cfg = Config::new();
        cfg.set_model_generation(true);
        cfg.set_timeout_msec(limit.as_millis().min(u64::MAX as u128) as u64);
        let ctx = Context::new(&cfg);
        let opt = Optimize::new(&ctx);

        let terms = self.translate(&ctx, &opt);
        opt.minimize(&terms[objective.index()]);
        trace!(
            "z3 model: {} vars, {} constraints, limit {:?}",
            self.arena.num_vars(),
            self.arena.num_constraints(),
            limit
        );

        let (model, status) = match opt.check(&[]) {
            SatResult::Sat => (opt.get_model(), SolveStatus::Optimal),
            SatResult::Unknown => {
                debug!("z3 returned unknown within {:?}", limit);
                (opt.get_model(), SolveStatus::BudgetExhausted)
            }
            SatResult::Unsat => return Err(SolveError::Infeasible { nodes: 0 }),
        };
        let Some(model) = model else {
            return Err(SolveError::NoSolutionWithinBudget { nodes: 0 });
        };
        let values = Self::read_values(&model, &terms)?;
        // an interrupted optimizer may hand back a partial assignment
        if status == SolveStatus::BudgetExhausted && !self.arena.satisfied_by(&values) {
            return Err(SolveError::NoSolutionWithinBudget { nodes: 0 });
        }
        Ok(Solution {
            objective: values[objective.index()],
            values,
            status,
            nodes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::search::{divisors, SearchModel};

    #[test]
    fn test_minimize_product_constraint() {
        // x * y == 12, minimize x + 2y
        let mut model = SmtModel::new();
        let x = model.new_int("x", &divisors(12)).unwrap();
        let y = model.new_int("y", &divisors(12)).unwrap();
        let prod = model.mul(x, y);
        let twelve = model.constant(12);
        model.add_equal(prod, twelve);
        let obj = model.linear(&[(1, x), (2, y)], 0);
        let solution = model.minimize(obj, &SearchBudget::default()).unwrap();
        assert_eq!(solution.objective, 10);
        assert_eq!(solution.value(x), 6);
        assert_eq!(solution.value(y), 2);
        assert!(solution.status.is_optimal());
    }

    #[test]
    fn test_exactly_one_with_guarded_products() {
        // placing at a costs 4*x, at b costs 20; x in {2, 8}, x >= 6
        let mut model = SmtModel::new();
        let x = model.new_int("x", &[2, 8]).unwrap();
        let six = model.constant(6);
        model.add_less_equal(six, x);
        let a = model.new_bool("a");
        let b = model.new_bool("b");
        model.add_exactly_one(&[a, b]).unwrap();
        let four_x = model.scale(x, 4);
        let ta = model.mul(a, four_x);
        let twenty = model.constant(20);
        let tb = model.mul(b, twenty);
        let obj = model.sum(&[ta, tb]);
        let solution = model.minimize(obj, &SearchBudget::default()).unwrap();
        assert_eq!(solution.objective, 20);
        assert!(solution.is_set(b));
        assert!(!solution.is_set(a));
        assert_eq!(solution.value(ta), 0);
    }

    #[test]
    fn test_unsat_is_infeasible() {
        let mut model = SmtModel::new();
        let x = model.new_int("x", &[1, 2, 3]).unwrap();
        let ten = model.constant(10);
        model.add_equal(x, ten);
        let err = model.minimize(x, &SearchBudget::default()).unwrap_err();
        assert!(matches!(err, SolveError::Infeasible { .. }));
    }

    #[test]
    fn test_agrees_with_branch_and_bound() {
        fn build(model: &mut dyn ConstraintModel) -> ExprId {
            // two tile sizes whose product covers 64, with a 3-way placement
            let t0 = model.new_int("t0", &divisors(64)).unwrap();
            let t1 = model.new_int("t1", &divisors(64)).unwrap();
            let covered = model.mul(t0, t1);
            let full = model.constant(64);
            model.add_equal(covered, full);
            let places: Vec<ExprId> = (0..3).map(|i| model.new_bool(&format!("p{}", i))).collect();
            model.add_exactly_one(&places).unwrap();
            let cap = model.constant(16);
            let l1 = model.mul(places[0], t0);
            model.add_less_equal(l1, cap);
            let costs = [1, 3, 7];
            let mut terms = Vec::new();
            for (p, c) in places.iter().zip(costs) {
                let moved = model.mul(*p, t0);
                terms.push((c, moved));
            }
            terms.push((1, t1));
            model.linear(&terms, 0)
        }
        let budget = SearchBudget::default();
        let mut smt = SmtModel::new();
        let obj = build(&mut smt);
        let mut bnb = SearchModel::new();
        let obj_bnb = build(&mut bnb);
        let a = smt.minimize(obj, &budget).unwrap();
        let b = bnb.minimize(obj_bnb, &budget).unwrap();
        assert_eq!(a.objective, b.objective);
        assert_eq!(smt.num_vars(), bnb.num_vars());
        assert_eq!(smt.num_constraints(), bnb.num_constraints());
    }
}
