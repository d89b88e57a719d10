//! Depth-first branch-and-bound backend for [`ConstraintModel`].
//!
//! Variables have explicit finite domains. At every search node the bounds of
//! all expressions are recomputed by interval arithmetic over the arena (an
//! expression only refers to expressions created before it), constraints are
//! checked against those intervals and the objective's lower bound is compared
//! with the incumbent.
//!
//! Exactly-one groups are branched as a single choice ("which member is 1"),
//! and objective terms of the form `coeff * member * rest` are bounded by the
//! cheapest still-possible member of their group.

use crate::solver::arena::{Constraint, ExprArena, Node};
use crate::solver::model::{
    ConstraintModel, ExprId, SearchBudget, Solution, SolveError, SolveStatus,
};
use log::trace;
use std::time::Instant;

type Interval = (i64, i64);

#[derive(Debug, Clone, Copy)]
enum Decision {
    Var(usize),
    Group(usize),
}

/// `coeff * product(rest)` that only counts when `var` is 1.
#[derive(Debug, Clone)]
struct GuardedTerm {
    var: usize,
    coeff: i64,
    rest: Vec<ExprId>,
}

#[derive(Debug, Default)]
struct ObjectiveSplit {
    constant: i64,
    free: Vec<(i64, ExprId)>,
    /// guarded terms per exactly-one group
    guarded: Vec<Vec<GuardedTerm>>,
}

/// In-crate finite-domain branch-and-bound solver.
#[derive(Debug, Default)]
pub struct SearchModel {
    arena: ExprArena,
}

struct SearchState<'a> {
    budget: &'a SearchBudget,
    started: Instant,
    nodes: u64,
    exhausted: bool,
    best: Option<(i64, Vec<i64>)>,
    assignment: Vec<Option<i64>>,
}

impl SearchState<'_> {
    fn out_of_budget(&mut self) -> bool {
        if self.exhausted {
            return true;
        }
        if self.nodes >= self.budget.node_limit {
            self.exhausted = true;
        } else if let Some(limit) = self.budget.time_limit {
            // checking the clock on every node is measurable; sample it
            if self.nodes % 256 == 0 && self.started.elapsed() >= limit {
                self.exhausted = true;
            }
        }
        self.exhausted
    }
}

fn clamp(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

fn mul_interval(a: Interval, b: Interval) -> Interval {
    let candidates = [
        a.0 as i128 * b.0 as i128,
        a.0 as i128 * b.1 as i128,
        a.1 as i128 * b.0 as i128,
        a.1 as i128 * b.1 as i128,
    ];
    let lo = candidates.iter().copied().min().unwrap_or(0);
    let hi = candidates.iter().copied().max().unwrap_or(0);
    (clamp(lo), clamp(hi))
}

impl SearchModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interval of every expression under a partial assignment.
    fn bounds(&self, assignment: &[Option<i64>]) -> Vec<Interval> {
        let mut out: Vec<Interval> = Vec::with_capacity(self.arena.nodes.len());
        for node in &self.arena.nodes {
            let interval = match node {
                Node::Const(c) => (*c, *c),
                Node::Var(v) => match assignment[*v] {
                    Some(x) => (x, x),
                    None => {
                        let d = &self.arena.vars[*v].domain;
                        (d[0], d[d.len() - 1])
                    }
                },
                Node::Linear { terms, constant } => {
                    let mut lo = *constant as i128;
                    let mut hi = *constant as i128;
                    for &(c, e) in terms {
                        let (elo, ehi) = out[e.index()];
                        let (a, b) = (c as i128 * elo as i128, c as i128 * ehi as i128);
                        lo += a.min(b);
                        hi += a.max(b);
                    }
                    (clamp(lo), clamp(hi))
                }
                Node::Product(factors) => factors
                    .iter()
                    .fold((1, 1), |acc, f| mul_interval(acc, out[f.index()])),
            };
            out.push(interval);
        }
        out
    }

    fn consistent(&self, bounds: &[Interval]) -> bool {
        self.arena.constraints.iter().all(|c| match *c {
            Constraint::Equal(a, b) => {
                let (alo, ahi) = bounds[a.index()];
                let (blo, bhi) = bounds[b.index()];
                alo <= bhi && blo <= ahi
            }
            Constraint::LessEqual(a, b) => bounds[a.index()].0 <= bounds[b.index()].1,
        })
    }

    fn split_objective(&self, objective: ExprId) -> ObjectiveSplit {
        let mut split = ObjectiveSplit {
            constant: 0,
            free: Vec::new(),
            guarded: vec![Vec::new(); self.arena.groups.len()],
        };
        let terms = match &self.arena.nodes[objective.index()] {
            Node::Linear { terms, constant } => {
                split.constant = *constant;
                terms.clone()
            }
            _ => vec![(1, objective)],
        };
        for (coeff, term) in terms {
            let guard = match &self.arena.nodes[term.index()] {
                Node::Product(factors) if coeff >= 0 => factors.iter().enumerate().find_map(|(i, f)| {
                    let v = self.arena.var_of(*f)?;
                    self.arena.vars[v].group.map(|g| (i, v, g))
                }),
                Node::Var(v) if coeff >= 0 => self.arena.vars[*v].group.map(|g| (usize::MAX, *v, g)),
                _ => None,
            };
            match (guard, &self.arena.nodes[term.index()]) {
                (Some((i, var, g)), Node::Product(factors)) => {
                    let rest = factors
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, f)| *f)
                        .collect();
                    split.guarded[g].push(GuardedTerm { var, coeff, rest });
                }
                (Some((_, var, g)), _) => {
                    split.guarded[g].push(GuardedTerm {
                        var,
                        coeff,
                        rest: Vec::new(),
                    });
                }
                (None, _) => split.free.push((coeff, term)),
            }
        }
        split
    }

    fn guarded_cost(term: &GuardedTerm, bounds: &[Interval]) -> i128 {
        let rest = term
            .rest
            .iter()
            .fold((1, 1), |acc, f| mul_interval(acc, bounds[f.index()]));
        term.coeff as i128 * rest.0 as i128
    }

    /// Lower bound of one member's guarded cost.
    fn member_cost(split: &ObjectiveSplit, group: usize, var: usize, bounds: &[Interval]) -> i128 {
        split.guarded[group]
            .iter()
            .filter(|t| t.var == var)
            .map(|t| Self::guarded_cost(t, bounds))
            .sum()
    }

    fn objective_bound(&self, split: &ObjectiveSplit, bounds: &[Interval], assignment: &[Option<i64>]) -> i128 {
        let free: i128 = split
            .free
            .iter()
            .map(|&(c, e)| {
                let (lo, hi) = bounds[e.index()];
                (c as i128 * lo as i128).min(c as i128 * hi as i128)
            })
            .sum();
        let mut total = split.constant as i128 + free;
        for (g, members) in self.arena.groups.iter().enumerate() {
            if split.guarded[g].is_empty() {
                continue;
            }
            let chosen = members.iter().find(|&&v| assignment[v] == Some(1));
            let cost = match chosen {
                Some(&v) => Self::member_cost(split, g, v, bounds),
                None => members
                    .iter()
                    .filter(|&&v| assignment[v] != Some(0))
                    .map(|&v| Self::member_cost(split, g, v, bounds))
                    .min()
                    .unwrap_or(0),
            };
            total += cost;
        }
        total
    }

    fn decisions(&self) -> Vec<Decision> {
        let mut ints = Vec::new();
        let mut rest = Vec::new();
        let mut seen_groups = vec![false; self.arena.groups.len()];
        for (v, info) in self.arena.vars.iter().enumerate() {
            match info.group {
                Some(g) => {
                    if !seen_groups[g] {
                        seen_groups[g] = true;
                        rest.push(Decision::Group(g));
                    }
                }
                None if info.is_bool => rest.push(Decision::Var(v)),
                None => ints.push(Decision::Var(v)),
            }
        }
        ints.extend(rest);
        ints
    }

    fn search(
        &self,
        depth: usize,
        decisions: &[Decision],
        objective: ExprId,
        split: &ObjectiveSplit,
        state: &mut SearchState<'_>,
    ) {
        if state.out_of_budget() {
            return;
        }
        state.nodes += 1;

        let bounds = self.bounds(&state.assignment);
        if !self.consistent(&bounds) {
            return;
        }
        let bound = self.objective_bound(split, &bounds, &state.assignment);
        if let Some((best, _)) = &state.best {
            if bound >= *best as i128 {
                return;
            }
        }

        let Some(decision) = decisions.get(depth) else {
            let value = bounds[objective.index()].0;
            let values = bounds.iter().map(|b| b.0).collect();
            trace!("solution {} after {} nodes", value, state.nodes);
            state.best = Some((value, values));
            return;
        };

        match *decision {
            Decision::Var(v) => {
                // integers are tried largest first so outer tiles start coarse
                let info = &self.arena.vars[v];
                let values: Vec<i64> = if info.is_bool {
                    info.domain.clone()
                } else {
                    info.domain.iter().rev().copied().collect()
                };
                for value in values {
                    state.assignment[v] = Some(value);
                    self.search(depth + 1, decisions, objective, split, state);
                    if state.exhausted {
                        break;
                    }
                }
                state.assignment[v] = None;
            }
            Decision::Group(g) => {
                let members = &self.arena.groups[g];
                let mut order: Vec<(i128, usize)> = members
                    .iter()
                    .map(|&v| (Self::member_cost(split, g, v, &bounds), v))
                    .collect();
                order.sort();
                for &(_, chosen) in &order {
                    for &v in members {
                        state.assignment[v] = Some(i64::from(v == chosen));
                    }
                    self.search(depth + 1, decisions, objective, split, state);
                    if state.exhausted {
                        break;
                    }
                }
                for &v in members {
                    state.assignment[v] = None;
                }
            }
        }
    }
}

impl ConstraintModel for SearchModel {
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
        let decisions = self.decisions();
        let split = self.split_objective(objective);
        let mut state = SearchState {
            budget,
            started: Instant::now(),
            nodes: 0,
            exhausted: false,
            best: None,
            assignment: vec![None; self.arena.vars.len()],
        };
        self.search(0, &decisions, objective, &split, &mut state);
        trace!(
            "search finished: {} vars, {} constraints, {} nodes, exhausted = {}",
            self.arena.vars.len(),
            self.arena.constraints.len(),
            state.nodes,
            state.exhausted
        );

        match (state.best, state.exhausted) {
            (Some((objective, values)), exhausted) => Ok(Solution {
                values,
                objective,
                status: if exhausted {
                    SolveStatus::BudgetExhausted
                } else {
                    SolveStatus::Optimal
                },
                nodes: state.nodes,
            }),
            (None, true) => Err(SolveError::NoSolutionWithinBudget { nodes: state.nodes }),
            (None, false) => Err(SolveError::Infeasible { nodes: state.nodes }),
        }
    }
}

/// Divisors of `n` in ascending order.
pub fn divisors(n: i64) -> Vec<i64> {
    use num_integer::Roots;
    if n <= 0 {
        return Vec::new();
    }
    let mut small = Vec::new();
    let mut large = Vec::new();
    for d in 1..=n.sqrt() {
        if n % d == 0 {
            small.push(d);
            if d != n / d {
                large.push(n / d);
            }
        }
    }
    small.extend(large.into_iter().rev());
    small
}
