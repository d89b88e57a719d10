//! Expression arena shared by the solver backends.
//!
//! The tree passes build their model into an [`ExprArena`]; each backend
//! decides at [`ConstraintModel::minimize`](crate::solver::ConstraintModel::minimize)
//! time how to search it. An expression only refers to expressions created
//! before it, so a single forward pass over `nodes` evaluates or translates
//! the whole model.

use crate::solver::model::{ExprId, SolveError};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Const(i64),
    Var(usize),
    Linear { terms: Vec<(i64, ExprId)>, constant: i64 },
    Product(Vec<ExprId>),
}

#[derive(Debug, Clone)]
pub(crate) struct VarInfo {
    pub name: String,
    pub expr: ExprId,
    /// Sorted, deduplicated values
    pub domain: Vec<i64>,
    pub is_bool: bool,
    pub group: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Constraint {
    Equal(ExprId, ExprId),
    LessEqual(ExprId, ExprId),
}

#[derive(Debug, Default)]
pub(crate) struct ExprArena {
    pub nodes: Vec<Node>,
    pub vars: Vec<VarInfo>,
    pub constraints: Vec<Constraint>,
    /// Exactly-one groups, as variable indices
    pub groups: Vec<Vec<usize>>,
    constants: HashMap<i64, ExprId>,
}

impl ExprArena {
    fn push(&mut self, node: Node) -> ExprId {
        let id = ExprId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    fn new_var(&mut self, name: &str, mut domain: Vec<i64>, is_bool: bool) -> ExprId {
        domain.sort_unstable();
        domain.dedup();
        let var = self.vars.len();
        let expr = self.push(Node::Var(var));
        self.vars.push(VarInfo {
            name: name.to_string(),
            expr,
            domain,
            is_bool,
            group: None,
        });
        expr
    }

    pub fn var_of(&self, expr: ExprId) -> Option<usize> {
        match self.nodes.get(expr.index()) {
            Some(Node::Var(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn new_int(&mut self, name: &str, domain: &[i64]) -> Result<ExprId, SolveError> {
        if domain.is_empty() {
            return Err(SolveError::InvalidModel(format!("variable {} has an empty domain", name)));
        }
        Ok(self.new_var(name, domain.to_vec(), false))
    }

    pub fn new_bool(&mut self, name: &str) -> ExprId {
        self.new_var(name, vec![0, 1], true)
    }

    pub fn constant(&mut self, value: i64) -> ExprId {
        if let Some(&id) = self.constants.get(&value) {
            return id;
        }
        let id = self.push(Node::Const(value));
        self.constants.insert(value, id);
        id
    }

    pub fn linear(&mut self, terms: &[(i64, ExprId)], constant: i64) -> ExprId {
        let terms: Vec<(i64, ExprId)> = terms.iter().copied().filter(|(c, _)| *c != 0).collect();
        if terms.is_empty() {
            return self.constant(constant);
        }
        self.push(Node::Linear { terms, constant })
    }

    /// Constant factors are folded out of the product.
    pub fn product(&mut self, factors: &[ExprId]) -> ExprId {
        let mut constant = 1i64;
        let mut rest = Vec::with_capacity(factors.len());
        for &f in factors {
            match self.nodes[f.index()] {
                Node::Const(c) => constant = constant.saturating_mul(c),
                _ => rest.push(f),
            }
        }
        match (rest.len(), constant) {
            (_, 0) => self.constant(0),
            (0, c) => self.constant(c),
            (1, 1) => rest[0],
            (1, c) => self.linear(&[(c, rest[0])], 0),
            (_, 1) => self.push(Node::Product(rest)),
            (_, c) => {
                let prod = self.push(Node::Product(rest));
                self.linear(&[(c, prod)], 0)
            }
        }
    }

    pub fn add_equal(&mut self, lhs: ExprId, rhs: ExprId) {
        self.constraints.push(Constraint::Equal(lhs, rhs));
    }

    pub fn add_less_equal(&mut self, lhs: ExprId, rhs: ExprId) {
        self.constraints.push(Constraint::LessEqual(lhs, rhs));
    }

    /// Members must be booleans not yet in any group.
    pub fn add_exactly_one(&mut self, bools: &[ExprId]) -> Result<(), SolveError> {
        if bools.is_empty() {
            return Err(SolveError::InvalidModel("exactly-one over no variables".to_string()));
        }
        let group = self.groups.len();
        let mut members = Vec::with_capacity(bools.len());
        for &b in bools {
            let v = self
                .var_of(b)
                .filter(|&v| self.vars[v].is_bool)
                .ok_or_else(|| SolveError::InvalidModel(format!("{} is not a boolean variable", b)))?;
            if self.vars[v].group.is_some() {
                return Err(SolveError::InvalidModel(format!(
                    "{} already belongs to an exactly-one group",
                    b
                )));
            }
            members.push(v);
        }
        for &v in &members {
            self.vars[v].group = Some(group);
        }
        self.groups.push(members);
        Ok(())
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len() + self.groups.len()
    }

    /// Whether `values` (one per expression) is a full solution: every
    /// variable in its domain, every constraint and group satisfied, and
    /// every derived expression consistent with its operands.
    pub fn satisfied_by(&self, values: &[i64]) -> bool {
        if values.len() != self.nodes.len() {
            return false;
        }
        let derived = self.nodes.iter().zip(values).all(|(node, &value)| match node {
            Node::Const(c) => value == *c,
            Node::Var(v) => self.vars[*v].domain.binary_search(&value).is_ok(),
            Node::Linear { terms, constant } => {
                let sum = terms
                    .iter()
                    .fold(*constant as i128, |acc, &(c, e)| acc + c as i128 * values[e.index()] as i128);
                sum == value as i128
            }
            Node::Product(factors) => {
                let prod = factors
                    .iter()
                    .fold(1i128, |acc, f| acc.saturating_mul(values[f.index()] as i128));
                prod == value as i128
            }
        });
        let posted = self.constraints.iter().all(|c| match *c {
            Constraint::Equal(a, b) => values[a.index()] == values[b.index()],
            Constraint::LessEqual(a, b) => values[a.index()] <= values[b.index()],
        });
        let grouped = self.groups.iter().all(|members| {
            members
                .iter()
                .filter(|&&v| values[self.vars[v].expr.index()] == 1)
                .count()
                == 1
        });
        derived && posted && grouped
    }

    pub fn check_objective(&self, objective: ExprId) -> Result<(), SolveError> {
        if objective.index() >= self.nodes.len() {
            return Err(SolveError::InvalidModel(format!("unknown objective {}", objective)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_shared() {
        let mut arena = ExprArena::default();
        let a = arena.constant(4);
        let b = arena.constant(4);
        assert_eq!(a, b);
        assert_eq!(arena.nodes.len(), 1);
    }

    #[test]
    fn test_product_folds_to_linear() {
        let mut arena = ExprArena::default();
        let x = arena.new_int("x", &[1, 2]).unwrap();
        let three = arena.constant(3);
        let p = arena.product(&[three, x]);
        assert!(matches!(&arena.nodes[p.index()], Node::Linear { terms, constant: 0 } if terms == &vec![(3, x)]));
        let zero = arena.constant(0);
        assert_eq!(arena.product(&[x, zero]), zero);
    }

    #[test]
    fn test_domain_is_normalized() {
        let mut arena = ExprArena::default();
        let x = arena.new_int("x", &[4, 1, 4, 2]).unwrap();
        let v = arena.var_of(x).unwrap();
        assert_eq!(arena.vars[v].domain, vec![1, 2, 4]);
        assert!(arena.new_int("empty", &[]).is_err());
    }

    #[test]
    fn test_satisfied_by_checks_groups_and_products() {
        let mut arena = ExprArena::default();
        let x = arena.new_int("x", &[1, 2, 4]).unwrap();
        let a = arena.new_bool("a");
        let b = arena.new_bool("b");
        arena.add_exactly_one(&[a, b]).unwrap();
        let p = arena.product(&[a, x]);
        let two = arena.constant(2);
        arena.add_less_equal(p, two);

        let mut values = vec![0; arena.nodes.len()];
        values[x.index()] = 2;
        values[a.index()] = 1;
        values[p.index()] = 2;
        values[two.index()] = 2;
        assert!(arena.satisfied_by(&values));

        // both members set
        values[b.index()] = 1;
        assert!(!arena.satisfied_by(&values));
        values[b.index()] = 0;

        // product inconsistent with its factors
        values[p.index()] = 1;
        assert!(!arena.satisfied_by(&values));

        // capacity row violated
        values[x.index()] = 4;
        values[p.index()] = 4;
        assert!(!arena.satisfied_by(&values));
    }
}
