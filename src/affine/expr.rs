//! Affine expressions over domain dimensions and symbols.
//!
//! An affine expression is a linear combination of dimensions and symbolic
//! constants plus a constant:
//! `aff(d, s) = c0 + c1*d1 + ... + cn*dn + k1*s1 + ... + km*sm`

use crate::error::{ScheduleError, ScheduleResult};
use crate::solver::{ConstraintModel, ExprId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

/// An affine expression: constant + sum(coeff[i] * dim[i]) + sum(sym_coeff[j] * sym[j]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffineExpr {
    /// Constant term
    pub constant: i64,
    /// Coefficients for each dimension (index = dimension index)
    pub coeffs: Vec<i64>,
    /// Coefficients for symbols (index = symbol index)
    #[serde(default)]
    pub sym_coeffs: Vec<i64>,
}

impl AffineExpr {
    /// Create a zero expression.
    pub fn zero(n_dim: usize, n_sym: usize) -> Self {
        Self {
            constant: 0,
            coeffs: vec![0; n_dim],
            sym_coeffs: vec![0; n_sym],
        }
    }

    /// Create a constant expression.
    pub fn constant(value: i64, n_dim: usize, n_sym: usize) -> Self {
        Self {
            constant: value,
            ..Self::zero(n_dim, n_sym)
        }
    }

    /// Create an expression for a single dimension.
    pub fn dim(dim: usize, n_dim: usize, n_sym: usize) -> Self {
        let mut expr = Self::zero(n_dim, n_sym);
        if dim < n_dim {
            expr.coeffs[dim] = 1;
        }
        expr
    }

    /// Create an expression for a symbol.
    pub fn symbol(sym: usize, n_dim: usize, n_sym: usize) -> Self {
        let mut expr = Self::zero(n_dim, n_sym);
        if sym < n_sym {
            expr.sym_coeffs[sym] = 1;
        }
        expr
    }

    /// Check if this is a constant expression.
    pub fn is_constant(&self) -> bool {
        self.coeffs.iter().all(|&c| c == 0) && self.sym_coeffs.iter().all(|&c| c == 0)
    }

    /// Get the constant value if this is a constant expression.
    pub fn as_constant(&self) -> Option<i64> {
        if self.is_constant() {
            Some(self.constant)
        } else {
            None
        }
    }

    /// If the expression is exactly one dimension (`d_k`), return `k`.
    pub fn as_pure_dim(&self) -> Option<usize> {
        if self.constant != 0 || self.sym_coeffs.iter().any(|&c| c != 0) {
            return None;
        }
        let mut found = None;
        for (i, &c) in self.coeffs.iter().enumerate() {
            match c {
                0 => {}
                1 if found.is_none() => found = Some(i),
                _ => return None,
            }
        }
        found
    }

    /// Get the number of dimensions.
    pub fn n_dim(&self) -> usize {
        self.coeffs.len()
    }

    /// Get the number of symbols.
    pub fn n_sym(&self) -> usize {
        self.sym_coeffs.len()
    }

    /// Get coefficient for a dimension.
    pub fn coeff(&self, dim: usize) -> i64 {
        self.coeffs.get(dim).copied().unwrap_or(0)
    }

    /// Whether the expression depends on dimension `dim`.
    pub fn depends_on(&self, dim: usize) -> bool {
        self.coeff(dim) != 0
    }

    /// Bitmask of the dimensions this expression depends on.
    pub fn dim_mask(&self) -> u32 {
        self.coeffs
            .iter()
            .enumerate()
            .filter(|(i, &c)| c != 0 && *i < 32)
            .fold(0u32, |mask, (i, _)| mask | (1 << i))
    }

    /// Evaluate the expression given concrete values.
    pub fn evaluate(&self, dim_values: &[i64], sym_values: &[i64]) -> i64 {
        let mut result = self.constant;
        for (i, &c) in self.coeffs.iter().enumerate() {
            if let Some(&v) = dim_values.get(i) {
                result += c * v;
            }
        }
        for (i, &c) in self.sym_coeffs.iter().enumerate() {
            if let Some(&v) = sym_values.get(i) {
                result += c * v;
            }
        }
        result
    }

    /// Scale the expression by a constant.
    pub fn scale(&self, factor: i64) -> Self {
        Self {
            constant: self.constant * factor,
            coeffs: self.coeffs.iter().map(|&c| c * factor).collect(),
            sym_coeffs: self.sym_coeffs.iter().map(|&c| c * factor).collect(),
        }
    }

    /// Substitute every dimension `d_i` with `replacements[i]`.
    ///
    /// The replacements all live in the same (new) dimension space; symbols
    /// are carried over unchanged.
    pub fn substitute(&self, replacements: &[AffineExpr], n_dim: usize) -> Self {
        let n_sym = self
            .n_sym()
            .max(replacements.iter().map(|r| r.n_sym()).max().unwrap_or(0));
        let mut result = AffineExpr::constant(self.constant, n_dim, n_sym);
        for (i, sc) in self.sym_coeffs.iter().enumerate() {
            result.sym_coeffs[i] += sc;
        }
        for (i, &coeff) in self.coeffs.iter().enumerate() {
            if coeff == 0 {
                continue;
            }
            if let Some(rep) = replacements.get(i) {
                result.accumulate(&rep.scale(coeff));
            }
        }
        result
    }

    fn accumulate(&mut self, other: &AffineExpr) {
        self.constant += other.constant;
        for (i, &c) in other.coeffs.iter().enumerate() {
            if i < self.coeffs.len() {
                self.coeffs[i] += c;
            }
        }
        for (i, &c) in other.sym_coeffs.iter().enumerate() {
            if i < self.sym_coeffs.len() {
                self.sym_coeffs[i] += c;
            }
        }
    }

    /// Lower the expression into the constraint model as a linear combination
    /// of `dim_exprs` (one model expression per dimension).
    pub fn to_model_expr(
        &self,
        model: &mut dyn ConstraintModel,
        dim_exprs: &[ExprId],
        sym_values: &[i64],
    ) -> ScheduleResult<ExprId> {
        let mut constant = self.constant;
        for (i, &c) in self.sym_coeffs.iter().enumerate() {
            let value = sym_values.get(i).copied().ok_or_else(|| {
                ScheduleError::AffineMismatch(format!("missing value for symbol s{}", i))
            })?;
            constant += c * value;
        }

        let mut terms = Vec::new();
        for (i, &c) in self.coeffs.iter().enumerate() {
            if c == 0 {
                continue;
            }
            let dim = dim_exprs.get(i).copied().ok_or_else(|| {
                ScheduleError::AffineMismatch(format!(
                    "expression {} references d{} but only {} dims are bound",
                    self,
                    i,
                    dim_exprs.len()
                ))
            })?;
            terms.push((c, dim));
        }

        // keep single-dim expressions as the dim itself so products stay small
        if constant == 0 && terms.len() == 1 && terms[0].0 == 1 {
            return Ok(terms[0].1);
        }
        Ok(model.linear(&terms, constant))
    }

    /// Convert to string with given dimension and symbol names.
    pub fn to_string_with_names(&self, dim_names: &[String], sym_names: &[String]) -> String {
        let mut parts = Vec::new();

        if self.constant != 0 || self.is_constant() {
            parts.push(format!("{}", self.constant));
        }

        let mut push_term = |c: i64, name: &str| {
            if c == 1 {
                parts.push(name.to_string());
            } else if c == -1 {
                parts.push(format!("-{}", name));
            } else if c != 0 {
                parts.push(format!("{}*{}", c, name));
            }
        };

        for (i, &c) in self.coeffs.iter().enumerate() {
            let default_name = format!("d{}", i);
            let name = dim_names.get(i).map(|s| s.as_str()).unwrap_or(&default_name);
            push_term(c, name);
        }
        for (i, &c) in self.sym_coeffs.iter().enumerate() {
            let default_name = format!("s{}", i);
            let name = sym_names.get(i).map(|s| s.as_str()).unwrap_or(&default_name);
            push_term(c, name);
        }

        if parts.is_empty() {
            "0".to_string()
        } else {
            parts.join(" + ").replace("+ -", "- ")
        }
    }
}

impl Add for AffineExpr {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        assert_eq!(self.coeffs.len(), other.coeffs.len());
        self.accumulate(&other);
        self
    }
}

impl Sub for AffineExpr {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        self + other.scale(-1)
    }
}

impl Neg for AffineExpr {
    type Output = Self;

    fn neg(self) -> Self {
        self.scale(-1)
    }
}

impl Mul<i64> for AffineExpr {
    type Output = Self;

    fn mul(self, factor: i64) -> Self {
        self.scale(factor)
    }
}

impl fmt::Display for AffineExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_with_names(&[], &[]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let expr = AffineExpr::constant(5, 2, 1);
        assert!(expr.is_constant());
        assert_eq!(expr.evaluate(&[1, 2], &[3]), 5);
    }

    #[test]
    fn test_dim() {
        let expr = AffineExpr::dim(0, 2, 0);
        assert!(!expr.is_constant());
        assert_eq!(expr.evaluate(&[7, 3], &[]), 7);
        assert_eq!(expr.as_pure_dim(), Some(0));
    }

    #[test]
    fn test_pure_dim_rejects_scaled() {
        let expr = AffineExpr::dim(1, 2, 0).scale(2);
        assert_eq!(expr.as_pure_dim(), None);
        let shifted = AffineExpr::dim(1, 2, 0) + AffineExpr::constant(1, 2, 0);
        assert_eq!(shifted.as_pure_dim(), None);
    }

    #[test]
    fn test_add_sub() {
        let sum = AffineExpr::dim(0, 2, 0) + AffineExpr::dim(1, 2, 0);
        assert_eq!(sum.evaluate(&[3, 4], &[]), 7);
        let diff = AffineExpr::dim(0, 2, 0) - AffineExpr::dim(1, 2, 0);
        assert_eq!(diff.evaluate(&[3, 4], &[]), -1);
    }

    #[test]
    fn test_substitute() {
        // 2*d0 + d1 with d0 := e1, d1 := 3*e0 + 1
        let expr = AffineExpr::dim(0, 2, 0).scale(2) + AffineExpr::dim(1, 2, 0);
        let reps = vec![
            AffineExpr::dim(1, 2, 0),
            AffineExpr::dim(0, 2, 0).scale(3) + AffineExpr::constant(1, 2, 0),
        ];
        let sub = expr.substitute(&reps, 2);
        assert_eq!(sub.evaluate(&[5, 7], &[]), 2 * 7 + 3 * 5 + 1);
    }

    #[test]
    fn test_dim_mask() {
        let expr = AffineExpr::dim(0, 3, 0) + AffineExpr::dim(2, 3, 0);
        assert_eq!(expr.dim_mask(), 0b101);
    }

    #[test]
    fn test_display() {
        let mut expr = AffineExpr::zero(2, 1);
        expr.constant = 5;
        expr.coeffs[0] = 2;
        expr.coeffs[1] = -1;
        expr.sym_coeffs[0] = 1;

        let s = expr.to_string_with_names(&["i".to_string(), "j".to_string()], &["N".to_string()]);
        assert_eq!(s, "5 + 2*i - j + N");
    }
}
