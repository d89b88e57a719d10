//! Affine maps for domain relations and buffer access relations.
//!
//! A map takes an ordered tuple of domain dimensions, each carrying an
//! `(offset, extent)` pair, to an ordered tuple of [`AffineRange`]s. Result
//! offsets are expressions over the input offsets and result extents are
//! expressions over the input extents, so the same map describes both which
//! element a loop index touches and how large a tile of the loop nest is.

use crate::affine::expr::AffineExpr;
use crate::error::{ScheduleError, ScheduleResult};
use crate::solver::{ConstraintModel, ExprId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Mul;

/// One result of an affine map: an offset and an extent expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffineRange {
    /// Start of the accessed range
    pub offset: AffineExpr,
    /// Length of the accessed range
    pub extent: AffineExpr,
}

impl AffineRange {
    /// The range `[d_k, d_k + e_k)`, i.e. dimension `k` passed through.
    pub fn dim(k: usize, n_dim: usize, n_sym: usize) -> Self {
        Self {
            offset: AffineExpr::dim(k, n_dim, n_sym),
            extent: AffineExpr::dim(k, n_dim, n_sym),
        }
    }

    /// A range that does not depend on the input dimensions.
    pub fn constant(offset: i64, extent: i64, n_dim: usize, n_sym: usize) -> Self {
        Self {
            offset: AffineExpr::constant(offset, n_dim, n_sym),
            extent: AffineExpr::constant(extent, n_dim, n_sym),
        }
    }

    /// If both offset and extent pass dimension `k` straight through, return `k`.
    pub fn as_pure_dim(&self) -> Option<usize> {
        match (self.offset.as_pure_dim(), self.extent.as_pure_dim()) {
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        }
    }

    /// If the range is constant, return `(offset, extent)`.
    pub fn as_constant(&self) -> Option<(i64, i64)> {
        Some((self.offset.as_constant()?, self.extent.as_constant()?))
    }
}

/// Bitmask of loop dimensions a buffer access depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopMask(pub u32);

impl LoopMask {
    /// Whether loop `dim` influences the access.
    pub fn is_related(&self, dim: usize) -> bool {
        dim < 32 && self.0 & (1 << dim) != 0
    }

    /// Union of two masks.
    pub fn union(self, other: LoopMask) -> LoopMask {
        LoopMask(self.0 | other.0)
    }

    /// Number of related loops.
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }
}

impl fmt::Display for LoopMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}

/// An affine map from a domain of `n_dim` ranges to `results.len()` ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffineMap {
    /// Number of input dimensions
    pub n_dim: usize,
    /// Number of symbols
    #[serde(default)]
    pub n_sym: usize,
    /// Output ranges (one per output dimension)
    pub results: Vec<AffineRange>,
}

impl AffineMap {
    /// Create an identity map of given dimension.
    pub fn identity(n_dim: usize) -> Self {
        let results = (0..n_dim).map(|i| AffineRange::dim(i, n_dim, 0)).collect();
        Self { n_dim, n_sym: 0, results }
    }

    /// Create from output ranges.
    pub fn from_results(n_dim: usize, results: Vec<AffineRange>) -> Self {
        let n_sym = results
            .iter()
            .map(|r| r.offset.n_sym().max(r.extent.n_sym()))
            .max()
            .unwrap_or(0);
        Self { n_dim, n_sym, results }
    }

    /// Create a permutation map: result `i` is input dimension `perm[i]`.
    pub fn permutation(n_dim: usize, perm: &[usize]) -> Self {
        let results = perm.iter().map(|&i| AffineRange::dim(i, n_dim, 0)).collect();
        Self { n_dim, n_sym: 0, results }
    }

    /// Primitive map for tile factors: offsets pass through, extents are
    /// scaled by `factors[i]`.
    pub fn primitive(factors: &[i64]) -> Self {
        let n_dim = factors.len();
        let results = factors
            .iter()
            .enumerate()
            .map(|(i, &f)| AffineRange {
                offset: AffineExpr::dim(i, n_dim, 0),
                extent: AffineExpr::dim(i, n_dim, 0).scale(f),
            })
            .collect();
        Self { n_dim, n_sym: 0, results }
    }

    /// Get input dimensions.
    pub fn n_in(&self) -> usize {
        self.n_dim
    }

    /// Get output dimensions.
    pub fn n_out(&self) -> usize {
        self.results.len()
    }

    /// Compose two maps: the result's domain is `self`'s domain, applied
    /// through `other`. `self.compose(&other)(x) == other(self(x))`.
    pub fn compose(&self, other: &AffineMap) -> ScheduleResult<AffineMap> {
        if self.n_out() != other.n_in() {
            return Err(ScheduleError::AffineMismatch(format!(
                "cannot compose {} ({} results) with {} ({} inputs)",
                self,
                self.n_out(),
                other,
                other.n_in()
            )));
        }
        let offsets: Vec<AffineExpr> = self.results.iter().map(|r| r.offset.clone()).collect();
        let extents: Vec<AffineExpr> = self.results.iter().map(|r| r.extent.clone()).collect();
        let results = other
            .results
            .iter()
            .map(|r| AffineRange {
                offset: r.offset.substitute(&offsets, self.n_dim),
                extent: r.extent.substitute(&extents, self.n_dim),
            })
            .collect();
        Ok(AffineMap::from_results(self.n_dim, results))
    }

    /// Apply the map to concrete `(offset, extent)` ranges.
    pub fn apply_ranges(&self, ranges: &[(i64, i64)], syms: &[i64]) -> Vec<(i64, i64)> {
        let offsets: Vec<i64> = ranges.iter().map(|r| r.0).collect();
        let extents: Vec<i64> = ranges.iter().map(|r| r.1).collect();
        self.results
            .iter()
            .map(|r| (r.offset.evaluate(&offsets, syms), r.extent.evaluate(&extents, syms)))
            .collect()
    }

    /// Apply the map to the full domain `[0, bound)` of every input dimension.
    pub fn apply_bounds(&self, bounds: &[i64]) -> Vec<i64> {
        let ranges: Vec<(i64, i64)> = bounds.iter().map(|&b| (0, b)).collect();
        self.apply_ranges(&ranges, &[])
            .into_iter()
            .map(|(_, e)| e)
            .collect()
    }

    /// Loop mask of a single result: which input dimensions it depends on.
    pub fn loop_mask(&self, result: usize) -> LoopMask {
        self.results
            .get(result)
            .map(|r| LoopMask(r.offset.dim_mask() | r.extent.dim_mask()))
            .unwrap_or_default()
    }

    /// Union of the loop masks of all results.
    pub fn buffer_mask(&self) -> LoopMask {
        (0..self.n_out()).fold(LoopMask::default(), |m, i| m.union(self.loop_mask(i)))
    }

    /// Result index -> input dimension for results that pass an input
    /// dimension straight through.
    pub fn dims_map(&self) -> BTreeMap<usize, usize> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(k, r)| r.as_pure_dim().map(|v| (k, v)))
            .collect()
    }

    /// Every result is either a pass-through dimension or a constant range.
    pub fn is_pure_or_constant(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.as_pure_dim().is_some() || r.as_constant().is_some())
    }

    /// Check if this is an identity map.
    pub fn is_identity(&self) -> bool {
        self.n_in() == self.n_out()
            && self
                .results
                .iter()
                .enumerate()
                .all(|(i, r)| r.as_pure_dim() == Some(i))
    }

    /// Lower every result extent into the model, binding input extents to
    /// `extents`.
    pub fn extents_to_model(
        &self,
        model: &mut dyn ConstraintModel,
        extents: &[ExprId],
    ) -> ScheduleResult<Vec<ExprId>> {
        self.results
            .iter()
            .map(|r| r.extent.to_model_expr(model, extents, &[]))
            .collect()
    }
}

impl Mul for &AffineMap {
    type Output = ScheduleResult<AffineMap>;

    fn mul(self, other: &AffineMap) -> ScheduleResult<AffineMap> {
        self.compose(other)
    }
}

impl fmt::Display for AffineMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dim_names: Vec<String> = (0..self.n_in()).map(|i| format!("d{}", i)).collect();
        let ext_names: Vec<String> = (0..self.n_in()).map(|i| format!("t{}", i)).collect();
        let sym_names: Vec<String> = (0..self.n_sym).map(|i| format!("s{}", i)).collect();
        write!(f, "({}) -> (", dim_names.join(", "))?;
        for (i, r) in self.results.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{}@{}",
                r.offset.to_string_with_names(&dim_names, &sym_names),
                r.extent.to_string_with_names(&ext_names, &sym_names)
            )?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let map = AffineMap::identity(3);
        assert!(map.is_identity());
        assert_eq!(
            map.apply_ranges(&[(1, 4), (2, 5), (3, 6)], &[]),
            vec![(1, 4), (2, 5), (3, 6)]
        );
    }

    #[test]
    fn test_compose_permutation() {
        let swap = AffineMap::permutation(2, &[1, 0]);
        let composed = swap.compose(&swap).unwrap();
        assert!(composed.is_identity());
    }

    #[test]
    fn test_compose_rejects_arity_mismatch() {
        let lhs = AffineMap::permutation(3, &[0, 2]);
        let err = lhs.compose(&AffineMap::identity(3)).unwrap_err();
        assert!(matches!(err, ScheduleError::AffineMismatch(_)));
        assert!((&lhs * &AffineMap::identity(1)).is_err());
    }

    #[test]
    fn test_compose_primitive() {
        // primitive then matmul lhs access (m, n, k) -> (m, k)
        let prim = AffineMap::primitive(&[1, 1, 8]);
        let lhs = AffineMap::permutation(3, &[0, 2]);
        let access = (&prim * &lhs).unwrap();
        assert_eq!(access.n_in(), 3);
        assert_eq!(access.apply_bounds(&[4, 5, 2]), vec![4, 16]);
    }

    #[test]
    fn test_loop_masks() {
        let lhs = AffineMap::permutation(3, &[0, 2]);
        assert_eq!(lhs.loop_mask(0), LoopMask(0b001));
        assert_eq!(lhs.loop_mask(1), LoopMask(0b100));
        assert_eq!(lhs.buffer_mask(), LoopMask(0b101));
        assert!(!lhs.buffer_mask().is_related(1));
    }

    #[test]
    fn test_dims_map_skips_constant_results() {
        let map = AffineMap::from_results(
            2,
            vec![
                AffineRange::dim(1, 2, 0),
                AffineRange::constant(0, 16, 2, 0),
                AffineRange::dim(0, 2, 0),
            ],
        );
        let dims = map.dims_map();
        assert_eq!(dims.get(&0), Some(&1));
        assert_eq!(dims.get(&1), None);
        assert_eq!(dims.get(&2), Some(&0));
        assert!(map.is_pure_or_constant());
        assert_eq!(map.apply_bounds(&[3, 7]), vec![7, 16, 3]);
    }

    #[test]
    fn test_display() {
        let map = AffineMap::permutation(2, &[1, 0]);
        assert_eq!(map.to_string(), "(d0, d1) -> (d1@t1, d0@t0)");
    }
}
