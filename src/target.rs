//! Target options: memory hierarchy and per-op kernel info.

use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::{DataflowGraph, KernelKind, OpNode};
use crate::solver::divisors;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One storage level of the memory hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryLevel {
    /// Level name (L1, L2, DDR, ...)
    pub name: String,
    /// Capacity in bytes; `None` is unbounded
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    /// Cost per byte moved into this level
    pub transfer_cost: i64,
}

impl MemoryLevel {
    pub fn new(name: &str, capacity_bytes: Option<u64>, transfer_cost: i64) -> Self {
        Self {
            name: name.to_string(),
            capacity_bytes,
            transfer_cost,
        }
    }
}

/// Backend-specific tiling limits for one op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    /// Implicit extent multiplier per domain dim
    pub primitives: Vec<i64>,
    /// Legal `(min, max)` op-level tile counts per domain dim
    pub multipliers: Vec<(i64, i64)>,
}

impl KernelInfo {
    /// Legal values of the op-level tile variable for `dim`.
    ///
    /// Empty when the primitive does not divide the bound or no divisor of
    /// the remaining extent lies within the multiplier range.
    pub fn op_tile_domain(&self, dim: usize, bound: i64) -> Vec<i64> {
        let primitive = self.primitives.get(dim).copied().unwrap_or(1).max(1);
        let (min, max) = self.multipliers.get(dim).copied().unwrap_or((1, i64::MAX));
        if bound % primitive != 0 {
            return Vec::new();
        }
        divisors(bound / primitive)
            .into_iter()
            .filter(|&d| d >= min && d <= max)
            .collect()
    }

    /// Primitive multiplier of `dim`, at least 1.
    pub fn primitive(&self, dim: usize) -> i64 {
        self.primitives.get(dim).copied().unwrap_or(1).max(1)
    }
}

/// Partial kernel info supplied for a named op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelOverride {
    #[serde(default)]
    pub primitives: Option<Vec<i64>>,
    #[serde(default)]
    pub multipliers: Option<Vec<(i64, i64)>>,
}

fn check_multiplier(what: &str, (min, max): (i64, i64)) -> ScheduleResult<()> {
    if min < 1 || min > max {
        return Err(ScheduleError::InvalidGraph(format!(
            "{} has an empty or non-positive multiplier range ({}, {})",
            what, min, max
        )));
    }
    Ok(())
}

impl KernelOverride {
    /// Check values, and lengths against `rank` when it is known.
    fn validate(&self, name: &str, rank: Option<usize>) -> ScheduleResult<()> {
        if let Some(p) = &self.primitives {
            if let Some(&bad) = p.iter().find(|&&v| v < 1) {
                return Err(ScheduleError::InvalidGraph(format!(
                    "kernel override for {} has primitive {}",
                    name, bad
                )));
            }
        }
        if let Some(m) = &self.multipliers {
            for &range in m {
                check_multiplier(&format!("kernel override for {}", name), range)?;
            }
        }
        let Some(rank) = rank else {
            return Ok(());
        };
        let lengths = [
            ("primitives", self.primitives.as_ref().map(Vec::len)),
            ("multipliers", self.multipliers.as_ref().map(Vec::len)),
        ];
        for (field, len) in lengths {
            if let Some(len) = len.filter(|&len| len != rank) {
                return Err(ScheduleError::InvalidGraph(format!(
                    "kernel override for {} gives {} {}, op has rank {}",
                    name, len, field, rank
                )));
            }
        }
        Ok(())
    }
}

/// Target architecture options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOptions {
    /// Memory levels, innermost first
    pub levels: Vec<MemoryLevel>,
    /// Vector register width in bytes
    #[serde(default = "TargetOptions::default_vector_width")]
    pub vector_width_bytes: i64,
    /// Default op-level `(min, max)` tile counts
    #[serde(default = "TargetOptions::default_multiplier")]
    pub default_multiplier: (i64, i64),
    /// Kernel info overrides keyed by op name
    #[serde(default)]
    pub kernel_overrides: BTreeMap<String, KernelOverride>,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            levels: vec![
                MemoryLevel::new("L1", Some(32 * 1024), 1),
                MemoryLevel::new("L2", Some(1024 * 1024), 2),
                MemoryLevel::new("DDR", None, 4),
            ],
            vector_width_bytes: Self::default_vector_width(),
            default_multiplier: Self::default_multiplier(),
            kernel_overrides: BTreeMap::new(),
        }
    }
}

impl TargetOptions {
    fn default_vector_width() -> i64 {
        32
    }

    fn default_multiplier() -> (i64, i64) {
        (1, 4)
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the memory hierarchy.
    pub fn with_levels(mut self, levels: Vec<MemoryLevel>) -> Self {
        self.levels = levels;
        self
    }

    /// Set the vector width.
    pub fn with_vector_width(mut self, bytes: i64) -> Self {
        self.vector_width_bytes = bytes;
        self
    }

    /// Override kernel info for the op called `name`.
    pub fn with_kernel_override(mut self, name: &str, kernel: KernelOverride) -> Self {
        self.kernel_overrides.insert(name.to_string(), kernel);
        self
    }

    /// Level of the outermost tile nodes; one per memory level.
    pub fn top_level(&self) -> usize {
        self.levels.len()
    }

    /// Capacity of memory level `sl`.
    pub fn capacity(&self, sl: usize) -> Option<u64> {
        self.levels.get(sl).and_then(|l| l.capacity_bytes)
    }

    /// Cost per byte moved into memory level `sl`.
    pub fn transfer_cost(&self, sl: usize) -> i64 {
        self.levels.get(sl).map(|l| l.transfer_cost).unwrap_or(1)
    }

    /// Resolve kernel info for an op.
    pub fn kernel_info(&self, op: &OpNode) -> KernelInfo {
        let rank = op.rank();
        let mut primitives = vec![1; rank];
        if op.kernel == KernelKind::Elementwise && rank > 0 {
            let lanes = self.vector_width_bytes / op.write.elem_bytes.max(1);
            let inner = op.domain_bounds[rank - 1];
            if lanes > 1 && inner % lanes == 0 {
                primitives[rank - 1] = lanes;
            }
        }
        let mut info = KernelInfo {
            primitives,
            multipliers: vec![self.default_multiplier; rank],
        };
        if let Some(o) = self.kernel_overrides.get(&op.name) {
            if let Some(p) = &o.primitives {
                info.primitives = p.clone();
            }
            if let Some(m) = &o.multipliers {
                info.multipliers = m.clone();
            }
        }
        info
    }

    /// Check that the hierarchy is usable.
    pub fn validate(&self) -> ScheduleResult<()> {
        if self.levels.is_empty() {
            return Err(ScheduleError::InvalidGraph(
                "target has no memory levels".to_string(),
            ));
        }
        if let Some(l) = self.levels.iter().find(|l| l.transfer_cost < 0) {
            return Err(ScheduleError::InvalidGraph(format!(
                "memory level {} has negative transfer cost",
                l.name
            )));
        }
        check_multiplier("default kernel info", self.default_multiplier)?;
        for (name, o) in &self.kernel_overrides {
            o.validate(name, None)?;
        }
        Ok(())
    }

    /// [`validate`](Self::validate), plus override lengths against the ranks
    /// of the ops they name in `graph`.
    pub fn validate_for(&self, graph: &DataflowGraph) -> ScheduleResult<()> {
        self.validate()?;
        for op in &graph.ops {
            if let Some(o) = self.kernel_overrides.get(&op.name) {
                o.validate(&op.name, Some(op.rank()))?;
            }
        }
        Ok(())
    }

    /// Parse target options from JSON.
    pub fn from_json(text: &str) -> ScheduleResult<Self> {
        let options: TargetOptions = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DataflowGraph;

    #[test]
    fn test_default_hierarchy() {
        let target = TargetOptions::default();
        assert_eq!(target.top_level(), 3);
        assert_eq!(target.capacity(0), Some(32 * 1024));
        assert_eq!(target.capacity(2), None);
        assert_eq!(target.transfer_cost(1), 2);
    }

    #[test]
    fn test_elementwise_vector_primitive() {
        let mut graph = DataflowGraph::new("g");
        let id = graph.add_elementwise("add", &[64, 64], &[None, None]);
        let info = TargetOptions::default().kernel_info(graph.op(id).unwrap());
        assert_eq!(info.primitives, vec![1, 8]);
        // 64 / 8 = 8, divisors within [1, 4]
        assert_eq!(info.op_tile_domain(1, 64), vec![1, 2, 4]);
        assert_eq!(info.op_tile_domain(0, 64), vec![1, 2, 4]);
    }

    #[test]
    fn test_override_can_empty_domain() {
        let mut graph = DataflowGraph::new("g");
        let id = graph.add_elementwise("odd", &[64], &[None]);
        let target = TargetOptions::default().with_kernel_override(
            "odd",
            KernelOverride {
                primitives: Some(vec![1]),
                multipliers: Some(vec![(3, 3)]),
            },
        );
        let info = target.kernel_info(graph.op(id).unwrap());
        assert!(info.op_tile_domain(0, 64).is_empty());
    }

    #[test]
    fn test_from_json_defaults() {
        let text = r#"{"levels": [{"name": "SRAM", "capacity_bytes": 4096, "transfer_cost": 1},
                                  {"name": "DDR", "transfer_cost": 8}]}"#;
        let target = TargetOptions::from_json(text).unwrap();
        assert_eq!(target.top_level(), 2);
        assert_eq!(target.vector_width_bytes, 32);
        assert_eq!(target.default_multiplier, (1, 4));
        assert!(TargetOptions::from_json(r#"{"levels": []}"#).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_overrides() {
        let bad_primitive = TargetOptions::default().with_kernel_override(
            "a",
            KernelOverride {
                primitives: Some(vec![0, 1]),
                multipliers: None,
            },
        );
        assert!(bad_primitive.validate().is_err());

        let inverted = TargetOptions::default().with_kernel_override(
            "a",
            KernelOverride {
                primitives: None,
                multipliers: Some(vec![(4, 2)]),
            },
        );
        assert!(inverted.validate().is_err());

        let mut defaults = TargetOptions::default();
        defaults.default_multiplier = (0, 4);
        assert!(defaults.validate().is_err());

        // well-formed, but op "a" has rank 2
        let mut graph = DataflowGraph::new("g");
        graph.add_elementwise("a", &[8, 8], &[None]);
        let short = TargetOptions::default().with_kernel_override(
            "a",
            KernelOverride {
                primitives: None,
                multipliers: Some(vec![(1, 2)]),
            },
        );
        assert!(short.validate().is_ok());
        assert!(short.validate_for(&graph).is_err());
        let exact = TargetOptions::default().with_kernel_override(
            "a",
            KernelOverride {
                primitives: Some(vec![1, 1]),
                multipliers: Some(vec![(1, 2), (1, 2)]),
            },
        );
        assert!(exact.validate_for(&graph).is_ok());
    }

    #[test]
    fn test_primitive_is_at_least_one() {
        let info = KernelInfo {
            primitives: vec![0, -3],
            multipliers: vec![(1, 4); 2],
        };
        assert_eq!(info.primitive(0), 1);
        assert_eq!(info.primitive(1), 1);
        assert_eq!(info.primitive(5), 1);
    }
}
