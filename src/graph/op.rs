//! Dataflow graph input: operation nodes with affine access maps.
//!
//! Every operation carries fixed iteration-domain bounds, one read map per
//! input buffer and one write map. A read that consumes another operation's
//! output names that producer; those references are the dependency edges of
//! the graph.

use crate::affine::{AffineMap, AffineRange};
use crate::error::{ScheduleError, ScheduleResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A unique identifier for operation nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub usize);

impl OpId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse kernel family, used to resolve kernel info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KernelKind {
    /// One output element per domain point
    #[default]
    Elementwise,
    /// Matrix multiplication over `(m, n, k)`
    Matmul,
    /// Reduction over trailing dimensions
    Reduction,
    /// Anything else
    Other,
}

/// A read access of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadAccess {
    /// Domain -> buffer access map
    pub map: AffineMap,
    /// Element size in bytes
    pub elem_bytes: i64,
    /// Operation producing this buffer, if any
    #[serde(default)]
    pub producer: Option<OpId>,
}

/// The single write access of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAccess {
    /// Domain -> buffer access map
    pub map: AffineMap,
    /// Element size in bytes
    pub elem_bytes: i64,
}

/// One primitive tensor computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpNode {
    /// Stable identifier, equal to the index in the graph
    #[serde(default = "OpNode::unassigned")]
    pub id: OpId,
    /// Human-readable name
    pub name: String,
    /// Iteration extent per domain dimension
    pub domain_bounds: Vec<i64>,
    /// Read accesses, one per input buffer
    #[serde(default)]
    pub reads: Vec<ReadAccess>,
    /// Output access
    pub write: WriteAccess,
    /// Kernel family
    #[serde(default)]
    pub kernel: KernelKind,
}

impl OpNode {
    fn unassigned() -> OpId {
        OpId(usize::MAX)
    }

    /// Create an op with an identity write map.
    pub fn new(name: &str, domain_bounds: Vec<i64>, kernel: KernelKind) -> Self {
        let rank = domain_bounds.len();
        Self {
            id: Self::unassigned(),
            name: name.to_string(),
            domain_bounds,
            reads: Vec::new(),
            write: WriteAccess {
                map: AffineMap::identity(rank),
                elem_bytes: 4,
            },
            kernel,
        }
    }

    /// Add a read access.
    pub fn read(mut self, map: AffineMap, elem_bytes: i64, producer: Option<OpId>) -> Self {
        self.reads.push(ReadAccess {
            map,
            elem_bytes,
            producer,
        });
        self
    }

    /// Replace the write access.
    pub fn write(mut self, map: AffineMap, elem_bytes: i64) -> Self {
        self.write = WriteAccess { map, elem_bytes };
        self
    }

    /// Number of domain dimensions.
    pub fn rank(&self) -> usize {
        self.domain_bounds.len()
    }

    /// Buffer index of the output.
    pub fn output_index(&self) -> usize {
        self.reads.len()
    }

    /// Number of buffers touched (reads plus the output).
    pub fn num_buffers(&self) -> usize {
        self.reads.len() + 1
    }

    /// Access map of buffer `index`.
    pub fn buffer_map(&self, index: usize) -> Option<&AffineMap> {
        if index < self.reads.len() {
            Some(&self.reads[index].map)
        } else if index == self.reads.len() {
            Some(&self.write.map)
        } else {
            None
        }
    }

    /// Element size of buffer `index`.
    pub fn elem_bytes(&self, index: usize) -> i64 {
        if index < self.reads.len() {
            self.reads[index].elem_bytes
        } else {
            self.write.elem_bytes
        }
    }

    /// Full shape of buffer `index` over the whole domain.
    pub fn buffer_shape(&self, index: usize) -> Vec<i64> {
        self.buffer_map(index)
            .map(|m| m.apply_bounds(&self.domain_bounds))
            .unwrap_or_default()
    }

    /// Full size of buffer `index` in bytes.
    pub fn buffer_bytes(&self, index: usize) -> i64 {
        self.elem_bytes(index) * self.buffer_shape(index).iter().product::<i64>()
    }

    /// Producers this op depends on.
    pub fn producers(&self) -> impl Iterator<Item = OpId> + '_ {
        self.reads.iter().filter_map(|r| r.producer)
    }

    /// Index of the read that consumes `producer`'s output.
    pub fn read_of(&self, producer: OpId) -> Option<usize> {
        self.reads.iter().position(|r| r.producer == Some(producer))
    }
}

impl fmt::Display for OpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{} {} {:?}", self.id, self.name, self.domain_bounds)
    }
}

/// A dataflow graph of operations in topological order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataflowGraph {
    /// Graph name
    #[serde(default)]
    pub name: String,
    /// Operations; `ops[i].id == OpId(i)`
    pub ops: Vec<OpNode>,
}

impl DataflowGraph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ops: Vec::new(),
        }
    }

    /// Append an op, assigning its id.
    pub fn add(&mut self, mut op: OpNode) -> OpId {
        let id = OpId(self.ops.len());
        op.id = id;
        self.ops.push(op);
        id
    }

    /// Append an elementwise op with identity accesses and 4-byte elements.
    pub fn add_elementwise(&mut self, name: &str, bounds: &[i64], inputs: &[Option<OpId>]) -> OpId {
        let rank = bounds.len();
        let mut op = OpNode::new(name, bounds.to_vec(), KernelKind::Elementwise);
        for &producer in inputs {
            op = op.read(AffineMap::identity(rank), 4, producer);
        }
        self.add(op)
    }

    /// Append a matmul over `(m, n, k)` reading `[m, k]` and `[k, n]`.
    pub fn add_matmul(
        &mut self,
        name: &str,
        (m, n, k): (i64, i64, i64),
        lhs: Option<OpId>,
        rhs: Option<OpId>,
    ) -> OpId {
        let op = OpNode::new(name, vec![m, n, k], KernelKind::Matmul)
            .read(AffineMap::permutation(3, &[0, 2]), 4, lhs)
            .read(AffineMap::permutation(3, &[2, 1]), 4, rhs)
            .write(AffineMap::permutation(3, &[0, 1]), 4);
        self.add(op)
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Look up an op.
    pub fn op(&self, id: OpId) -> ScheduleResult<&OpNode> {
        self.ops
            .get(id.0)
            .ok_or_else(|| ScheduleError::InvalidGraph(format!("unknown op{}", id)))
    }

    /// Ops reading `id`'s output.
    pub fn consumers(&self, id: OpId) -> Vec<OpId> {
        self.ops
            .iter()
            .filter(|op| op.producers().any(|p| p == id))
            .map(|op| op.id)
            .collect()
    }

    /// Check ids, topological order and map arities.
    pub fn validate(&self) -> ScheduleResult<()> {
        for (i, op) in self.ops.iter().enumerate() {
            if op.id != OpId(i) {
                return Err(ScheduleError::InvalidGraph(format!(
                    "op at position {} has id {}",
                    i, op.id
                )));
            }
            if op.domain_bounds.is_empty() || op.domain_bounds.len() > 32 {
                return Err(ScheduleError::InvalidGraph(format!(
                    "op{} has rank {}",
                    i,
                    op.domain_bounds.len()
                )));
            }
            if let Some(b) = op.domain_bounds.iter().find(|&&b| b <= 0) {
                return Err(ScheduleError::InvalidGraph(format!("op{} has bound {}", i, b)));
            }
            for index in 0..op.num_buffers() {
                let map = op.buffer_map(index).ok_or_else(|| {
                    ScheduleError::InvalidGraph(format!("op{} buffer {} missing", i, index))
                })?;
                if map.n_in() != op.rank() {
                    return Err(ScheduleError::AffineMismatch(format!(
                        "op{} buffer {} map {} over rank {}",
                        i,
                        index,
                        map,
                        op.rank()
                    )));
                }
            }
            for read in &op.reads {
                let Some(p) = read.producer else { continue };
                if p.0 >= i {
                    return Err(ScheduleError::InvalidGraph(format!(
                        "op{} reads op{} which is not earlier in topological order",
                        i, p
                    )));
                }
                let producer = &self.ops[p.0];
                if producer.write.map.n_out() != read.map.n_out() {
                    return Err(ScheduleError::AffineMismatch(format!(
                        "op{} writes rank {} but op{} reads rank {}",
                        p,
                        producer.write.map.n_out(),
                        i,
                        read.map.n_out()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parse a graph from JSON and validate it.
    pub fn from_json(text: &str) -> ScheduleResult<Self> {
        let mut graph: DataflowGraph = serde_json::from_str(text)?;
        for (i, op) in graph.ops.iter_mut().enumerate() {
            if op.id == OpNode::unassigned() {
                op.id = OpId(i);
            }
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Serialize the graph to pretty JSON.
    pub fn to_json(&self) -> ScheduleResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Map taking a producer's domain to the consumer-side view of one of its
/// output elements: `write` results as pure dims, other producer dims as
/// constant full ranges.
///
/// Returns, for every producer domain dim, the output result that carries it.
pub(crate) fn write_dims(producer: &OpNode) -> Vec<Option<usize>> {
    let mut carried = vec![None; producer.rank()];
    for (k, r) in producer.write.map.results.iter().enumerate() {
        if let Some(d) = r.as_pure_dim() {
            if d < carried.len() && carried[d].is_none() {
                carried[d] = Some(k);
            }
        }
    }
    carried
}

/// Build the relation from a consumer-side tile domain into the producer's
/// domain, given the consumer-domain view of the producer's output.
///
/// `output_view` maps the consumer-side domain onto the producer's output
/// buffer. Producer dims not written to the output become constant full
/// ranges.
pub(crate) fn producer_relation(
    producer: &OpNode,
    output_view: &AffineMap,
) -> Option<AffineMap> {
    let carried = write_dims(producer);
    let n_dim = output_view.n_in();
    let results = carried
        .iter()
        .enumerate()
        .map(|(d, k)| match k {
            Some(k) => output_view.results.get(*k).cloned(),
            None => Some(AffineRange::constant(0, producer.domain_bounds[d], n_dim, 0)),
        })
        .collect::<Option<Vec<_>>>()?;
    Some(AffineMap::from_results(n_dim, results))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> DataflowGraph {
        let mut graph = DataflowGraph::new("chain");
        let a = graph.add_elementwise("relu", &[64, 64], &[None]);
        graph.add_elementwise("exp", &[64, 64], &[Some(a)]);
        graph
    }

    #[test]
    fn test_buffer_identity_indices() {
        let graph = chain();
        let exp = &graph.ops[1];
        assert_eq!(exp.output_index(), 1);
        assert_eq!(exp.num_buffers(), 2);
        assert_eq!(exp.buffer_bytes(0), 64 * 64 * 4);
        assert!(exp.buffer_map(2).is_none());
        assert_eq!(exp.read_of(OpId(0)), Some(0));
        assert_eq!(graph.consumers(OpId(0)), vec![OpId(1)]);
    }

    #[test]
    fn test_validate_rejects_forward_edges() {
        let mut graph = DataflowGraph::new("bad");
        graph.add_elementwise("a", &[8], &[Some(OpId(1))]);
        graph.add_elementwise("b", &[8], &[None]);
        assert!(matches!(graph.validate(), Err(ScheduleError::InvalidGraph(_))));
    }

    #[test]
    fn test_validate_rejects_arity_mismatch() {
        let mut graph = DataflowGraph::new("bad");
        let op = OpNode::new("a", vec![8, 8], KernelKind::Elementwise).read(AffineMap::identity(3), 4, None);
        graph.add(op);
        assert!(matches!(graph.validate(), Err(ScheduleError::AffineMismatch(_))));
    }

    #[test]
    fn test_matmul_shapes() {
        let mut graph = DataflowGraph::new("mm");
        let mm = graph.add_matmul("mm", (32, 16, 8), None, None);
        let op = graph.op(mm).unwrap();
        assert_eq!(op.buffer_shape(0), vec![32, 8]);
        assert_eq!(op.buffer_shape(1), vec![8, 16]);
        assert_eq!(op.buffer_shape(2), vec![32, 16]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_json_assigns_ids() {
        let graph = chain();
        let mut value: serde_json::Value = serde_json::from_str(&graph.to_json().unwrap()).unwrap();
        for op in value["ops"].as_array_mut().unwrap() {
            op.as_object_mut().unwrap().remove("id");
        }
        let parsed = DataflowGraph::from_json(&value.to_string()).unwrap();
        assert_eq!(parsed, graph);
    }

    #[test]
    fn test_producer_relation_fills_reduced_dims() {
        // producer reduces over d1: (d0, d1) -> (d0)
        let producer = OpNode::new("sum", vec![16, 8], KernelKind::Reduction)
            .read(AffineMap::identity(2), 4, None)
            .write(AffineMap::permutation(2, &[0]), 4);
        let view = AffineMap::permutation(1, &[0]);
        let rel = producer_relation(&producer, &view).unwrap();
        assert_eq!(rel.n_in(), 1);
        assert_eq!(rel.apply_bounds(&[16]), vec![16, 8]);
        assert_eq!(rel.results[1].as_constant(), Some((0, 8)));
    }
}
