//! Merge points: fusing two adjacent tile subtrees into one.
//!
//! A merge point names a producer op, a consumer op and a tiling level. The
//! level-`L` tile nodes holding the two ops must be adjacent siblings,
//! producer first. They are replaced by a single level-`L` tile node over the
//! consumer's domain; the producer's subtrees are re-parented under it with a
//! relation derived from the consumer's read of the producer's output.

use crate::affine::AffineMap;
use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::op::{producer_relation, DataflowGraph, OpId};
use crate::tree::{NodeId, NodeKind, TileNode, TileTree};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One candidate contraction of the tile graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MergePoint {
    pub producer: OpId,
    pub consumer: OpId,
    pub level: usize,
}

impl MergePoint {
    pub fn new(producer: OpId, consumer: OpId, level: usize) -> Self {
        Self {
            producer,
            consumer,
            level,
        }
    }

    fn illegal(&self, reason: impl Into<String>) -> ScheduleError {
        ScheduleError::IllegalMerge {
            producer: self.producer,
            consumer: self.consumer,
            level: self.level,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MergePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}->op{}@L{}", self.producer, self.consumer, self.level)
    }
}

/// Closest ancestor of `node` that is a tile node at `level`.
fn tile_at_level(tree: &TileTree, node: NodeId, level: usize) -> Option<NodeId> {
    let mut cur = tree.parent(node);
    while let Some(id) = cur {
        if let NodeKind::Tile(t) = tree.kind(id) {
            if t.level == level {
                return Some(id);
            }
            if t.level > level {
                return None;
            }
        }
        cur = tree.parent(id);
    }
    None
}

/// The tile nodes to fuse and the leaves they hold.
struct Located {
    parent: NodeId,
    x: NodeId,
    y: NodeId,
    producer_leaf: NodeId,
    consumer_leaf: NodeId,
}

fn locate(tree: &TileTree, mp: &MergePoint) -> ScheduleResult<Located> {
    let root = tree.root();
    let producer_leaf = tree
        .find_op(root, mp.producer)
        .ok_or_else(|| mp.illegal("producer not in graph"))?;
    let consumer_leaf = tree
        .find_op(root, mp.consumer)
        .ok_or_else(|| mp.illegal("consumer not in graph"))?;
    let x = tile_at_level(tree, producer_leaf, mp.level)
        .ok_or_else(|| mp.illegal("producer has no tile node at this level"))?;
    let y = tile_at_level(tree, consumer_leaf, mp.level)
        .ok_or_else(|| mp.illegal("consumer has no tile node at this level"))?;
    if x == y {
        return Err(mp.illegal("already merged"));
    }
    let parent = tree
        .parent(y)
        .filter(|&p| tree.parent(x) == Some(p))
        .ok_or_else(|| mp.illegal("not siblings"))?;
    let siblings = tree.children(parent);
    let adjacent = siblings.windows(2).any(|w| w[0] == x && w[1] == y);
    if !adjacent {
        return Err(mp.illegal("not adjacent"));
    }
    Ok(Located {
        parent,
        x,
        y,
        producer_leaf,
        consumer_leaf,
    })
}

/// Relation from the consumer-side node `y`'s domain to `x`'s domain.
fn derive_relation(
    tree: &TileTree,
    dataflow: &DataflowGraph,
    mp: &MergePoint,
    at: &Located,
) -> ScheduleResult<AffineMap> {
    let producer = dataflow.op(mp.producer)?;
    let consumer = dataflow.op(mp.consumer)?;
    let read = consumer
        .read_of(mp.producer)
        .ok_or_else(|| mp.illegal("consumer does not read producer"))?;
    if producer.write.map.results.iter().any(|r| r.as_pure_dim().is_none()) {
        return Err(mp.illegal("producer write map is not a pure projection"));
    }

    let to_consumer = tree.relation_below(at.y, at.consumer_leaf)?;
    let view = to_consumer
        .compose(&consumer.reads[read].map)
        .map_err(|e| mp.illegal(e.to_string()))?;
    let to_producer =
        producer_relation(producer, &view).ok_or_else(|| mp.illegal("read rank mismatch"))?;

    // invert x's path down to the producer leaf
    let from_x = tree.relation_below(at.x, at.producer_leaf)?;
    let x_rank = tree.bounds(at.x).len();
    let mut results = Vec::with_capacity(x_rank);
    for j in 0..x_rank {
        let i = from_x
            .results
            .iter()
            .position(|r| r.as_pure_dim() == Some(j))
            .ok_or_else(|| mp.illegal(format!("d{} of the producer tile is not recoverable", j)))?;
        results.push(to_producer.results[i].clone());
    }
    let relation = AffineMap::from_results(view.n_in(), results);
    if !relation.is_pure_or_constant() {
        return Err(mp.illegal(format!("derived relation {} is not pure", relation)));
    }
    let projected = relation.apply_bounds(tree.bounds(at.y));
    if projected != tree.bounds(at.x) {
        return Err(mp.illegal(format!(
            "relation maps {:?} to {:?}, producer tile spans {:?}",
            tree.bounds(at.y),
            projected,
            tree.bounds(at.x)
        )));
    }
    Ok(relation)
}

/// Apply `mp` to `tree` in place. On error the tree is unchanged.
pub fn apply_merge(tree: &mut TileTree, dataflow: &DataflowGraph, mp: &MergePoint) -> ScheduleResult<()> {
    let at = locate(tree, mp)?;
    let relation = derive_relation(tree, dataflow, mp, &at)?;

    let (y_op, y_relation, y_bounds) = match tree.kind(at.y) {
        NodeKind::Tile(t) => (t.op, t.relation.clone(), t.bounds.clone()),
        _ => return Err(mp.illegal("consumer node is not a tile")),
    };
    let mut adopted = Vec::new();
    for &child in tree.children(at.x) {
        let rel = tree
            .relation(child)
            .ok_or_else(|| mp.illegal("scope below producer tile"))?;
        let rel = relation.compose(rel).map_err(|e| mp.illegal(e.to_string()))?;
        adopted.push((child, rel));
    }
    for &child in tree.children(at.y) {
        let rel = tree
            .relation(child)
            .cloned()
            .ok_or_else(|| mp.illegal("scope below consumer tile"))?;
        adopted.push((child, rel));
    }

    let merged = tree.add_detached(NodeKind::Tile(TileNode {
        level: mp.level,
        op: y_op,
        relation: y_relation,
        bounds: y_bounds,
    }));
    for (child, rel) in adopted {
        tree.adopt(merged, child, rel);
    }
    tree.splice(at.parent, at.x, at.y, merged);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TileGraph;
    use std::sync::Arc;

    fn chain(n: usize) -> Arc<DataflowGraph> {
        let mut graph = DataflowGraph::new("chain");
        let mut prev = None;
        for i in 0..n {
            let id = graph.add_elementwise(&format!("op{}", i), &[16, 16], &[prev]);
            prev = Some(id);
        }
        Arc::new(graph)
    }

    #[test]
    fn test_merge_fuses_top_level() {
        let graph = TileGraph::new(chain(2), 3).unwrap();
        let mut tree = graph.tree().clone();
        let mp = MergePoint::new(OpId(0), OpId(1), 3);
        apply_merge(&mut tree, graph.dataflow(), &mp).unwrap();
        let tops = tree.children(tree.root()).to_vec();
        assert_eq!(tops.len(), 1);
        assert_eq!(tree.children(tops[0]).len(), 2);
        assert_eq!(tree.level(tops[0]), 3);
        for (_, leaf) in tree.op_leaves(tree.root()) {
            let rel = tree.absolute_relation(leaf).unwrap();
            assert_eq!(rel.apply_bounds(&[16, 16]), vec![16, 16]);
        }
    }

    #[test]
    fn test_merge_rejects_non_adjacent() {
        let graph = TileGraph::new(chain(3), 3).unwrap();
        let mut tree = graph.tree().clone();
        let mp = MergePoint::new(OpId(0), OpId(2), 3);
        let err = apply_merge(&mut tree, graph.dataflow(), &mp).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(&tree, graph.tree());
    }

    #[test]
    fn test_merge_rejects_missing_edge() {
        let mut dataflow = DataflowGraph::new("pair");
        dataflow.add_elementwise("a", &[8], &[None]);
        dataflow.add_elementwise("b", &[8], &[None]);
        let graph = TileGraph::new(Arc::new(dataflow), 2).unwrap();
        let mut tree = graph.tree().clone();
        let err = apply_merge(&mut tree, graph.dataflow(), &MergePoint::new(OpId(0), OpId(1), 2)).unwrap_err();
        assert!(matches!(err, ScheduleError::IllegalMerge { .. }));
    }

    #[test]
    fn test_merge_rejects_extent_mismatch() {
        // consumer reads a [0, 8) window of a 16-wide producer output
        let mut dataflow = DataflowGraph::new("slice");
        let a = dataflow.add_elementwise("a", &[16], &[None]);
        dataflow.add(
            crate::graph::OpNode::new("b", vec![8], crate::graph::KernelKind::Elementwise)
                .read(AffineMap::identity(1), 4, Some(a)),
        );
        let graph = TileGraph::new(Arc::new(dataflow), 2).unwrap();
        let mut tree = graph.tree().clone();
        let err = apply_merge(&mut tree, graph.dataflow(), &MergePoint::new(OpId(0), OpId(1), 2)).unwrap_err();
        assert!(err.to_string().contains("producer tile spans"));
    }
}
