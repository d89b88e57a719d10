//! The tile graph: a forest of tile trees under one scope root.

use crate::affine::AffineMap;
use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::merge::{apply_merge, MergePoint};
use crate::graph::op::{DataflowGraph, OpId};
use crate::tree::{NodeId, NodeKind, OpLeaf, StructuralKey, TileNode, TileTree};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Dataflow graph plus its current tile forest.
///
/// Cloning is cheap enough for search: the dataflow graph is shared and the
/// tree is a flat arena.
#[derive(Debug, Clone)]
pub struct TileGraph {
    dataflow: Arc<DataflowGraph>,
    tree: TileTree,
    top_level: usize,
}

impl TileGraph {
    /// Initial forest: one chain `Tile(top) -> ... -> Tile(1) -> Op` per op,
    /// in topological order.
    pub fn new(dataflow: Arc<DataflowGraph>, top_level: usize) -> ScheduleResult<Self> {
        dataflow.validate()?;
        if top_level == 0 {
            return Err(ScheduleError::InvalidGraph(
                "tile graph needs at least one tiling level".to_string(),
            ));
        }

        let mut tree = TileTree::new(NodeKind::Scope);
        for op in &dataflow.ops {
            let rank = op.rank();
            let mut parent = tree.root();
            for level in (1..=top_level).rev() {
                parent = tree.add_child(
                    parent,
                    NodeKind::Tile(TileNode {
                        level,
                        op: op.id,
                        relation: AffineMap::identity(rank),
                        bounds: op.domain_bounds.clone(),
                    }),
                );
            }
            tree.add_child(
                parent,
                NodeKind::Op(OpLeaf {
                    op: op.id,
                    relation: AffineMap::identity(rank),
                    bounds: op.domain_bounds.clone(),
                }),
            );
        }
        log::debug!(
            "tile graph '{}': {} ops, top level {}",
            dataflow.name,
            dataflow.len(),
            top_level
        );

        Ok(Self {
            dataflow,
            tree,
            top_level,
        })
    }

    pub fn dataflow(&self) -> &Arc<DataflowGraph> {
        &self.dataflow
    }

    pub fn tree(&self) -> &TileTree {
        &self.tree
    }

    pub fn top_level(&self) -> usize {
        self.top_level
    }

    /// Roots of the individual top-level trees.
    pub fn top_trees(&self) -> &[NodeId] {
        self.tree.children(self.tree.root())
    }

    /// Compact copy of one top-level tree.
    pub fn extract_tree(&self, id: NodeId) -> TileTree {
        self.tree.extract(id)
    }

    /// Canonical shape of the whole forest.
    pub fn structural_key(&self) -> StructuralKey {
        self.tree.structural_key(self.tree.root())
    }

    /// Candidate merges: for every pair of adjacent sibling tile nodes at
    /// the same level, one point per producer/consumer edge crossing them.
    /// Candidates are not checked for legality.
    pub fn merge_points(&self) -> Vec<MergePoint> {
        let mut points = BTreeSet::new();
        for node in self.tree.preorder(self.tree.root()) {
            for pair in self.tree.children(node).windows(2) {
                let (x, y) = (pair[0], pair[1]);
                let level = match (self.tree.kind(x), self.tree.kind(y)) {
                    (NodeKind::Tile(a), NodeKind::Tile(b)) if a.level == b.level => a.level,
                    _ => continue,
                };
                let producers: BTreeSet<OpId> =
                    self.tree.op_leaves(x).into_iter().map(|(op, _)| op).collect();
                for (consumer, _) in self.tree.op_leaves(y) {
                    let Ok(op) = self.dataflow.op(consumer) else { continue };
                    for producer in op.producers() {
                        if producers.contains(&producer) {
                            points.insert(MergePoint::new(producer, consumer, level));
                        }
                    }
                }
            }
        }
        points.into_iter().collect()
    }

    /// Copy of this graph with `mp` applied.
    pub fn merge(&self, mp: &MergePoint) -> ScheduleResult<TileGraph> {
        let mut next = self.clone();
        apply_merge(&mut next.tree, &self.dataflow, mp)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> Arc<DataflowGraph> {
        let mut graph = DataflowGraph::new("chain");
        let mut prev = None;
        for i in 0..n {
            prev = Some(graph.add_elementwise(&format!("op{}", i), &[8, 8], &[prev]));
        }
        Arc::new(graph)
    }

    #[test]
    fn test_initial_chains() {
        let graph = TileGraph::new(chain(2), 3).unwrap();
        assert_eq!(graph.top_trees().len(), 2);
        let first = graph.extract_tree(graph.top_trees()[0]);
        // Tile(3), Tile(2), Tile(1), Op
        assert_eq!(first.preorder(first.root()).len(), 4);
        assert_eq!(first.level(first.root()), 3);
    }

    #[test]
    fn test_merge_points_follow_adjacency() {
        let graph = TileGraph::new(chain(3), 2).unwrap();
        let points = graph.merge_points();
        assert_eq!(
            points,
            vec![MergePoint::new(OpId(0), OpId(1), 2), MergePoint::new(OpId(1), OpId(2), 2)]
        );

        let merged = graph.merge(&points[0]).unwrap();
        assert_eq!(merged.top_trees().len(), 2);
        // inner level-1 pair plus the new top-level edge
        let next = merged.merge_points();
        assert!(next.contains(&MergePoint::new(OpId(0), OpId(1), 1)));
        assert!(next.contains(&MergePoint::new(OpId(1), OpId(2), 2)));
        // source graph untouched
        assert_eq!(graph.top_trees().len(), 3);
    }

    #[test]
    fn test_structural_key_ignores_arena_layout() {
        let graph = TileGraph::new(chain(3), 2).unwrap();
        let a = graph.merge(&MergePoint::new(OpId(0), OpId(1), 2)).unwrap();
        let b = graph.merge(&MergePoint::new(OpId(0), OpId(1), 2)).unwrap();
        assert_eq!(a.structural_key(), b.structural_key());
        assert_ne!(a.structural_key(), graph.structural_key());
    }

    #[test]
    fn test_zero_levels_rejected() {
        assert!(TileGraph::new(chain(1), 0).is_err());
    }
}
