//! Double-dispatch traversal over tile trees.
//!
//! A pass implements one method per node kind; [`TreeVisitor::visit`]
//! matches on the closed [`NodeKind`] set and dispatches. Passes keep their
//! own per-node memo tables, so adding a pass never touches the node types.

use crate::error::ScheduleResult;
use crate::tree::node::{NodeId, NodeKind, OpLeaf, TileNode, TileTree};

/// A pass over a [`TileTree`].
pub trait TreeVisitor {
    /// Context handed from parent to child
    type Context;
    /// Value returned from child to parent
    type Output;

    /// Visit an operation leaf.
    fn visit_op(
        &mut self,
        tree: &TileTree,
        id: NodeId,
        leaf: &OpLeaf,
        ctx: &Self::Context,
    ) -> ScheduleResult<Self::Output>;

    /// Visit a tile node.
    fn visit_tile(
        &mut self,
        tree: &TileTree,
        id: NodeId,
        tile: &TileNode,
        ctx: &Self::Context,
    ) -> ScheduleResult<Self::Output>;

    /// Visit a scope node.
    fn visit_scope(
        &mut self,
        tree: &TileTree,
        id: NodeId,
        ctx: &Self::Context,
    ) -> ScheduleResult<Self::Output>;

    /// Dispatch on the node kind.
    fn visit(&mut self, tree: &TileTree, id: NodeId, ctx: &Self::Context) -> ScheduleResult<Self::Output> {
        match tree.kind(id) {
            NodeKind::Op(leaf) => self.visit_op(tree, id, leaf, ctx),
            NodeKind::Tile(tile) => self.visit_tile(tree, id, tile, ctx),
            NodeKind::Scope => self.visit_scope(tree, id, ctx),
        }
    }
}
