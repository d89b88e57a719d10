//! Second solve pass: trip counts and data-movement cost.
//!
//! Seeded with a trip count of one at the root, every tile node multiplies
//! each live buffer's per-dim trip count by its own tile variable (when the
//! buffer depends on that loop) and by the count inherited from the parent's
//! matching dim. The bytes moved for a create-loop position are the buffer
//! size there times the number of times that position is entered.

use crate::error::{ScheduleError, ScheduleResult};
use crate::schedule::info::SolveMemo;
use crate::solver::{ConstraintModel, ExprId};
use crate::tree::{NodeId, OpLeaf, TileNode, TileTree, TreeVisitor};

/// Context of the write pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteContext {
    /// Parent tile node; `None` at the root
    pub parent: Option<NodeId>,
}

/// Trip-count and write-cost pass over an initialized memo.
pub struct WritePropagation<'a> {
    model: &'a mut dyn ConstraintModel,
    memo: &'a mut SolveMemo,
}

impl<'a> WritePropagation<'a> {
    pub fn new(model: &'a mut dyn ConstraintModel, memo: &'a mut SolveMemo) -> Self {
        Self { model, memo }
    }

    pub fn run(&mut self, tree: &TileTree) -> ScheduleResult<()> {
        self.visit(tree, tree.root(), &WriteContext::default())
    }

    fn visit_children(&mut self, tree: &TileTree, id: NodeId, ctx: &WriteContext) -> ScheduleResult<()> {
        for &child in tree.children(id) {
            self.visit(tree, child, ctx)?;
        }
        Ok(())
    }
}

impl TreeVisitor for WritePropagation<'_> {
    type Context = WriteContext;
    type Output = ();

    fn visit_op(&mut self, _: &TileTree, _: NodeId, _: &OpLeaf, _: &WriteContext) -> ScheduleResult<()> {
        Ok(())
    }

    /// Fills trips and write volume for every buffer at a tile node.
    ///
    /// The write volume at a position is `size * trips`, with `trips` the
    /// product of the entered loops' counts. Counting per dim instead
    /// (`size[i] * trips[i]`, multiplied over `i`) gives the same total,
    /// since a buffer's size is the product of its per-dim extents.
    fn visit_tile(
        &mut self,
        tree: &TileTree,
        id: NodeId,
        tile: &TileNode,
        ctx: &WriteContext,
    ) -> ScheduleResult<()> {
        let domain = self
            .memo
            .domain(id)
            .cloned()
            .ok_or_else(|| ScheduleError::InvalidGraph(format!("tile {} has no tile variables", id)))?;
        let rank = tile.rank();
        let one = self.model.constant(1);

        let Some(info) = self.memo.tile(id) else {
            return Err(ScheduleError::InvalidGraph(format!("tile {} was never initialized", id)));
        };
        let buffer_ids: Vec<_> = info.buffers.iter().map(|b| b.id).collect();

        for bid in buffer_ids {
            // inherited per-dim trips, one entry per dim of this node
            let inherited: Vec<ExprId> = match ctx.parent {
                None => vec![one; rank],
                Some(parent) => {
                    let parent_buffer = self
                        .memo
                        .tile(parent)
                        .and_then(|p| p.buffer(bid))
                        .ok_or(ScheduleError::UnresolvedBuffer(bid))?;
                    (0..rank)
                        .map(|k| {
                            domain
                                .dims_map
                                .get(&k)
                                .and_then(|&p| parent_buffer.dim_trips.get(p))
                                .copied()
                                .unwrap_or(one)
                        })
                        .collect()
                }
            };

            let info = self
                .memo
                .tile(id)
                .and_then(|t| t.buffer(bid))
                .ok_or(ScheduleError::UnresolvedBuffer(bid))?;
            let mask = info.mask;
            let positions: Vec<usize> = info.positions().collect();
            let sizes = info.sizes.clone();

            let mut dim_trips = Vec::with_capacity(rank);
            for k in 0..rank {
                let own = if mask.is_related(k) { domain.tile_vars[k] } else { one };
                dim_trips.push(self.model.mul(own, inherited[k]));
            }

            let inherited_total = self.model.product(&inherited);
            let mut trips = Vec::with_capacity(positions.len());
            let mut writes = Vec::with_capacity(positions.len());
            for (slot, &pos) in positions.iter().enumerate() {
                let mut factors: Vec<ExprId> = (0..pos)
                    .filter(|&k| mask.is_related(k))
                    .map(|k| domain.tile_vars[k])
                    .collect();
                factors.push(inherited_total);
                let trip = self.model.product(&factors);
                writes.push(self.model.mul(sizes[slot], trip));
                trips.push(trip);
            }

            let entry = self
                .memo
                .tile_mut(id)
                .and_then(|t| t.buffer_mut(bid))
                .ok_or(ScheduleError::UnresolvedBuffer(bid))?;
            entry.dim_trips = dim_trips;
            entry.trips = trips;
            entry.writes = writes;
        }

        self.visit_children(tree, id, &WriteContext { parent: Some(id) })
    }

    fn visit_scope(&mut self, tree: &TileTree, id: NodeId, ctx: &WriteContext) -> ScheduleResult<()> {
        self.visit_children(tree, id, ctx)
    }
}
