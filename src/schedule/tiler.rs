//! Tree solve driver.
//!
//! Builds one constraint model per tile tree (initializer pass, write pass,
//! capacity constraints, data-movement objective), minimizes it, and reads
//! tile sizes and buffer placements back out of the solution.

use crate::buffer::LiveBuffer;
use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::DataflowGraph;
use crate::schedule::info::{BufferId, Lifetime, SolveMemo, TileNodeInfo};
use crate::schedule::initializer::{check_levels, TreeInitializer};
use crate::schedule::writes::WritePropagation;
use crate::solver::{new_model, ConstraintModel, ExprId, SearchBudget, Solution, SolveStatus};
use crate::target::TargetOptions;
use crate::tree::{NodeId, NodeKind, OpLeaf, TileTree};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Placement flags of a solved buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementFlags {
    /// Held at the outermost memory level
    pub materialized: bool,
    /// Shares its entry with a def-use partner
    pub aliased: bool,
    /// Placed at the tree root
    pub root: bool,
}

/// Where one buffer lives at one tile node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferPlacement {
    pub node: NodeId,
    pub buffer: BufferId,
    pub aliases: Vec<BufferId>,
    /// Memory level index, 0 innermost
    pub level: usize,
    /// Loop position the buffer is created in
    pub create_loop: usize,
    pub size_bytes: i64,
    /// Bytes moved into `level` over the whole run
    pub write_bytes: i64,
    pub lifetime: Lifetime,
    pub flags: PlacementFlags,
}

/// Chosen sizes of one tileable node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSizes {
    pub node: NodeId,
    /// Trip count per dim at this node
    pub tile_vars: Vec<i64>,
    /// Full extent per dim
    pub extents: Vec<i64>,
}

/// A solved tile tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolvedTree {
    pub tree: TileTree,
    pub sizes: Vec<NodeSizes>,
    pub placements: Vec<BufferPlacement>,
    pub objective: i64,
    pub status: SolveStatus,
    pub num_vars: usize,
    pub num_constraints: usize,
    pub search_nodes: u64,
}

impl SolvedTree {
    pub fn is_optimal(&self) -> bool {
        self.status.is_optimal()
    }

    /// Placement of `buffer` (or any alias of it) at `node`.
    pub fn placement(&self, node: NodeId, buffer: BufferId) -> Option<&BufferPlacement> {
        self.placements
            .iter()
            .find(|p| p.node == node && p.aliases.contains(&buffer))
    }

    /// Placements made at the tree root.
    pub fn root_placements(&self) -> impl Iterator<Item = &BufferPlacement> {
        self.placements.iter().filter(|p| p.flags.root)
    }

    /// Chosen sizes of `node`.
    pub fn node_sizes(&self, node: NodeId) -> Option<&NodeSizes> {
        self.sizes.iter().find(|s| s.node == node)
    }

    /// Buffers held at the outermost memory level, one per identity, for the
    /// persistent buffer scheduler.
    pub fn ddr_buffers(&self) -> Vec<LiveBuffer> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for p in self.placements.iter().filter(|p| p.flags.materialized) {
            if seen.insert(p.buffer) {
                out.push(LiveBuffer::new(
                    &p.buffer.to_string(),
                    p.size_bytes.max(0) as u64,
                    p.lifetime,
                ));
            }
        }
        out
    }
}

/// Solves single tile trees.
pub struct TreeTiler<'a> {
    dataflow: &'a DataflowGraph,
    target: &'a TargetOptions,
    budget: SearchBudget,
}

impl<'a> TreeTiler<'a> {
    pub fn new(dataflow: &'a DataflowGraph, target: &'a TargetOptions) -> Self {
        Self {
            dataflow,
            target,
            budget: SearchBudget::default(),
        }
    }

    /// Set the solver budget.
    pub fn with_budget(mut self, budget: SearchBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Solve `tree`.
    pub fn solve(&self, tree: &TileTree) -> ScheduleResult<SolvedTree> {
        check_levels(tree)?;
        match tree.kind(tree.root()) {
            NodeKind::Op(leaf) => self.solve_single_op(tree, leaf),
            _ => self.solve_tiled(tree),
        }
    }

    fn outer_level(&self) -> usize {
        self.target.levels.len().saturating_sub(1)
    }

    /// A bare op: every buffer whole at the outermost level.
    fn solve_single_op(&self, tree: &TileTree, leaf: &OpLeaf) -> ScheduleResult<SolvedTree> {
        let op = self.dataflow.op(leaf.op)?;
        let mut model = new_model(self.budget.backend);
        let total: i64 = (0..op.num_buffers()).map(|i| op.buffer_bytes(i)).sum();
        let objective = model.constant(total);
        let solution = model.minimize(objective, &self.budget)?;

        let placements = (0..op.num_buffers())
            .map(|index| {
                let bid = BufferId::new(op.id, index);
                BufferPlacement {
                    node: tree.root(),
                    buffer: bid,
                    aliases: vec![bid],
                    level: self.outer_level(),
                    create_loop: 0,
                    size_bytes: op.buffer_bytes(index),
                    write_bytes: op.buffer_bytes(index),
                    lifetime: Lifetime::new(0, 1),
                    flags: PlacementFlags {
                        materialized: true,
                        aliased: false,
                        root: true,
                    },
                }
            })
            .collect();
        Ok(SolvedTree {
            tree: tree.clone(),
            sizes: vec![NodeSizes {
                node: tree.root(),
                tile_vars: vec![1; op.rank()],
                extents: op.domain_bounds.clone(),
            }],
            placements,
            objective: solution.objective,
            status: solution.status,
            num_vars: model.num_vars(),
            num_constraints: model.num_constraints(),
            search_nodes: solution.nodes,
        })
    }

    fn solve_tiled(&self, tree: &TileTree) -> ScheduleResult<SolvedTree> {
        let mut model = new_model(self.budget.backend);
        let mut memo = {
            let mut init = TreeInitializer::new(model.as_mut(), self.dataflow, self.target, tree);
            init.run(tree)?;
            init.into_memo()
        };
        WritePropagation::new(model.as_mut(), &mut memo).run(tree)?;
        self.post_capacity(model.as_mut(), tree, &memo);
        let objective = self.objective(model.as_mut(), tree, &memo);

        let solution = model.minimize(objective, &self.budget)?;
        if !solution.status.is_optimal() {
            debug!(
                "solver budget exhausted after {} nodes, keeping objective {}",
                solution.nodes, solution.objective
            );
        }
        self.extract(tree, &memo, model.as_ref(), &solution)
    }

    /// Placed bytes of overlapping buffers, including those held by
    /// enclosing tile nodes, fit every bounded sub-level.
    fn post_capacity(&self, model: &mut dyn ConstraintModel, tree: &TileTree, memo: &SolveMemo) {
        for (id, info) in memo.tile_nodes() {
            let level = tree.level(id);
            let ancestors: Vec<&TileNodeInfo> = std::iter::successors(tree.parent(id), |&p| tree.parent(p))
                .filter_map(|p| memo.tile(p))
                .collect();
            let mut posted: HashSet<(usize, Vec<usize>, Vec<(usize, usize)>)> = HashSet::new();
            for b in &info.buffers {
                let overlapping: Vec<usize> = info
                    .buffers
                    .iter()
                    .enumerate()
                    .filter(|(_, o)| o.lifetime.overlaps(&b.lifetime))
                    .map(|(i, _)| i)
                    .collect();
                // Outer buffers live across the whole child loop nest
                let outer: Vec<(usize, usize)> = ancestors
                    .iter()
                    .enumerate()
                    .flat_map(|(a, anc)| {
                        anc.buffers
                            .iter()
                            .enumerate()
                            .filter(|(_, o)| o.lifetime.overlaps(&b.lifetime))
                            .map(move |(i, _)| (a, i))
                    })
                    .collect();
                for sl in 0..level {
                    let Some(capacity) = self.target.capacity(sl) else {
                        continue;
                    };
                    if !posted.insert((sl, overlapping.clone(), outer.clone())) {
                        continue;
                    }
                    let mut terms = Vec::new();
                    let held = overlapping
                        .iter()
                        .map(|&i| &info.buffers[i])
                        .chain(outer.iter().map(|&(a, i)| &ancestors[a].buffers[i]));
                    for other in held {
                        for (slot, pos) in other.positions().enumerate() {
                            let place = other.places_at(pos)[sl];
                            terms.push(model.mul(place, other.sizes[slot]));
                        }
                    }
                    let used = model.sum(&terms);
                    let cap = model.constant(capacity.min(i64::MAX as u64) as i64);
                    model.add_less_equal(used, cap);
                }
            }
        }
    }

    /// Total bytes moved, weighted by the transfer cost of each level.
    fn objective(&self, model: &mut dyn ConstraintModel, tree: &TileTree, memo: &SolveMemo) -> ExprId {
        let mut terms = Vec::new();
        for (_, info) in memo.tile_nodes() {
            for b in &info.buffers {
                for (slot, pos) in b.positions().enumerate() {
                    for (sl, &place) in b.places_at(pos).iter().enumerate() {
                        let moved = model.mul(place, b.writes[slot]);
                        terms.push((self.target.transfer_cost(sl), moved));
                    }
                }
            }
        }
        debug!(
            "tree with {} nodes: {} objective terms",
            tree.len(),
            terms.len()
        );
        model.linear(&terms, 0)
    }

    fn extract(
        &self,
        tree: &TileTree,
        memo: &SolveMemo,
        model: &dyn ConstraintModel,
        solution: &Solution,
    ) -> ScheduleResult<SolvedTree> {
        let mut sizes = Vec::new();
        for id in tree.preorder(tree.root()) {
            let Some(domain) = memo.domain(id) else {
                continue;
            };
            let extents: Vec<ExprId> = match (memo.tile(id), memo.op(id)) {
                (Some(t), _) => t.full_extents().to_vec(),
                (None, Some(o)) => o.extents.clone(),
                (None, None) => Vec::new(),
            };
            sizes.push(NodeSizes {
                node: id,
                tile_vars: domain.tile_vars.iter().map(|&e| solution.value(e)).collect(),
                extents: extents.iter().map(|&e| solution.value(e)).collect(),
            });
        }

        let outer = self.outer_level();
        let mut placements = Vec::new();
        for (id, info) in memo.tile_nodes() {
            for b in &info.buffers {
                let chosen = b
                    .all_places()
                    .into_iter()
                    .find(|&(_, _, e)| solution.is_set(e))
                    .ok_or(ScheduleError::UnresolvedBuffer(b.id))?;
                let (pos, sl, _) = chosen;
                let slot = pos - b.first_pos;
                placements.push(BufferPlacement {
                    node: id,
                    buffer: b.id,
                    aliases: b.aliases.clone(),
                    level: sl,
                    create_loop: pos,
                    size_bytes: solution.value(b.sizes[slot]),
                    write_bytes: solution.value(b.writes[slot]),
                    lifetime: b.lifetime,
                    flags: PlacementFlags {
                        materialized: sl == outer,
                        aliased: b.aliases.len() > 1,
                        root: tree.parent(id).is_none(),
                    },
                });
            }
        }

        Ok(SolvedTree {
            tree: tree.clone(),
            sizes,
            placements,
            objective: solution.objective,
            status: solution.status,
            num_vars: model.num_vars(),
            num_constraints: model.num_constraints(),
            search_nodes: solution.nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::AffineMap;
    use crate::graph::{KernelKind, OpId, OpNode};
    use crate::target::MemoryLevel;
    use crate::tree::TileNode;

    fn chain_tree(op: OpId, bounds: &[i64], top: usize) -> TileTree {
        let rank = bounds.len();
        let mut tree = TileTree::new(NodeKind::Tile(TileNode {
            level: top,
            op,
            relation: AffineMap::identity(rank),
            bounds: bounds.to_vec(),
        }));
        let mut parent = tree.root();
        for level in (1..top).rev() {
            parent = tree.add_child(
                parent,
                NodeKind::Tile(TileNode {
                    level,
                    op,
                    relation: AffineMap::identity(rank),
                    bounds: bounds.to_vec(),
                }),
            );
        }
        tree.add_child(
            parent,
            NodeKind::Op(OpLeaf {
                op,
                relation: AffineMap::identity(rank),
                bounds: bounds.to_vec(),
            }),
        );
        tree
    }

    #[test]
    fn test_solve_single_chain() {
        let mut graph = DataflowGraph::new("g");
        let op = graph.add_elementwise("relu", &[16, 16], &[None]);
        let target = TargetOptions::default().with_levels(vec![
            MemoryLevel::new("L1", Some(4096), 1),
            MemoryLevel::new("DDR", None, 4),
        ]);
        let tree = chain_tree(op, &[16, 16], 2);
        let solved = TreeTiler::new(&graph, &target).solve(&tree).unwrap();

        assert!(solved.objective > 0);
        // 2 buffers at each of the 2 tile nodes
        assert_eq!(solved.placements.len(), 4);
        let root_sizes = solved.node_sizes(tree.root()).unwrap();
        assert_eq!(root_sizes.extents, vec![16, 16]);
        // each tensor is 1 KiB; both fit in L1 at the root so nothing pays DDR cost
        for p in solved.root_placements() {
            assert_eq!(p.level, 0);
            assert!(p.size_bytes <= 4096);
        }
        assert_eq!(solved.objective, 4 * 1024);
    }

    #[test]
    fn test_capacity_pushes_buffers_outward() {
        let mut graph = DataflowGraph::new("g");
        let op = graph.add(
            OpNode::new("copy", vec![64], KernelKind::Other).read(AffineMap::identity(1), 4, None),
        );
        // each buffer is 256 bytes; L1 holds only one whole buffer
        let target = TargetOptions::default().with_levels(vec![
            MemoryLevel::new("L1", Some(300), 1),
            MemoryLevel::new("DDR", None, 4),
        ]);
        let tree = chain_tree(op, &[64], 2);
        let solved = TreeTiler::new(&graph, &target).solve(&tree).unwrap();
        for node in [tree.root(), tree.children(tree.root())[0]] {
            let l1: i64 = solved
                .placements
                .iter()
                .filter(|p| p.node == node && p.level == 0)
                .map(|p| p.size_bytes)
                .sum();
            assert!(l1 <= 300, "L1 overcommitted at {}: {}", node, l1);
        }
    }

    #[test]
    fn test_outer_placements_count_against_inner_capacity() {
        let mut graph = DataflowGraph::new("g");
        let op = graph.add(
            OpNode::new("copy", vec![64], KernelKind::Other).read(AffineMap::identity(1), 4, None),
        );
        // the inner node alone needs 8 bytes of L1
        let target = TargetOptions::default().with_levels(vec![
            MemoryLevel::new("L1", Some(12), 1),
            MemoryLevel::new("DDR", None, 4),
        ]);
        let tree = chain_tree(op, &[64], 2);
        let solved = TreeTiler::new(&graph, &target).solve(&tree).unwrap();
        let l1_at = |node: NodeId| -> i64 {
            solved
                .placements
                .iter()
                .filter(|p| p.node == node && p.level == 0)
                .map(|p| p.size_bytes)
                .sum()
        };
        let child = tree.children(tree.root())[0];
        assert!(l1_at(child) >= 8);
        assert!(
            l1_at(tree.root()) + l1_at(child) <= 12,
            "root {} + child {}",
            l1_at(tree.root()),
            l1_at(child)
        );
        assert!(solved.root_placements().any(|p| p.level == 1));
    }

    #[test]
    fn test_branch_and_bound_backend_matches_default() {
        let mut graph = DataflowGraph::new("g");
        let op = graph.add_elementwise("relu", &[16, 16], &[None]);
        let target = TargetOptions::default().with_levels(vec![
            MemoryLevel::new("L1", Some(4096), 1),
            MemoryLevel::new("DDR", None, 4),
        ]);
        let tree = chain_tree(op, &[16, 16], 2);
        let default = TreeTiler::new(&graph, &target).solve(&tree).unwrap();
        let budget = SearchBudget::default().with_backend(crate::solver::SolverBackend::BranchAndBound);
        let bnb = TreeTiler::new(&graph, &target).with_budget(budget).solve(&tree).unwrap();
        assert_eq!(default.objective, bnb.objective);
        assert_eq!(default.num_vars, bnb.num_vars);
        assert!(bnb.search_nodes > 0);
    }

    #[test]
    fn test_single_op_root() {
        let mut graph = DataflowGraph::new("g");
        let op = graph.add(OpNode::new("fill", vec![8, 8], KernelKind::Other));
        let target = TargetOptions::default();
        let tree = TileTree::single_op(op, vec![8, 8]);
        let solved = TreeTiler::new(&graph, &target).solve(&tree).unwrap();
        assert_eq!(solved.placements.len(), 1);
        let p = &solved.placements[0];
        assert_eq!(p.level, 2);
        assert_eq!(p.size_bytes, 8 * 8 * 4);
        assert!(p.flags.root && p.flags.materialized);
        assert_eq!(solved.objective, 256);
        assert!(solved.is_optimal());
        assert_eq!(solved.ddr_buffers().len(), 1);
    }

    #[test]
    fn test_infeasible_kernel_domain() {
        let mut graph = DataflowGraph::new("g");
        let op = graph.add_elementwise("odd", &[7], &[None]);
        let target = TargetOptions::default().with_kernel_override(
            "odd",
            crate::target::KernelOverride {
                primitives: None,
                multipliers: Some(vec![(2, 2)]),
            },
        );
        let tree = chain_tree(op, &[7], 3);
        let err = TreeTiler::new(&graph, &target).solve(&tree).unwrap_err();
        assert!(err.is_recoverable());
    }
}
