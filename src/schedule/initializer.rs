//! First solve pass: decision variables and buffer structures.
//!
//! A single top-down walk creates the tile variables of every tileable node,
//! accumulates forward extents on the way down and backward extents on the
//! way up, and returns the live buffers of each subtree to its parent. Tile
//! nodes resolve def-use aliasing before creating placement booleans.

use crate::affine::AffineMap;
use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::DataflowGraph;
use crate::schedule::info::{
    BufferId, DomainInfo, Lifetime, OpNodeInfo, SolveMemo, TileNodeBufferInfo, TileNodeInfo,
};
use crate::solver::{divisors, ConstraintModel, ExprId};
use crate::target::TargetOptions;
use crate::tree::{NodeId, NodeKind, OpLeaf, TileNode, TileTree, TreeVisitor};
use log::trace;
use std::collections::{BTreeMap, HashMap};

/// What a parent hands to a child.
#[derive(Debug, Clone, Default)]
pub struct InitContext {
    /// Parent tileable node; `None` at a tree root
    pub parent: Option<NodeId>,
    /// Parent's forward extents
    pub forward_extents: Vec<ExprId>,
}

/// A live buffer reported to the parent.
#[derive(Debug, Clone)]
pub struct BufferResult {
    pub bid: BufferId,
    pub aliases: Vec<BufferId>,
    pub lifetime: Lifetime,
    /// Child domain -> buffer
    pub access_map: AffineMap,
    pub elem_bytes: i64,
}

/// What a child reports to its parent.
#[derive(Debug, Clone, Default)]
pub struct InitResult {
    pub buffers: Vec<BufferResult>,
    /// Full extent of every domain dim of the child
    pub extents: Vec<ExprId>,
}

/// Variable-creating pass over one tile tree.
pub struct TreeInitializer<'a> {
    model: &'a mut dyn ConstraintModel,
    dataflow: &'a DataflowGraph,
    target: &'a TargetOptions,
    memo: SolveMemo,
    results: Vec<Option<InitResult>>,
    timestamp: usize,
}

impl<'a> TreeInitializer<'a> {
    pub fn new(
        model: &'a mut dyn ConstraintModel,
        dataflow: &'a DataflowGraph,
        target: &'a TargetOptions,
        tree: &TileTree,
    ) -> Self {
        Self {
            model,
            dataflow,
            target,
            memo: SolveMemo::with_capacity(tree.len()),
            results: vec![None; tree.len()],
            timestamp: 0,
        }
    }

    /// Run the pass from the tree root.
    pub fn run(&mut self, tree: &TileTree) -> ScheduleResult<InitResult> {
        self.visit(tree, tree.root(), &InitContext::default())
    }

    pub fn memo(&self) -> &SolveMemo {
        &self.memo
    }

    pub fn into_memo(self) -> SolveMemo {
        self.memo
    }

    /// Create (once) the tile variables of a tileable node.
    fn domain_info(
        &mut self,
        id: NodeId,
        relation: &AffineMap,
        var_domains: Vec<Vec<i64>>,
        ctx: &InitContext,
    ) -> ScheduleResult<DomainInfo> {
        if let Some(info) = self.memo.domain(id) {
            return Ok(info.clone());
        }
        let mut tile_vars = Vec::with_capacity(var_domains.len());
        for (d, domain) in var_domains.iter().enumerate() {
            if domain.is_empty() {
                return Err(ScheduleError::Infeasible(format!(
                    "{} dim {} has no legal tile count",
                    id, d
                )));
            }
            tile_vars.push(self.model.new_int(&format!("tv_{}_{}", id, d), domain)?);
        }

        // the root has no parent dims to remap
        let dims_map = match ctx.parent {
            Some(_) => relation.dims_map(),
            None => BTreeMap::new(),
        };
        let forward_extents = tile_vars
            .iter()
            .enumerate()
            .map(|(d, &tv)| match dims_map.get(&d).and_then(|&p| ctx.forward_extents.get(p)) {
                Some(&parent) => self.model.mul(tv, parent),
                None => tv,
            })
            .collect();

        let info = DomainInfo {
            tile_vars,
            forward_extents,
            dims_map,
        };
        self.memo.domains[id.index()] = Some(info.clone());
        Ok(info)
    }

    fn next_timestamp(&mut self) -> usize {
        let t = self.timestamp;
        self.timestamp += 2;
        t
    }

    /// Shapes and byte sizes of `map` over `extents`.
    fn shape_and_size(
        &mut self,
        map: &AffineMap,
        extents: &[ExprId],
        elem_bytes: i64,
    ) -> ScheduleResult<(Vec<ExprId>, ExprId)> {
        let shape = map.extents_to_model(self.model, extents)?;
        let elems = self.model.product(&shape);
        let size = self.model.scale(elems, elem_bytes);
        Ok((shape, size))
    }

    /// Resolve the extent each dim of `tile` takes from its children and
    /// post the sibling consistency constraints.
    fn child_extents(
        &mut self,
        tree: &TileTree,
        id: NodeId,
        tile: &TileNode,
        children: &[(NodeId, InitResult)],
    ) -> ScheduleResult<Vec<ExprId>> {
        let mut found: Vec<Option<ExprId>> = vec![None; tile.rank()];
        for (child, result) in children {
            let relation = tree.relation(*child).ok_or_else(|| {
                ScheduleError::InvalidGraph(format!("scope {} under tile {}", child, id))
            })?;
            for (k, range) in relation.results.iter().enumerate() {
                let Some(&ext) = result.extents.get(k) else {
                    continue;
                };
                if let Some(j) = range.as_pure_dim() {
                    match found.get(j).copied().flatten() {
                        Some(prev) => self.model.add_equal(prev, ext),
                        None if j < found.len() => found[j] = Some(ext),
                        None => {}
                    }
                } else if let Some((_, extent)) = range.as_constant() {
                    let pinned = self.model.constant(extent);
                    self.model.add_equal(ext, pinned);
                }
            }
        }
        found
            .into_iter()
            .enumerate()
            .map(|(dim, e)| e.ok_or(ScheduleError::UnresolvedDimension { node: id.index(), dim }))
            .collect()
    }

    /// Merge def-use pairs among the child buffers.
    fn resolve_def_use(
        &self,
        buffers: Vec<BufferResult>,
    ) -> ScheduleResult<(Vec<BufferResult>, BTreeMap<BufferId, BufferId>)> {
        let mut def_use = BTreeMap::new();
        let present: HashMap<BufferId, usize> = buffers
            .iter()
            .enumerate()
            .flat_map(|(i, b)| b.aliases.iter().map(move |&a| (a, i)))
            .collect();
        for b in &buffers {
            let op = self.dataflow.op(b.bid.op)?;
            let Some(read) = op.reads.get(b.bid.index) else {
                continue;
            };
            let Some(producer) = read.producer else {
                continue;
            };
            let source = BufferId::new(producer, self.dataflow.op(producer)?.output_index());
            if present.contains_key(&source) {
                def_use.insert(b.bid, source);
            }
        }

        let mut merged: Vec<BufferResult> = Vec::with_capacity(buffers.len());
        let mut slots: HashMap<BufferId, usize> = HashMap::new();
        let (sinks, sources): (Vec<BufferResult>, Vec<BufferResult>) =
            buffers.into_iter().partition(|b| def_use.contains_key(&b.bid));
        for b in sources {
            for &a in &b.aliases {
                slots.insert(a, merged.len());
            }
            merged.push(b);
        }
        for sink in sinks {
            let source = def_use[&sink.bid];
            let slot = *slots
                .get(&source)
                .ok_or(ScheduleError::UnresolvedBuffer(source))?;
            let entry = &mut merged[slot];
            entry.lifetime = entry.lifetime.union(&sink.lifetime);
            entry.access_map = sink.access_map;
            entry.aliases.extend(sink.aliases);
        }
        Ok((merged, def_use))
    }
}

impl TreeVisitor for TreeInitializer<'_> {
    type Context = InitContext;
    type Output = InitResult;

    fn visit_op(
        &mut self,
        _tree: &TileTree,
        id: NodeId,
        leaf: &OpLeaf,
        ctx: &InitContext,
    ) -> ScheduleResult<InitResult> {
        if let Some(result) = &self.results[id.index()] {
            return Ok(result.clone());
        }
        let dataflow = self.dataflow;
        let op = dataflow.op(leaf.op)?;
        let kernel = self.target.kernel_info(op);
        let var_domains = op
            .domain_bounds
            .iter()
            .enumerate()
            .map(|(d, &b)| kernel.op_tile_domain(d, b))
            .collect();
        let domain = self.domain_info(id, &leaf.relation, var_domains, ctx)?;

        let mut extents = Vec::with_capacity(op.rank());
        for (d, &bound) in op.domain_bounds.iter().enumerate() {
            let primitive = kernel.primitive(d);
            let absolute = self.model.scale(domain.forward_extents[d], primitive);
            let expected = self.model.constant(bound);
            self.model.add_equal(absolute, expected);
            extents.push(self.model.scale(domain.tile_vars[d], primitive));
        }

        let t = self.next_timestamp();
        let mut access_maps = Vec::with_capacity(op.num_buffers());
        let mut shapes = Vec::with_capacity(op.num_buffers());
        let mut sizes = Vec::with_capacity(op.num_buffers());
        let mut buffers = Vec::with_capacity(op.num_buffers());
        for index in 0..op.num_buffers() {
            let map = op
                .buffer_map(index)
                .cloned()
                .ok_or(ScheduleError::UnresolvedBuffer(BufferId::new(op.id, index)))?;
            let (shape, size) = self.shape_and_size(&map, &extents, op.elem_bytes(index))?;
            let bid = BufferId::new(op.id, index);
            buffers.push(BufferResult {
                bid,
                aliases: vec![bid],
                lifetime: Lifetime::new(t, t + 1),
                access_map: map.clone(),
                elem_bytes: op.elem_bytes(index),
            });
            access_maps.push(map);
            shapes.push(shape);
            sizes.push(size);
        }
        trace!("op leaf {} ({}) at t={}", id, op.name, t);

        self.memo.ops[id.index()] = Some(OpNodeInfo {
            op: op.id,
            kernel,
            extents: extents.clone(),
            access_maps,
            shapes,
            sizes,
        });
        let result = InitResult { buffers, extents };
        self.results[id.index()] = Some(result.clone());
        Ok(result)
    }

    fn visit_tile(
        &mut self,
        tree: &TileTree,
        id: NodeId,
        tile: &TileNode,
        ctx: &InitContext,
    ) -> ScheduleResult<InitResult> {
        if let Some(result) = &self.results[id.index()] {
            return Ok(result.clone());
        }
        let var_domains = tile.bounds.iter().map(|&b| divisors(b)).collect();
        let domain = self.domain_info(id, &tile.relation, var_domains, ctx)?;

        let child_ctx = InitContext {
            parent: Some(id),
            forward_extents: domain.forward_extents.clone(),
        };
        let mut children = Vec::with_capacity(tree.children(id).len());
        for &child in tree.children(id) {
            let result = self.visit(tree, child, &child_ctx)?;
            children.push((child, result));
        }

        let inner = self.child_extents(tree, id, tile, &children)?;
        let rank = tile.rank();
        let mut backward = Vec::with_capacity(rank + 1);
        for pos in 0..=rank {
            let mut row = Vec::with_capacity(rank);
            for (j, &child_ext) in inner.iter().enumerate() {
                if j < pos {
                    row.push(child_ext);
                } else {
                    row.push(self.model.mul(domain.tile_vars[j], child_ext));
                }
            }
            backward.push(row);
        }
        if ctx.parent.is_none() {
            for (j, &bound) in tile.bounds.iter().enumerate() {
                let expected = self.model.constant(bound);
                self.model.add_equal(backward[0][j], expected);
            }
        }

        // lift child buffers into this node's domain
        let mut lifted = Vec::new();
        for (child, result) in children {
            let relation = tree.relation(child).cloned().ok_or_else(|| {
                ScheduleError::InvalidGraph(format!("scope {} under tile {}", child, id))
            })?;
            for mut b in result.buffers {
                b.access_map = relation.compose(&b.access_map)?;
                lifted.push(b);
            }
        }
        let (buffers, def_use) = self.resolve_def_use(lifted)?;

        let is_root = ctx.parent.is_none() && tile.level == self.target.top_level();
        let first_pos = if is_root { 0 } else { 1 };
        let mut info = TileNodeInfo::new(def_use, backward);
        for b in &buffers {
            let mut places = Vec::with_capacity(rank + 1 - first_pos);
            let mut shapes = Vec::with_capacity(rank + 1 - first_pos);
            let mut sizes = Vec::with_capacity(rank + 1 - first_pos);
            let mut all = Vec::new();
            for pos in first_pos..=rank {
                let row: Vec<ExprId> = (0..tile.level)
                    .map(|sl| self.model.new_bool(&format!("place_{}_{}_{}_{}", id, b.bid, pos, sl)))
                    .collect();
                all.extend(row.iter().copied());
                places.push(row);
                let extents = info.backward_extents[pos].clone();
                let (shape, size) = self.shape_and_size(&b.access_map, &extents, b.elem_bytes)?;
                shapes.push(shape);
                sizes.push(size);
            }
            self.model.add_exactly_one(&all)?;
            info.push(TileNodeBufferInfo {
                id: b.bid,
                aliases: b.aliases.clone(),
                lifetime: b.lifetime,
                access_map: b.access_map.clone(),
                elem_bytes: b.elem_bytes,
                mask: b.access_map.buffer_mask(),
                places,
                first_pos,
                shapes,
                sizes,
                dim_trips: Vec::new(),
                trips: Vec::new(),
                writes: Vec::new(),
            });
        }
        trace!(
            "tile {} level {}: {} buffers, {} aliased",
            id,
            tile.level,
            info.buffers.len(),
            info.def_use.len()
        );
        let extents = info.full_extents().to_vec();
        self.memo.tiles[id.index()] = Some(info);

        let result = InitResult { buffers, extents };
        self.results[id.index()] = Some(result.clone());
        Ok(result)
    }

    fn visit_scope(&mut self, tree: &TileTree, id: NodeId, ctx: &InitContext) -> ScheduleResult<InitResult> {
        let mut out = InitResult::default();
        for &child in tree.children(id) {
            let result = self.visit(tree, child, ctx)?;
            out.buffers.extend(result.buffers);
        }
        Ok(out)
    }
}

/// Tile tree shape check used before building a model.
pub fn check_levels(tree: &TileTree) -> ScheduleResult<()> {
    for id in tree.preorder(tree.root()) {
        if let NodeKind::Tile(t) = tree.kind(id) {
            if t.level == 0 {
                return Err(ScheduleError::InvalidGraph(format!("tile {} at level 0", id)));
            }
            for &c in tree.children(id) {
                if tree.level(c) >= t.level {
                    return Err(ScheduleError::InvalidGraph(format!(
                        "child {} of tile {} is not below level {}",
                        c, id, t.level
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DataflowGraph, OpId};
    use crate::solver::SearchModel;
    use crate::tree::{OpLeaf, TileNode};

    fn two_level_tree(bounds: Vec<i64>) -> TileTree {
        let rank = bounds.len();
        let mut tree = TileTree::new(NodeKind::Tile(TileNode {
            level: 2,
            op: OpId(0),
            relation: AffineMap::identity(rank),
            bounds: bounds.clone(),
        }));
        let t1 = tree.add_child(
            tree.root(),
            NodeKind::Tile(TileNode {
                level: 1,
                op: OpId(0),
                relation: AffineMap::identity(rank),
                bounds: bounds.clone(),
            }),
        );
        tree.add_child(
            t1,
            NodeKind::Op(OpLeaf {
                op: OpId(0),
                relation: AffineMap::identity(rank),
                bounds,
            }),
        );
        tree
    }

    fn target_two_levels() -> TargetOptions {
        use crate::target::MemoryLevel;
        TargetOptions::default().with_levels(vec![
            MemoryLevel::new("L1", Some(1024), 1),
            MemoryLevel::new("DDR", None, 4),
        ])
    }

    #[test]
    fn test_backward_extent_slices() {
        // 2-level, 2-dim tree: T2 -> T1 -> op over [8, 4]
        let mut graph = DataflowGraph::new("g");
        graph.add(crate::graph::OpNode::new("copy", vec![8, 4], crate::graph::KernelKind::Other)
            .read(AffineMap::identity(2), 4, None));
        let tree = two_level_tree(vec![8, 4]);
        let target = target_two_levels();
        let mut model = SearchModel::new();
        let mut init = TreeInitializer::new(&mut model, &graph, &target, &tree);
        init.run(&tree).unwrap();
        let memo = init.into_memo();

        let root = tree.root();
        let t1 = tree.children(root)[0];
        let leaf = tree.children(t1)[0];
        let tv2 = memo.domain(root).unwrap().tile_vars.clone();
        let tv1 = memo.domain(t1).unwrap().tile_vars.clone();
        let op_ext = memo.op(leaf).unwrap().extents.clone();
        let t1_info = memo.tile(t1).unwrap();
        let t2_info = memo.tile(root).unwrap();

        // evaluate a concrete assignment: tv2 = (2, 1), tv1 = (2, 2), op = (2, 2)
        let assignment = [(tv2[0], 2), (tv2[1], 1), (tv1[0], 2), (tv1[1], 2)];
        let mut fixed = model;
        for (var, value) in assignment {
            let c = fixed.constant(value);
            fixed.add_equal(var, c);
        }
        let obj = fixed.sum(&op_ext);
        let solution = fixed
            .minimize(obj, &crate::solver::SearchBudget::default())
            .unwrap();
        let v = |e: ExprId| solution.value(e);

        // T1: slices over op extents (2, 2)
        let t1_rows: Vec<Vec<i64>> = t1_info
            .backward_extents
            .iter()
            .map(|row| row.iter().map(|&e| v(e)).collect())
            .collect();
        assert_eq!(t1_rows, vec![vec![4, 4], vec![2, 4], vec![2, 2]]);

        // T2: slices over T1 full extents (4, 4)
        let t2_rows: Vec<Vec<i64>> = t2_info
            .backward_extents
            .iter()
            .map(|row| row.iter().map(|&e| v(e)).collect())
            .collect();
        assert_eq!(t2_rows, vec![vec![8, 4], vec![4, 4], vec![4, 4]]);
    }

    #[test]
    fn test_revisit_reuses_variables() {
        let mut graph = DataflowGraph::new("g");
        graph.add_elementwise("relu", &[16, 16], &[None]);
        let tree = two_level_tree(vec![16, 16]);
        let target = target_two_levels();
        let mut model = SearchModel::new();
        let mut init = TreeInitializer::new(&mut model, &graph, &target, &tree);
        let first = init.run(&tree).unwrap();
        let vars_before = init.memo().domain(tree.root()).unwrap().tile_vars.clone();
        let places_before = init.memo().tile(tree.root()).unwrap().buffers[0].all_places();
        let second = init.run(&tree).unwrap();
        assert_eq!(first.extents, second.extents);
        assert_eq!(init.memo().domain(tree.root()).unwrap().tile_vars, vars_before);
        assert_eq!(init.memo().tile(tree.root()).unwrap().buffers[0].all_places(), places_before);
        let memo = init.into_memo();
        assert!(memo.tile(tree.root()).is_some());
        let count = model.num_vars();
        // 2 tile nodes * 2 dims + 2 op dims + places
        assert!(count >= 6);
    }

    #[test]
    fn test_root_positions_start_at_zero() {
        let mut graph = DataflowGraph::new("g");
        graph.add_elementwise("relu", &[16], &[None]);
        let tree = two_level_tree(vec![16]);
        let target = target_two_levels();
        let mut model = SearchModel::new();
        let mut init = TreeInitializer::new(&mut model, &graph, &target, &tree);
        init.run(&tree).unwrap();
        let memo = init.into_memo();
        let root_info = memo.tile(tree.root()).unwrap();
        let t1 = tree.children(tree.root())[0];
        let t1_info = memo.tile(t1).unwrap();
        assert_eq!(root_info.buffers[0].first_pos, 0);
        assert_eq!(root_info.buffers[0].places.len(), 2);
        assert_eq!(root_info.buffers[0].places[0].len(), 2);
        assert_eq!(t1_info.buffers[0].first_pos, 1);
        assert_eq!(t1_info.buffers[0].places.len(), 1);
        assert_eq!(t1_info.buffers[0].places[0].len(), 1);
    }

    #[test]
    fn test_check_levels_rejects_inverted_nesting() {
        let mut tree = TileTree::new(NodeKind::Tile(TileNode {
            level: 1,
            op: OpId(0),
            relation: AffineMap::identity(1),
            bounds: vec![4],
        }));
        tree.add_child(
            tree.root(),
            NodeKind::Tile(TileNode {
                level: 2,
                op: OpId(0),
                relation: AffineMap::identity(1),
                bounds: vec![4],
            }),
        );
        assert!(check_levels(&tree).is_err());
    }
}
