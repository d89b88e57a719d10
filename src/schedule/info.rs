//! Per-node solver memo tables.
//!
//! All tables are vectors indexed by [`NodeId`]; a node's entry is created the
//! first time a pass visits it and reused on every later visit, so each tile
//! variable and placement boolean exists exactly once in the model.

use crate::affine::{AffineMap, LoopMask};
use crate::graph::OpId;
use crate::solver::ExprId;
use crate::target::KernelInfo;
use crate::tree::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// `(operation, index)` buffer identity. `index < reads` names a read
/// operand, `index == reads` the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId {
    pub op: OpId,
    pub index: usize,
}

impl BufferId {
    pub fn new(op: OpId, index: usize) -> Self {
        Self { op, index }
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}_{}", self.op, self.index)
    }
}

/// Inclusive `[start, end]` interval of op timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lifetime {
    pub start: usize,
    pub end: usize,
}

impl Lifetime {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Lifetime) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Smallest interval covering both.
    pub fn union(&self, other: &Lifetime) -> Lifetime {
        Lifetime::new(self.start.min(other.start), self.end.max(other.end))
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Tile variables and extents of a tileable node.
#[derive(Debug, Clone)]
pub struct DomainInfo {
    /// Trip count of each domain dim's loop at this node
    pub tile_vars: Vec<ExprId>,
    /// Product of trip counts from the root down to this node, per dim
    pub forward_extents: Vec<ExprId>,
    /// This node's dim -> parent dim, for dims that pass straight through
    pub dims_map: BTreeMap<usize, usize>,
}

/// Memo for an operation leaf.
#[derive(Debug, Clone)]
pub struct OpNodeInfo {
    pub op: OpId,
    pub kernel: KernelInfo,
    /// Op-level extents: tile var times primitive
    pub extents: Vec<ExprId>,
    /// Access map per buffer index
    pub access_maps: Vec<AffineMap>,
    /// Buffer shape per buffer index
    pub shapes: Vec<Vec<ExprId>>,
    /// Buffer size in bytes per buffer index
    pub sizes: Vec<ExprId>,
}

/// One live buffer at a tile node.
#[derive(Debug, Clone)]
pub struct TileNodeBufferInfo {
    /// Canonical identity (the def-use source for aliased buffers)
    pub id: BufferId,
    /// Every identity sharing this entry, including `id`
    pub aliases: Vec<BufferId>,
    pub lifetime: Lifetime,
    /// Node domain -> buffer
    pub access_map: AffineMap,
    pub elem_bytes: i64,
    pub mask: LoopMask,
    /// Placement booleans, `places[pos - first_pos][sub_level]`
    pub places: Vec<Vec<ExprId>>,
    /// First create-loop position
    pub first_pos: usize,
    /// Buffer shape per create-loop position
    pub shapes: Vec<Vec<ExprId>>,
    /// Buffer bytes per create-loop position
    pub sizes: Vec<ExprId>,
    /// Per-dim trip counts, filled by the write pass
    pub dim_trips: Vec<ExprId>,
    /// Loads per create-loop position, filled by the write pass
    pub trips: Vec<ExprId>,
    /// Bytes moved per create-loop position, filled by the write pass
    pub writes: Vec<ExprId>,
}

impl TileNodeBufferInfo {
    /// Create-loop positions this buffer may be placed at.
    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.places.len()).map(move |p| p + self.first_pos)
    }

    /// Placement booleans at `pos`.
    pub fn places_at(&self, pos: usize) -> &[ExprId] {
        &self.places[pos - self.first_pos]
    }

    /// Every placement boolean with its `(pos, sub_level)`.
    pub fn all_places(&self) -> Vec<(usize, usize, ExprId)> {
        self.positions()
            .flat_map(|pos| {
                self.places_at(pos)
                    .iter()
                    .enumerate()
                    .map(move |(sl, &e)| (pos, sl, e))
            })
            .collect()
    }
}

/// Memo for a tile node.
#[derive(Debug, Clone, Default)]
pub struct TileNodeInfo {
    /// Sink -> source aliasing resolved at this node
    pub def_use: BTreeMap<BufferId, BufferId>,
    pub buffers: Vec<TileNodeBufferInfo>,
    index: HashMap<BufferId, usize>,
    /// `backward_extents[pos][dim]`: buffer-visible extent when created
    /// inside loop `pos`
    pub backward_extents: Vec<Vec<ExprId>>,
}

impl TileNodeInfo {
    pub fn new(def_use: BTreeMap<BufferId, BufferId>, backward_extents: Vec<Vec<ExprId>>) -> Self {
        Self {
            def_use,
            buffers: Vec::new(),
            index: HashMap::new(),
            backward_extents,
        }
    }

    /// Register a buffer under all its aliases.
    pub fn push(&mut self, info: TileNodeBufferInfo) {
        let slot = self.buffers.len();
        for &alias in &info.aliases {
            self.index.insert(alias, slot);
        }
        self.buffers.push(info);
    }

    /// Look up a buffer by any of its identities.
    pub fn buffer(&self, id: BufferId) -> Option<&TileNodeBufferInfo> {
        self.index.get(&id).map(|&i| &self.buffers[i])
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> Option<&mut TileNodeBufferInfo> {
        let slot = *self.index.get(&id)?;
        self.buffers.get_mut(slot)
    }

    /// Full extents of this node (outermost position).
    pub fn full_extents(&self) -> &[ExprId] {
        self.backward_extents.first().map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// All memo tables of one tree solve.
#[derive(Debug, Clone, Default)]
pub struct SolveMemo {
    pub domains: Vec<Option<DomainInfo>>,
    pub ops: Vec<Option<OpNodeInfo>>,
    pub tiles: Vec<Option<TileNodeInfo>>,
}

impl SolveMemo {
    pub fn with_capacity(nodes: usize) -> Self {
        Self {
            domains: vec![None; nodes],
            ops: vec![None; nodes],
            tiles: vec![None; nodes],
        }
    }

    pub fn domain(&self, id: NodeId) -> Option<&DomainInfo> {
        self.domains.get(id.index()).and_then(|d| d.as_ref())
    }

    pub fn op(&self, id: NodeId) -> Option<&OpNodeInfo> {
        self.ops.get(id.index()).and_then(|d| d.as_ref())
    }

    pub fn tile(&self, id: NodeId) -> Option<&TileNodeInfo> {
        self.tiles.get(id.index()).and_then(|d| d.as_ref())
    }

    pub fn tile_mut(&mut self, id: NodeId) -> Option<&mut TileNodeInfo> {
        self.tiles.get_mut(id.index()).and_then(|d| d.as_mut())
    }

    /// Tile nodes with a memo entry, in arena order.
    pub fn tile_nodes(&self) -> impl Iterator<Item = (NodeId, &TileNodeInfo)> {
        self.tiles
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (NodeId(i), t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_id_display() {
        assert_eq!(BufferId::new(OpId(3), 1).to_string(), "op3_1");
    }

    #[test]
    fn test_lifetime_overlap() {
        let a = Lifetime::new(0, 1);
        let b = Lifetime::new(2, 3);
        assert!(!a.overlaps(&b));
        assert!(a.union(&b).overlaps(&b));
        assert_eq!(a.union(&b), Lifetime::new(0, 3));
    }

    #[test]
    fn test_aliases_share_one_entry() {
        let source = BufferId::new(OpId(0), 1);
        let sink = BufferId::new(OpId(1), 0);
        let mut info = TileNodeInfo::default();
        info.push(TileNodeBufferInfo {
            id: source,
            aliases: vec![source, sink],
            lifetime: Lifetime::new(0, 3),
            access_map: AffineMap::identity(1),
            elem_bytes: 4,
            mask: LoopMask(1),
            places: vec![vec![ExprId(7)]],
            first_pos: 1,
            shapes: Vec::new(),
            sizes: Vec::new(),
            dim_trips: Vec::new(),
            trips: Vec::new(),
            writes: Vec::new(),
        });
        let a = info.buffer(source).unwrap();
        let b = info.buffer(sink).unwrap();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.all_places(), vec![(1, 0, ExprId(7))]);
    }
}
