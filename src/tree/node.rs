//! Tile tree arena.
//!
//! Nodes live in a flat vector and are addressed by [`NodeId`]. Every node
//! records its parent index at construction time, so passes can walk upward
//! without back-pointers, and per-node memo tables are plain vectors indexed
//! by the same id.

use crate::affine::AffineMap;
use crate::error::{ScheduleError, ScheduleResult};
use crate::graph::OpId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a node in a [`TileTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One level of tiling applied to a subtree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileNode {
    /// Nesting level; 0 is the primitive level, increasing outward
    pub level: usize,
    /// Representative op (the last consumer fused into this node)
    pub op: OpId,
    /// Parent domain -> this node's domain
    pub relation: AffineMap,
    /// Absolute extent of every domain dim
    pub bounds: Vec<i64>,
}

impl TileNode {
    pub fn rank(&self) -> usize {
        self.bounds.len()
    }
}

/// Leaf holding one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpLeaf {
    pub op: OpId,
    /// Parent domain -> op domain
    pub relation: AffineMap,
    /// Op domain bounds
    pub bounds: Vec<i64>,
}

/// Closed set of node kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Grouping of independent subtrees, no loops of its own
    Scope,
    Tile(TileNode),
    Op(OpLeaf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Canonical shape of a subtree, independent of arena indices.
///
/// Two subtrees with equal keys produce identical constraint models.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructuralKey {
    Scope(Vec<StructuralKey>),
    Tile {
        level: usize,
        op: OpId,
        relation: AffineMap,
        bounds: Vec<i64>,
        children: Vec<StructuralKey>,
    },
    Op {
        op: OpId,
        relation: AffineMap,
    },
}

/// Arena-backed tile tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileTree {
    nodes: Vec<TreeNode>,
    root: NodeId,
}

impl TileTree {
    /// Tree consisting of a single root node.
    pub fn new(root: NodeKind) -> Self {
        Self {
            nodes: vec![TreeNode {
                kind: root,
                parent: None,
                children: Vec::new(),
            }],
            root: NodeId(0),
        }
    }

    /// Tree whose root is a bare op leaf.
    pub fn single_op(op: OpId, bounds: Vec<i64>) -> Self {
        let relation = AffineMap::identity(bounds.len());
        Self::new(NodeKind::Op(OpLeaf { op, relation, bounds }))
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of arena slots (including detached nodes).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append `kind` as the last child of `parent`.
    pub fn add_child(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode {
            kind,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id.0]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0].kind
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    /// Level of a node; op leaves are level 0, scopes sit above their
    /// highest child.
    pub fn level(&self, id: NodeId) -> usize {
        match self.kind(id) {
            NodeKind::Tile(t) => t.level,
            NodeKind::Op(_) => 0,
            NodeKind::Scope => self
                .children(id)
                .iter()
                .map(|&c| self.level(c) + 1)
                .max()
                .unwrap_or(0),
        }
    }

    /// Domain relation of a tile or op node.
    pub fn relation(&self, id: NodeId) -> Option<&AffineMap> {
        match self.kind(id) {
            NodeKind::Tile(t) => Some(&t.relation),
            NodeKind::Op(o) => Some(&o.relation),
            NodeKind::Scope => None,
        }
    }

    /// Absolute bounds of a tile or op node.
    pub fn bounds(&self, id: NodeId) -> &[i64] {
        match self.kind(id) {
            NodeKind::Tile(t) => &t.bounds,
            NodeKind::Op(o) => &o.bounds,
            NodeKind::Scope => &[],
        }
    }

    /// Nodes reachable from `id` in pre-order.
    pub fn preorder(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().rev());
        }
        out
    }

    /// Op leaves under `id`, in execution order.
    pub fn op_leaves(&self, id: NodeId) -> Vec<(OpId, NodeId)> {
        self.preorder(id)
            .into_iter()
            .filter_map(|n| match self.kind(n) {
                NodeKind::Op(o) => Some((o.op, n)),
                _ => None,
            })
            .collect()
    }

    /// Find the leaf holding `op` under `id`.
    pub fn find_op(&self, id: NodeId, op: OpId) -> Option<NodeId> {
        self.op_leaves(id)
            .into_iter()
            .find(|(o, _)| *o == op)
            .map(|(_, n)| n)
    }

    /// Compose the relations strictly below `ancestor` down to `node`:
    /// `ancestor`'s domain -> `node`'s domain.
    pub fn relation_below(&self, ancestor: NodeId, node: NodeId) -> ScheduleResult<AffineMap> {
        let mut path = Vec::new();
        let mut cur = node;
        while cur != ancestor {
            path.push(cur);
            cur = self.parent(cur).ok_or_else(|| {
                ScheduleError::InvalidGraph(format!("{} is not an ancestor of {}", ancestor, node))
            })?;
        }
        let mut acc = AffineMap::identity(self.bounds(ancestor).len());
        for &n in path.iter().rev() {
            let rel = self.relation(n).ok_or_else(|| {
                ScheduleError::InvalidGraph(format!("scope {} on a relation path", n))
            })?;
            acc = acc.compose(rel)?;
        }
        Ok(acc)
    }

    /// Compose relations from the outermost tiled ancestor down to `node`,
    /// including that ancestor's own relation.
    pub fn absolute_relation(&self, node: NodeId) -> ScheduleResult<AffineMap> {
        let mut top = node;
        while let Some(p) = self.parent(top) {
            if matches!(self.kind(p), NodeKind::Scope) {
                break;
            }
            top = p;
        }
        let own = self
            .relation(top)
            .cloned()
            .ok_or_else(|| ScheduleError::InvalidGraph(format!("{} has no relation", top)))?;
        let below = self.relation_below(top, node)?;
        own.compose(&below)
    }

    /// Copy the subtree rooted at `id` into a compact tree of its own.
    pub fn extract(&self, id: NodeId) -> TileTree {
        let mut tree = TileTree::new(self.kind(id).clone());
        let mut stack = vec![(id, tree.root)];
        while let Some((src, dst)) = stack.pop() {
            for &c in self.children(src) {
                let nc = tree.add_child(dst, self.kind(c).clone());
                stack.push((c, nc));
            }
        }
        tree
    }

    /// Canonical shape of the subtree at `id`.
    pub fn structural_key(&self, id: NodeId) -> StructuralKey {
        let children = || {
            self.children(id)
                .iter()
                .map(|&c| self.structural_key(c))
                .collect::<Vec<_>>()
        };
        match self.kind(id) {
            NodeKind::Scope => StructuralKey::Scope(children()),
            NodeKind::Tile(t) => StructuralKey::Tile {
                level: t.level,
                op: t.op,
                relation: t.relation.clone(),
                bounds: t.bounds.clone(),
                children: children(),
            },
            NodeKind::Op(o) => StructuralKey::Op {
                op: o.op,
                relation: o.relation.clone(),
            },
        }
    }

    /// Replace `old` by `new` in its parent's child list and drop `removed`
    /// from it. Detached nodes stay in the arena.
    pub(crate) fn splice(&mut self, parent: NodeId, removed: NodeId, old: NodeId, new: NodeId) {
        let children = &mut self.nodes[parent.0].children;
        children.retain(|&c| c != removed);
        for c in children.iter_mut() {
            if *c == old {
                *c = new;
            }
        }
        self.nodes[new.0].parent = Some(parent);
        self.nodes[old.0].parent = None;
        self.nodes[removed.0].parent = None;
    }

    /// Create a detached node.
    pub(crate) fn add_detached(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode {
            kind,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    /// Move `child` under `parent` (appending), replacing its relation.
    pub(crate) fn adopt(&mut self, parent: NodeId, child: NodeId, relation: AffineMap) {
        match &mut self.nodes[child.0].kind {
            NodeKind::Tile(t) => t.relation = relation,
            NodeKind::Op(o) => o.relation = relation,
            NodeKind::Scope => {}
        }
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }
}
