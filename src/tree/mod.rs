//! Tile tree model.
//!
//! A tile tree nests scope nodes, tile nodes and operation leaves. The same
//! arena representation serves the merge search (cheap clone, mutated on the
//! copy) and the solver (compact extracted subtree).

pub mod node;
pub mod printer;
pub mod visitor;

pub use node::{NodeId, NodeKind, OpLeaf, StructuralKey, TileNode, TileTree, TreeNode};
pub use printer::TreePrinter;
pub use visitor::TreeVisitor;
