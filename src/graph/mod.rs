//! Dataflow graph input and the tile graph built over it.

pub mod merge;
pub mod op;
pub mod tile_graph;

pub use merge::{apply_merge, MergePoint};
pub use op::{DataflowGraph, KernelKind, OpId, OpNode, ReadAccess, WriteAccess};
pub use tile_graph::TileGraph;
