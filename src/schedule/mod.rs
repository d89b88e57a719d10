//! Tile tree scheduling: decision variables, write costs and the solve driver.
//!
//! Solving a tree runs two passes over it. The [`initializer`] creates tile
//! variables, placement booleans and buffer size expressions; [`writes`]
//! back-propagates trip counts into per-position data-movement costs. The
//! [`tiler`] adds capacity constraints and the objective, then minimizes.

pub mod info;
pub mod initializer;
pub mod tiler;
pub mod writes;

pub use info::{BufferId, Lifetime, SolveMemo, TileNodeBufferInfo, TileNodeInfo};
pub use initializer::{InitContext, InitResult, TreeInitializer};
pub use tiler::{BufferPlacement, NodeSizes, PlacementFlags, SolvedTree, TreeTiler};
pub use writes::WritePropagation;
