//! Outer-memory buffer placement.
//!
//! Independent of the tile-tree solver: takes buffers with sizes and
//! lifetimes (for example the outer-level buffers of solved trees) and
//! assigns them byte offsets.

pub mod ddr;
pub mod lifetime;

pub use ddr::{ConstTensor, DdrBufferScheduler, DdrContext, Function, MemoryLocation, Module, SchedResult};
pub use lifetime::{usage, Allocation, LifetimeScheduler, LiveBuffer};
