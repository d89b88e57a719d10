//! Affine domain and access-relation library.
//!
//! This module provides the integer foundation for the tile scheduler:
//! - Affine expressions over domain dimensions and symbols
//! - Range-valued affine maps with composition
//! - Loop masks describing which loops an access depends on

pub mod expr;
pub mod map;

pub use expr::AffineExpr;
pub use map::{AffineMap, AffineRange, LoopMask};
