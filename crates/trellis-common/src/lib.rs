//! Trellis common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all trellis components.

pub mod config;
pub mod encoding;
pub mod error;
pub mod types;

pub use config::{TreeConfig, TreeMode};
pub use error::{Result, TrellisError};
pub use types::{
    Coordinate, CoordinateSet, NodeId, Permutation, Strategy, TermKey, TermValue,
    N_PERMUTATIONS,
};
