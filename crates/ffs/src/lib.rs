#![forbid(unsafe_code)]
//! Public facade for the superblock subsystem.
//!
//! Re-exports `ffs-core` so downstream users depend on one crate.

pub use ffs_core::*;
