// -- Lint policy ---------------------------------------------------------
// Lint groups and their allowances live in Cargo.toml `[lints]`. Only the
// library-specific restrictions are repeated here.

// No panicking in library code
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
// No debug/print artifacts
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
// Import hygiene
#![deny(clippy::wildcard_imports)]

//! Per-frame two-level sparse voxel index over atoms.
//!
//! Every frame, a renderer hands atomgrid the current atom positions and gets
//! back a [`SparseIndex`]: a coarse grid of large cells, compacted to only the
//! occupied ones, each subdivided into small voxels that list the atoms whose
//! padded sphere overlaps them. The index is rebuilt from scratch each frame.
//!
//! # Key entry points
//!
//! - [`BvhBuilder`] - runs the build stages on a [`compute`] backend
//! - [`FramePipeline`] - overlaps frame preparation with the build on a
//!   background worker, over a ring of buffer sets
//! - [`SparseIndex`] - read-only view with cell and region queries
//! - [`Options`] - grid, limits, pipeline and reporting configuration
//!
//! # Architecture
//!
//! A frame runs bounding-box reduction, grid arguments, atom conversion and
//! counter reset on the submitting thread, then the large-cell passes,
//! dispatch sizing and small-cell passes on the `atomgrid-builder` thread.
//! Each pass is a data-parallel dispatch whose invocations only talk through
//! atomics, so the same code runs on rayon or serially.

pub mod atom;
pub mod bvh;
pub mod compute;
pub mod error;
pub mod options;
pub mod pipeline;
pub mod util;

pub use atom::{Atom, RadiusTable};
pub use bvh::{BvhBuilder, SparseIndex};
pub use error::{BuildError, ErrorKind, Stage};
pub use options::Options;
pub use pipeline::{BufferRing, BuildSummary, FramePipeline, SlotLease};
