use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Hard atom-count ceiling imposed by the per-slot atom buffers.
pub const ATOM_COUNT_CEILING: u32 = 4 * 1024 * 1024;

/// Hard ceiling on occupied large cells after compaction.
pub const OCCUPIED_CELLS_CEILING: u32 = 128 * 1024;

/// Small-reference pool ceiling; a frame must stay strictly below it.
pub const SMALL_REFERENCE_CEILING: u32 = 64 * 1024 * 1024;

/// Hard per-axis ceiling for the large-voxel grid (16-bit coordinates).
pub const LARGE_CELLS_PER_AXIS_CEILING: u32 = 256;

/// Fixed capacities. Exceeding any of them fails the frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[schemars(title = "Limits", inline)]
#[serde(default)]
pub struct LimitOptions {
    /// Maximum number of atoms per frame.
    #[schemars(title = "Max Atoms")]
    pub max_atoms: u32,
    /// Maximum large voxels along one axis of the world grid.
    #[schemars(title = "Max Large Cells Per Axis")]
    pub max_large_cells_per_axis: u32,
    /// Maximum number of occupied large voxels after compaction.
    #[schemars(title = "Max Occupied Large Cells")]
    pub max_occupied_large_cells: u32,
    /// Ceiling on the small-reference pool (dense-grid fallback limit).
    #[schemars(title = "Max Small References")]
    pub max_small_references: u32,
}

impl Default for LimitOptions {
    fn default() -> Self {
        Self {
            max_atoms: ATOM_COUNT_CEILING,
            max_large_cells_per_axis: LARGE_CELLS_PER_AXIS_CEILING,
            max_occupied_large_cells: OCCUPIED_CELLS_CEILING,
            max_small_references: SMALL_REFERENCE_CEILING,
        }
    }
}
