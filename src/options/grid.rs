use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Voxel widths and world extent, in nanometers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[schemars(title = "Grid", inline)]
#[serde(default)]
pub struct GridOptions {
    /// Width of a large (coarse) voxel.
    #[schemars(title = "Large Voxel Width", range(min = 0.25, max = 8.0))]
    pub large_voxel_width: f32,
    /// Width of a small (fine) voxel. Must divide the large width evenly.
    #[schemars(title = "Small Voxel Width", range(min = 0.0625, max = 2.0))]
    pub small_voxel_width: f32,
    /// Half-width of the world box; bounding boxes are clamped to
    /// `±world_extent`.
    #[schemars(title = "World Extent", range(min = 2.0, max = 256.0))]
    pub world_extent: f32,
    /// Added to every atom radius so spheres touching a voxel face are
    /// still referenced.
    #[schemars(skip)]
    pub padding_epsilon: f32,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            large_voxel_width: 2.0,
            small_voxel_width: 0.25,
            world_extent: 64.0,
            padding_epsilon: 1e-4,
        }
    }
}

impl GridOptions {
    /// Number of small voxels along one axis of a large voxel, if the widths
    /// divide evenly.
    #[must_use]
    pub fn small_cells_per_axis(&self) -> Option<u32> {
        let ratio = self.large_voxel_width / self.small_voxel_width;
        let rounded = ratio.round();
        if (ratio - rounded).abs() > 1e-3 || rounded < 1.0 {
            return None;
        }
        Some(rounded as u32)
    }

    /// Large voxels spanned by the world box along one axis.
    #[must_use]
    pub fn world_cells_per_axis(&self) -> f32 {
        2.0 * self.world_extent / self.large_voxel_width
    }
}
