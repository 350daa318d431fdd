//! Build options with TOML preset support.
//!
//! Grid widths, capacities, pipelining and reporting settings are
//! consolidated here. Options serialize to/from TOML; every section uses
//! `#[serde(default)]` so partial files work.

mod grid;
mod limits;
mod pipeline;
mod reporting;

use std::path::Path;

pub use grid::GridOptions;
pub use limits::{
    LimitOptions, ATOM_COUNT_CEILING, LARGE_CELLS_PER_AXIS_CEILING,
    OCCUPIED_CELLS_CEILING, SMALL_REFERENCE_CEILING,
};
pub use pipeline::PipelineOptions;
pub use reporting::ReportingOptions;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, Stage};

/// Largest supported small-per-large ratio along one axis.
pub const MAX_SMALL_CELLS_PER_AXIS: u32 = 16;

/// Top-level options container.
#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema,
)]
#[serde(default)]
pub struct Options {
    /// Voxel widths and world extent.
    pub grid: GridOptions,
    /// Fixed capacities.
    pub limits: LimitOptions,
    /// Ring buffering and thread pool.
    pub pipeline: PipelineOptions,
    /// Frame timing history.
    pub reporting: ReportingOptions,
}

impl Options {
    /// Generate JSON Schema describing the options.
    #[must_use]
    pub fn json_schema() -> schemars::Schema {
        schemars::schema_for!(Options)
    }

    /// Load options from a TOML file. Missing fields use defaults.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Io`] if the file cannot be read,
    /// [`BuildError::OptionsParse`] for malformed TOML, or the error of
    /// [`Options::validate`].
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let content = std::fs::read_to_string(path).map_err(BuildError::Io)?;
        let options: Self = toml::from_str(&content)
            .map_err(|e| BuildError::OptionsParse(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Save options to a TOML file (pretty-printed).
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::OptionsParse`] if serialization fails, or
    /// [`BuildError::Io`] if the file or its directory cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), BuildError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BuildError::OptionsParse(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(BuildError::Io)?;
        }
        std::fs::write(path, content).map_err(BuildError::Io)
    }

    /// Small voxels per large voxel along one axis.
    ///
    /// Only meaningful after [`Options::validate`] has passed; falls back to
    /// 1 for mismatched widths.
    #[must_use]
    pub fn small_cells_per_axis(&self) -> u32 {
        self.grid.small_cells_per_axis().unwrap_or(1)
    }

    /// Check every option against the hard limits of the index layout.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Configuration`] naming the first option out
    /// of range.
    pub fn validate(&self) -> Result<(), BuildError> {
        let fail = |reason: String| {
            Err(BuildError::configuration(Stage::Setup, reason))
        };
        let grid = &self.grid;
        for (name, value) in [
            ("large_voxel_width", grid.large_voxel_width),
            ("small_voxel_width", grid.small_voxel_width),
            ("world_extent", grid.world_extent),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return fail(format!("{name} must be finite and positive"));
            }
        }
        if !grid.padding_epsilon.is_finite() || grid.padding_epsilon < 0.0 {
            return fail("padding_epsilon must be finite and >= 0".into());
        }
        match grid.small_cells_per_axis() {
            Some(ratio) if ratio <= MAX_SMALL_CELLS_PER_AXIS => {}
            _ => {
                return fail(format!(
                    "large/small voxel ratio must be an integer in 1..={}",
                    MAX_SMALL_CELLS_PER_AXIS
                ))
            }
        }
        let half_cells = grid.world_extent / grid.large_voxel_width;
        if (half_cells - half_cells.round()).abs() > 1e-3 {
            return fail(
                "world_extent must be a multiple of large_voxel_width".into(),
            );
        }

        let limits = &self.limits;
        if limits.max_large_cells_per_axis == 0
            || limits.max_large_cells_per_axis > LARGE_CELLS_PER_AXIS_CEILING
        {
            return fail(format!(
                "max_large_cells_per_axis must be in 1..={}",
                LARGE_CELLS_PER_AXIS_CEILING
            ));
        }
        let cells = grid.world_cells_per_axis();
        if cells.round() as u32 > limits.max_large_cells_per_axis {
            return fail(format!(
                "world box spans {} large cells per axis, limit is {}",
                cells.round() as u32,
                limits.max_large_cells_per_axis
            ));
        }
        if limits.max_atoms == 0 || limits.max_atoms > ATOM_COUNT_CEILING {
            return fail(format!(
                "max_atoms must be in 1..={ATOM_COUNT_CEILING}"
            ));
        }
        if limits.max_occupied_large_cells == 0
            || limits.max_occupied_large_cells > OCCUPIED_CELLS_CEILING
        {
            return fail(format!(
                "max_occupied_large_cells must be in 1..={OCCUPIED_CELLS_CEILING}"
            ));
        }
        if limits.max_small_references == 0
            || limits.max_small_references > SMALL_REFERENCE_CEILING
        {
            return fail(format!(
                "max_small_references must be in 1..={SMALL_REFERENCE_CEILING}"
            ));
        }

        if self.pipeline.ring_slots == 0 {
            return fail("ring_slots must be at least 1".into());
        }
        if self.pipeline.reduction_chunk_size == 0 {
            return fail("reduction_chunk_size must be at least 1".into());
        }
        if self.reporting.history_size == 0 {
            return fail("history_size must be at least 1".into());
        }
        Ok(())
    }
}
