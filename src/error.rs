//! Crate-level error types.
//!
//! Every failure is fatal for the frame that raised it: the index is
//! regenerated from scratch each frame, so there is no partial output to fall
//! back on.

use std::fmt;

/// Pipeline stage that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Static setup: options, radius table.
    Setup,
    /// Bounding-box reduction over the raw atoms.
    BoundingBox,
    /// Grid origin/dimension derivation.
    GridArguments,
    /// Raw atom to voxel-space conversion.
    Convert,
    /// Counter and cell metadata reset.
    ResetCounters,
    /// Large-cell counting pass.
    LargeCellCount,
    /// Large-cell stream compaction.
    LargeCellCompact,
    /// Large-cell atom list fill.
    LargeCellFill,
    /// Work sizing for the small-cell passes.
    DispatchSizing,
    /// Small-cell counting pass.
    SmallCellCount,
    /// Small-cell offset allocation.
    SmallCellAllocate,
    /// Small-cell reference scatter.
    SmallCellScatter,
    /// Frame hand-off between the caller and the build worker.
    Pipeline,
}

impl Stage {
    /// Short stage name used in log lines and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::BoundingBox => "bounding-box",
            Self::GridArguments => "grid-arguments",
            Self::Convert => "convert",
            Self::ResetCounters => "reset-counters",
            Self::LargeCellCount => "large-count",
            Self::LargeCellCompact => "large-compact",
            Self::LargeCellFill => "large-fill",
            Self::DispatchSizing => "dispatch-sizing",
            Self::SmallCellCount => "small-count",
            Self::SmallCellAllocate => "small-allocate",
            Self::SmallCellScatter => "small-scatter",
            Self::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Coarse classification of a [`BuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid static setup, detected before any pass runs.
    Configuration,
    /// A data-dependent count exceeded a fixed capacity.
    ResourceExhaustion,
    /// An impossible count or double allocation; an internal bug.
    InvariantViolation,
    /// I/O, option parsing, or thread failures outside the build itself.
    Environment,
}

/// Errors produced by the atomgrid crate.
#[derive(Debug)]
pub enum BuildError {
    /// Invalid static setup (empty atoms, malformed radius table, options).
    Configuration {
        /// Stage that rejected the input.
        stage: Stage,
        /// Human-readable description of the problem.
        reason: String,
    },
    /// A count exceeded the capacity it is bounded by.
    ResourceExhaustion {
        /// Stage that detected the overflow.
        stage: Stage,
        /// Name of the exhausted resource.
        resource: &'static str,
        /// Amount that was requested.
        requested: u64,
        /// Fixed capacity of the resource.
        capacity: u64,
    },
    /// Internal consistency check failed.
    InvariantViolation {
        /// Stage whose output was inconsistent.
        stage: Stage,
        /// Description of the broken invariant.
        reason: String,
    },
    /// Generic I/O failure.
    Io(std::io::Error),
    /// Failed to spawn the background build thread.
    ThreadSpawn(std::io::Error),
    /// TOML options parsing/serialization failure.
    OptionsParse(String),
    /// The build worker exited (after a fatal error or shutdown).
    WorkerDisconnected,
}

impl BuildError {
    /// Shorthand for a [`BuildError::Configuration`].
    #[must_use]
    pub fn configuration(stage: Stage, reason: impl Into<String>) -> Self {
        Self::Configuration {
            stage,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`BuildError::InvariantViolation`].
    #[must_use]
    pub fn invariant(stage: Stage, reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            stage,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`BuildError::ResourceExhaustion`].
    #[must_use]
    pub fn exhausted(
        stage: Stage,
        resource: &'static str,
        requested: u64,
        capacity: u64,
    ) -> Self {
        Self::ResourceExhaustion {
            stage,
            resource,
            requested,
            capacity,
        }
    }

    /// Classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } | Self::OptionsParse(_) => {
                ErrorKind::Configuration
            }
            Self::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            Self::InvariantViolation { .. } => ErrorKind::InvariantViolation,
            Self::Io(_) | Self::ThreadSpawn(_) | Self::WorkerDisconnected => {
                ErrorKind::Environment
            }
        }
    }

    /// Stage that raised the error, when it came from the build itself.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Configuration { stage, .. }
            | Self::ResourceExhaustion { stage, .. }
            | Self::InvariantViolation { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { stage, reason } => {
                write!(f, "configuration error in {stage}: {reason}")
            }
            Self::ResourceExhaustion {
                stage,
                resource,
                requested,
                capacity,
            } => write!(
                f,
                "resource exhausted in {stage}: {resource} needs {requested}, \
                 capacity is {capacity}"
            ),
            Self::InvariantViolation { stage, reason } => {
                write!(f, "invariant violated in {stage}: {reason}")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::ThreadSpawn(e) => {
                write!(f, "failed to spawn thread: {e}")
            }
            Self::OptionsParse(msg) => {
                write!(f, "options parse error: {msg}")
            }
            Self::WorkerDisconnected => {
                write!(f, "build worker is no longer running")
            }
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::ThreadSpawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_stage_and_counts() {
        let err = BuildError::exhausted(
            Stage::LargeCellCompact,
            "occupied large cells",
            131_073,
            131_072,
        );
        let text = err.to_string();
        assert!(text.contains("large-compact"));
        assert!(text.contains("131073"));
        assert!(text.contains("131072"));
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(err.stage(), Some(Stage::LargeCellCompact));
    }

    #[test]
    fn environment_errors_have_no_stage() {
        let err = BuildError::WorkerDisconnected;
        assert_eq!(err.kind(), ErrorKind::Environment);
        assert_eq!(err.stage(), None);
    }
}
