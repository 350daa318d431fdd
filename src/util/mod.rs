//! Shared utilities.

pub mod frame_report;

pub use frame_report::{FrameReport, FrameReporter, StageMeans};
