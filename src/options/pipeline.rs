use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Frame pipelining and thread-pool parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[schemars(title = "Pipeline", inline)]
#[serde(default)]
pub struct PipelineOptions {
    /// Number of buffer sets rotated across frames (`frame mod ring_slots`).
    #[schemars(title = "Ring Slots", range(min = 1, max = 8))]
    pub ring_slots: u32,
    /// Atoms per bounding-box reduction task.
    #[schemars(title = "Reduction Chunk Size")]
    pub reduction_chunk_size: u32,
    /// Worker threads for the compute pool (0 = one per core).
    #[schemars(title = "Worker Threads")]
    pub worker_threads: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            ring_slots: 3,
            reduction_chunk_size: 64 * 1024,
            worker_threads: 0,
        }
    }
}
