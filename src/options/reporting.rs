use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Frame timing history options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[schemars(title = "Reporting", inline)]
#[serde(default)]
pub struct ReportingOptions {
    /// Frames kept in the timing history before pruning.
    #[schemars(title = "History Size", range(min = 1, max = 1000))]
    pub history_size: u32,
    /// Log the averaged stage timings once per frame.
    #[schemars(title = "Log Performance")]
    pub log_performance: bool,
}

impl Default for ReportingOptions {
    fn default() -> Self {
        Self {
            history_size: 10,
            log_performance: false,
        }
    }
}
