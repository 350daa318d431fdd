//! Bounded per-frame timing history.
//!
//! The thread preparing frames appends one report per frame with its CPU
//! durations. The build worker fills in the build durations later, from a
//! different thread. Both go through one mutex. Reports older than the
//! history window are pruned, and a late update for a pruned frame is
//! dropped.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Stage durations of one frame, in seconds. `None` until measured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameReport {
    /// Frame identifier.
    pub frame_id: u64,
    /// Bounding-box reduction.
    pub reduce_bounding_box: Option<f64>,
    /// Conversion and counter reset.
    pub upload: Option<f64>,
    /// Large-cell passes.
    pub build_large: Option<f64>,
    /// Dispatch sizing and small-cell passes.
    pub build_small: Option<f64>,
}

impl FrameReport {
    fn fields(&self) -> [Option<f64>; 4] {
        [
            self.reduce_bounding_box,
            self.upload,
            self.build_large,
            self.build_small,
        ]
    }

    /// Every field present and non-negative.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.fields().iter().all(|f| f.is_some_and(|v| v >= 0.0))
    }
}

/// Mean stage durations over the valid reports, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageMeans {
    /// Reports that contributed.
    pub frames: usize,
    /// Bounding-box reduction.
    pub reduce_bounding_box: f64,
    /// Conversion and counter reset.
    pub upload: f64,
    /// Large-cell passes.
    pub build_large: f64,
    /// Dispatch sizing and small-cell passes.
    pub build_small: f64,
}

impl StageMeans {
    /// Fixed-width microsecond columns, `|`-separated.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let mut line = String::new();
        for (i, seconds) in [
            self.reduce_bounding_box,
            self.upload,
            self.build_large,
            self.build_small,
        ]
        .into_iter()
        .enumerate()
        {
            if i > 0 {
                line.push_str(" | ");
            }
            let _ = write!(line, "{:>6}", (seconds * 1e6).round() as u64);
        }
        line
    }
}

struct History {
    reports: VecDeque<FrameReport>,
    window: u64,
}

/// Thread-safe, cloneable handle to a bounded report history.
#[derive(Clone)]
pub struct FrameReporter {
    history: Arc<Mutex<History>>,
}

impl FrameReporter {
    /// Reporter keeping the last `history_size` frames.
    #[must_use]
    pub fn new(history_size: usize) -> Self {
        let window = history_size.max(1);
        Self {
            history: Arc::new(Mutex::new(History {
                reports: VecDeque::with_capacity(window),
                window: window as u64,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, History> {
        // Reports are plain data; a panicked writer leaves nothing torn.
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append frame `frame_id` with its CPU durations, pruning frames that
    /// fell out of the window.
    pub fn begin_frame(&self, frame_id: u64, reduce_bounding_box: f64, upload: f64) {
        let mut history = self.lock();
        let window = history.window;
        while history
            .reports
            .front()
            .is_some_and(|r| r.frame_id + window <= frame_id)
        {
            let _ = history.reports.pop_front();
        }
        history.reports.push_back(FrameReport {
            frame_id,
            reduce_bounding_box: Some(reduce_bounding_box),
            upload: Some(upload),
            build_large: None,
            build_small: None,
        });
    }

    /// Fill in the build durations of `frame_id`. Returns `false` (and does
    /// nothing) when the frame was already pruned.
    #[must_use]
    pub fn record_build(
        &self,
        frame_id: u64,
        build_large: f64,
        build_small: f64,
    ) -> bool {
        let mut history = self.lock();
        match history.reports.iter_mut().find(|r| r.frame_id == frame_id) {
            Some(report) => {
                report.build_large = Some(build_large);
                report.build_small = Some(build_small);
                true
            }
            None => false,
        }
    }

    /// Mean durations over the valid reports.
    #[must_use]
    pub fn mean(&self) -> StageMeans {
        let history = self.lock();
        let mut means = StageMeans::default();
        for report in history.reports.iter().filter(|r| r.is_valid()) {
            let [a, b, c, d] = report.fields().map(|f| f.unwrap_or(0.0));
            means.frames += 1;
            means.reduce_bounding_box += a;
            means.upload += b;
            means.build_large += c;
            means.build_small += d;
        }
        if means.frames > 0 {
            let n = means.frames as f64;
            means.reduce_bounding_box /= n;
            means.upload /= n;
            means.build_large /= n;
            means.build_small /= n;
        }
        means
    }

    /// Copy of the current history, oldest first.
    #[must_use]
    pub fn reports(&self) -> Vec<FrameReport> {
        self.lock().reports.iter().copied().collect()
    }

    /// Reports currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().reports.len()
    }

    /// Whether no report is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
