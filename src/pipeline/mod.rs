//! Background build worker with ring-buffered frames.
//!
//! [`FramePipeline::submit`] runs the prepare stages on the calling thread,
//! into the frame's ring slot, and hands the slot to the `atomgrid-builder`
//! thread for the cell passes. Finished indices come back over a channel; a
//! [`BuildSummary`] of the newest frame is also published lock-free for
//! telemetry readers that never touch the buffers.
//!
//! The first build error halts the worker. It is returned once, and every
//! later call reports [`BuildError::WorkerDisconnected`].

pub mod ring;

use std::collections::VecDeque;
use std::sync::{mpsc, Arc};

pub use ring::{BufferRing, SlotLease};
use serde::Serialize;

use crate::atom::{Atom, RadiusTable};
use crate::bvh::{
    BuildTimings, BvhBuilder, DispatchArguments, GridGeometry, PreparedFrame,
    SparseIndex,
};
use crate::compute::{ComputeBackend, RayonBackend};
use crate::error::{BuildError, Stage};
use crate::options::Options;
use crate::util::frame_report::FrameReporter;

/// What the worker publishes after each successful build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildSummary {
    /// Frame identifier.
    pub frame_id: u64,
    /// Ring slot holding the frame's buffers.
    pub slot: usize,
    /// Atoms indexed.
    pub atom_count: usize,
    /// Grid placement.
    pub geometry: GridGeometry,
    /// Occupancy, pool sizes and occupied bounds.
    pub dispatch: DispatchArguments,
    /// Build-pass durations.
    pub timings: BuildTimings,
}

impl BuildSummary {
    /// Summary of a finished index.
    #[must_use]
    pub fn of(index: &SparseIndex) -> Self {
        Self {
            frame_id: index.frame_id(),
            slot: index.slot(),
            atom_count: index.atom_count(),
            geometry: *index.geometry(),
            dispatch: *index.dispatch(),
            timings: index.timings(),
        }
    }
}

enum BuildRequest {
    Build(PreparedFrame),
    Shutdown,
}

type BuildResult = Result<SparseIndex, BuildError>;

/// Two-thread frame pipeline over an N-slot [`BufferRing`].
pub struct FramePipeline<B: ComputeBackend + 'static = RayonBackend> {
    builder: Arc<BvhBuilder<B>>,
    ring: Arc<BufferRing>,
    reporter: FrameReporter,
    request_tx: mpsc::Sender<BuildRequest>,
    result_rx: mpsc::Receiver<BuildResult>,
    summary: triple_buffer::Output<Option<BuildSummary>>,
    thread: Option<std::thread::JoinHandle<()>>,
    finished: VecDeque<BuildResult>,
    next_frame: u64,
    in_flight: usize,
    halted: bool,
}

impl FramePipeline<RayonBackend> {
    /// Pipeline with a rayon builder configured from `options`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if the options are invalid or a thread fails
    /// to spawn.
    pub fn new(options: Options, radii: RadiusTable) -> Result<Self, BuildError> {
        Self::with_builder(BvhBuilder::new(options, radii)?)
    }
}

impl<B: ComputeBackend + 'static> FramePipeline<B> {
    /// Pipeline around an existing builder.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ThreadSpawn`] if the worker fails to spawn.
    pub fn with_builder(builder: BvhBuilder<B>) -> Result<Self, BuildError> {
        let options = builder.options();
        let ring = BufferRing::new(options.pipeline.ring_slots as usize);
        let reporter =
            FrameReporter::new(options.reporting.history_size as usize);
        let log_performance = options.reporting.log_performance;
        let builder = Arc::new(builder);

        let (request_tx, request_rx) = mpsc::channel::<BuildRequest>();
        let (result_tx, result_rx) = mpsc::channel::<BuildResult>();
        let (summary_input, summary_output) = triple_buffer::triple_buffer(&None);

        let thread = {
            let builder = Arc::clone(&builder);
            let reporter = reporter.clone();
            std::thread::Builder::new()
                .name("atomgrid-builder".into())
                .spawn(move || {
                    Self::thread_loop(
                        &builder,
                        &reporter,
                        log_performance,
                        &request_rx,
                        &result_tx,
                        summary_input,
                    );
                })
                .map_err(BuildError::ThreadSpawn)?
        };
        log::debug!(
            "frame pipeline started with {} ring slots",
            ring.len()
        );

        Ok(Self {
            builder,
            ring,
            reporter,
            request_tx,
            result_rx,
            summary: summary_output,
            thread: Some(thread),
            finished: VecDeque::new(),
            next_frame: 0,
            in_flight: 0,
            halted: false,
        })
    }

    /// The shared builder.
    #[must_use]
    pub fn builder(&self) -> &BvhBuilder<B> {
        &self.builder
    }

    /// The buffer ring.
    #[must_use]
    pub fn ring(&self) -> &Arc<BufferRing> {
        &self.ring
    }

    /// Per-frame timing history.
    #[must_use]
    pub fn reporter(&self) -> &FrameReporter {
        &self.reporter
    }

    /// Identifier the next submitted frame receives.
    #[must_use]
    pub fn next_frame_id(&self) -> u64 {
        self.next_frame
    }

    /// Frames handed to the worker whose result has not been received.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Submit one frame of atoms, returning its frame id.
    ///
    /// Blocks while the worker still builds into the frame's slot. Unread
    /// results that hold the slot are dropped in favor of the new frame.
    ///
    /// # Errors
    ///
    /// Returns the prepare-stage error for this frame, the worker's halting
    /// error if it has not been returned yet, or
    /// [`BuildError::WorkerDisconnected`] once the worker has stopped. If a
    /// [`SparseIndex`] the caller still holds occupies the slot and nothing
    /// is in flight, returns [`BuildError::ResourceExhaustion`] for
    /// `"free ring slots"` instead of waiting on it.
    pub fn submit(&mut self, atoms: &[Atom]) -> Result<u64, BuildError> {
        self.check_running()?;
        let frame_id = self.next_frame;
        self.next_frame += 1;

        let lease = self.acquire(frame_id)?;
        let prepared = self.builder.prepare(atoms, lease)?;
        let timings = prepared.timings();
        self.reporter.begin_frame(
            frame_id,
            timings.reduce_bounding_box,
            timings.upload,
        );
        if self.request_tx.send(BuildRequest::Build(prepared)).is_err() {
            self.drain();
            self.halted = true;
            return Err(self
                .take_error()
                .unwrap_or(BuildError::WorkerDisconnected));
        }
        self.in_flight += 1;
        Ok(frame_id)
    }

    /// Newest finished index, if any, without blocking. Older unread
    /// results are dropped.
    ///
    /// # Errors
    ///
    /// Returns the worker's halting error, once.
    pub fn try_latest(&mut self) -> Result<Option<SparseIndex>, BuildError> {
        self.drain();
        self.take_latest()
    }

    /// Wait for every submitted frame, then return the newest index.
    ///
    /// # Errors
    ///
    /// Returns the worker's halting error, once.
    pub fn wait_latest(&mut self) -> Result<Option<SparseIndex>, BuildError> {
        while self.in_flight > 0 {
            if !self.receive_blocking() {
                break;
            }
        }
        self.take_latest()
    }

    /// Summary of the newest successful build, read lock-free.
    pub fn latest_summary(&mut self) -> Option<BuildSummary> {
        self.summary.read().clone()
    }

    /// Stop the worker and wait for it to finish.
    pub fn shutdown(&mut self) {
        let _ = self.request_tx.send(BuildRequest::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    fn check_running(&mut self) -> Result<(), BuildError> {
        self.drain();
        if !self.halted {
            return Ok(());
        }
        Err(self.take_error().unwrap_or(BuildError::WorkerDisconnected))
    }

    /// Lease the slot for `frame_id`, releasing unread results that hold it
    /// and waiting on the worker while it still builds into it.
    fn acquire(&mut self, frame_id: u64) -> Result<SlotLease, BuildError> {
        let slot = self.ring.slot_for(frame_id);
        loop {
            if let Some(lease) = self.ring.try_acquire(frame_id)? {
                return Ok(lease);
            }
            let before = self.finished.len();
            self.finished
                .retain(|r| !matches!(r, Ok(index) if index.slot() == slot));
            if self.finished.len() < before {
                log::debug!(
                    "frame {frame_id} reclaimed slot {slot} from an unread result"
                );
                continue;
            }
            if self.in_flight == 0 {
                // Only an index outside the pipeline can hold the slot now.
                return Err(BuildError::exhausted(
                    Stage::Pipeline,
                    "free ring slots",
                    1,
                    0,
                ));
            }
            if !self.receive_blocking() {
                return Err(self
                    .take_error()
                    .unwrap_or(BuildError::WorkerDisconnected));
            }
        }
    }

    /// Move every result already sent into `finished`.
    fn drain(&mut self) {
        while let Ok(result) = self.result_rx.try_recv() {
            self.receive(result);
        }
    }

    fn receive(&mut self, result: BuildResult) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if result.is_err() {
            self.halted = true;
        }
        self.finished.push_back(result);
    }

    /// Block for one result. Returns `false` once the worker is gone.
    fn receive_blocking(&mut self) -> bool {
        match self.result_rx.recv() {
            Ok(result) => {
                self.receive(result);
                true
            }
            Err(mpsc::RecvError) => {
                self.in_flight = 0;
                self.halted = true;
                false
            }
        }
    }

    fn take_error(&mut self) -> Option<BuildError> {
        let position = self.finished.iter().position(Result::is_err)?;
        self.finished.remove(position).and_then(Result::err)
    }

    fn take_latest(&mut self) -> Result<Option<SparseIndex>, BuildError> {
        if let Some(err) = self.take_error() {
            self.finished.clear();
            return Err(err);
        }
        let latest = self.finished.pop_back().transpose();
        self.finished.clear();
        latest
    }

    fn thread_loop(
        builder: &BvhBuilder<B>,
        reporter: &FrameReporter,
        log_performance: bool,
        request_rx: &mpsc::Receiver<BuildRequest>,
        result_tx: &mpsc::Sender<BuildResult>,
        mut summary_input: triple_buffer::Input<Option<BuildSummary>>,
    ) {
        while let Ok(request) = request_rx.recv() {
            let prepared = match request {
                BuildRequest::Shutdown => break,
                BuildRequest::Build(prepared) => prepared,
            };
            let frame_id = prepared.frame_id();
            let result = builder.build(prepared);
            let failed = match &result {
                Ok(index) => {
                    let timings = index.timings();
                    let _ = reporter.record_build(
                        frame_id,
                        timings.build_large,
                        timings.build_small,
                    );
                    summary_input.write(Some(BuildSummary::of(index)));
                    if log_performance {
                        log::info!(
                            "frame {frame_id} (us) {}",
                            reporter.mean().summary_line()
                        );
                    }
                    false
                }
                Err(err) => {
                    log::error!("frame {frame_id} failed, builder halted: {err}");
                    true
                }
            };
            if result_tx.send(result).is_err() || failed {
                break;
            }
        }
    }
}

impl<B: ComputeBackend + 'static> Drop for FramePipeline<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use glam::Vec3;

    use super::*;
    use crate::compute::SerialBackend;
    use crate::error::ErrorKind;

    fn pipeline(options: Options) -> FramePipeline<SerialBackend> {
        let builder = BvhBuilder::with_backend(
            options,
            RadiusTable::covalent(),
            SerialBackend,
        )
        .unwrap();
        FramePipeline::with_builder(builder).unwrap()
    }

    fn cluster(offset: f32, count: usize) -> Vec<Atom> {
        (0..count)
            .map(|i| {
                let t = i as f32 * 0.15;
                Atom::new(Vec3::new(offset + t, 0.3 * t, -0.2 * t), 6)
            })
            .collect()
    }

    #[test]
    fn builds_frames_in_the_background() {
        let mut pipeline = pipeline(Options::default());
        assert_eq!(pipeline.submit(&cluster(0.0, 20)).unwrap(), 0);
        assert_eq!(pipeline.submit(&cluster(1.0, 40)).unwrap(), 1);
        let index = pipeline.wait_latest().unwrap().unwrap();
        assert_eq!(index.frame_id(), 1);
        assert_eq!(index.atom_count(), 40);
        index.validate().unwrap();
        assert_eq!(pipeline.in_flight(), 0);

        let summary = pipeline.latest_summary().unwrap();
        assert_eq!(summary.frame_id, 1);
        assert_eq!(summary.dispatch, *index.dispatch());
    }

    #[test]
    fn reporter_gets_both_halves_of_each_frame() {
        let mut pipeline = pipeline(Options::default());
        for _ in 0..3 {
            let _ = pipeline.submit(&cluster(0.0, 10)).unwrap();
        }
        let _ = pipeline.wait_latest().unwrap();
        let reports = pipeline.reporter().reports();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.is_valid()));
        assert_eq!(pipeline.reporter().mean().frames, 3);
    }

    #[test]
    fn more_frames_than_slots_recycle_unread_results() {
        let mut options = Options::default();
        options.pipeline.ring_slots = 2;
        let mut pipeline = pipeline(options);
        for frame in 0..6 {
            assert_eq!(pipeline.submit(&cluster(0.0, 12)).unwrap(), frame);
        }
        let index = pipeline.wait_latest().unwrap().unwrap();
        assert_eq!(index.frame_id(), 5);
        assert_eq!(index.slot(), 1);
    }

    #[test]
    fn prepare_errors_do_not_halt_the_worker() {
        let mut pipeline = pipeline(Options::default());
        let err = pipeline.submit(&[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        let frame = pipeline.submit(&cluster(0.0, 5)).unwrap();
        let index = pipeline.wait_latest().unwrap().unwrap();
        assert_eq!(index.frame_id(), frame);
    }

    #[test]
    fn build_error_halts_the_worker() {
        let mut options = Options::default();
        options.limits.max_occupied_large_cells = 1;
        let mut pipeline = pipeline(options);
        // Two clusters far apart occupy at least two large cells.
        let mut atoms = cluster(0.0, 4);
        atoms.extend(cluster(20.0, 4));
        let _ = pipeline.submit(&atoms).unwrap();

        let err = pipeline.wait_latest().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
        let err = pipeline.submit(&cluster(0.0, 4)).unwrap_err();
        assert!(matches!(err, BuildError::WorkerDisconnected));
        assert!(pipeline.latest_summary().is_none());
    }

    #[test]
    fn next_submit_returns_the_halting_error() {
        let mut options = Options::default();
        options.limits.max_occupied_large_cells = 1;
        let mut pipeline = pipeline(options);
        let mut atoms = cluster(0.0, 4);
        atoms.extend(cluster(20.0, 4));
        let _ = pipeline.submit(&atoms).unwrap();
        while !pipeline.thread.as_ref().unwrap().is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }

        let err = pipeline.submit(&cluster(0.0, 4)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(err.stage(), Some(Stage::LargeCellCompact));
        let err = pipeline.submit(&cluster(0.0, 4)).unwrap_err();
        assert!(matches!(err, BuildError::WorkerDisconnected));
        assert!(pipeline.try_latest().unwrap().is_none());
    }

    #[test]
    fn held_index_fails_submit_instead_of_blocking() {
        let mut options = Options::default();
        options.pipeline.ring_slots = 1;
        let mut pipeline = pipeline(options);
        let _ = pipeline.submit(&cluster(0.0, 6)).unwrap();
        let held = pipeline.wait_latest().unwrap().unwrap();

        let err = pipeline.submit(&cluster(0.0, 6)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
        assert_eq!(err.stage(), Some(Stage::Pipeline));

        drop(held);
        let frame = pipeline.submit(&cluster(0.0, 6)).unwrap();
        let index = pipeline.wait_latest().unwrap().unwrap();
        assert_eq!(index.frame_id(), frame);
    }

    #[test]
    fn nothing_submitted_means_nothing_latest() {
        let mut pipeline = pipeline(Options::default());
        assert!(pipeline.try_latest().unwrap().is_none());
        assert!(pipeline.wait_latest().unwrap().is_none());
    }
}
