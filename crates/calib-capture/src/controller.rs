//! Capture state machine.
//!
//! The host drives [`CalibrationController::process_frame`] from its
//! real-time thread and issues intents (start/stop capture, clear, calibrate,
//! load) from anywhere. Calibrate and load run on a dedicated job thread;
//! frame writes run on the persistence thread. All state transitions go
//! through one lock, and `Calibrating`/`Loading` exclude capture and each
//! other.
//!
//! Lock order: state, then gate, then store / persistence queue / events.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use calib_capture_core::{
    CorrespondenceSample, GrayFrameView, ImageSize, IntrinsicModel, PatternSpec,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::CaptureConfig;
use crate::detect::{detect_pattern, Detection, PatternDetector};
use crate::error::CaptureError;
use crate::events::{CaptureEvent, EventBus};
use crate::gate::FrameGate;
use crate::persist::{FrameStorage, ImagePersistenceQueue, PngFrameStorage};
use crate::solver::GeometrySolver;
use crate::store::{InsertOutcome, SampleSnapshot, SampleStore};
use crate::worker::{CalibrationFailure, CalibrationOutcome, CalibrationWorker};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    #[default]
    Idle,
    Capturing,
    Calibrating,
    Loading,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Capturing => "capturing",
            CaptureState::Calibrating => "calibrating",
            CaptureState::Loading => "loading",
        };
        f.write_str(name)
    }
}

/// One frame handed over by the host pipeline.
#[derive(Clone, Debug)]
pub struct FrameInput<'a> {
    /// Host monotonic time in seconds.
    pub timestamp: f64,
    pub frame_index: u64,
    pub frame: Option<GrayFrameView<'a>>,
    /// Detection done upstream. When absent the controller runs its own
    /// detector if it needs one.
    pub detection: Option<Detection>,
}

impl<'a> FrameInput<'a> {
    pub fn new(timestamp: f64, frame_index: u64, frame: GrayFrameView<'a>) -> Self {
        Self {
            timestamp,
            frame_index,
            frame: Some(frame),
            detection: None,
        }
    }

    pub fn with_detection(mut self, detection: Detection) -> Self {
        self.detection = Some(detection);
        self
    }
}

/// What happened to one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not capturing and idle detection is off; nothing was done.
    Skipped,
    /// Not capturing; the detector ran for display only.
    Detected { found: bool },
    NoPattern,
    /// Pattern found but held back by the debounce or frame skip.
    GatedOut,
    Duplicate,
    /// Detection could not become a sample (wrong grid, bad point count).
    Rejected,
    Accepted { sample_count: usize },
}

/// Snapshot of everything the host UI shows.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub sample_count: usize,
    /// `None` before the first solve and after `clear_data`; `-1.0` after a
    /// failed solve.
    pub rms: Option<f64>,
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub duplicates_rejected: u64,
    pub gated_out: u64,
    pub last_pattern_found: bool,
    pub image_size: Option<ImageSize>,
    pub pending_writes: usize,
    pub frames_written: u64,
}

/// Result of a bulk reload.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadSummary {
    pub total: usize,
    pub detected: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub calibration: CalibrationOutcome,
}

/// Capability interface of a frame-processing stage.
pub trait VisionStage {
    fn name(&self) -> &str;
    fn process_frame(&self, input: FrameInput<'_>) -> Result<FrameOutcome, CaptureError>;
    fn config(&self) -> &CaptureConfig;
    fn status(&self) -> CaptureStatus;
}

/// Completion handle of a background job.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Block until the job has finished and the controller is idle again.
    pub fn wait(self) -> Result<T, CaptureError> {
        self.rx.recv().map_err(|_| CaptureError::WorkerUnavailable)
    }

    /// Result if the job has already finished.
    pub fn try_result(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

enum Job {
    Calibrate(mpsc::Sender<CalibrationOutcome>),
    Load(mpsc::Sender<LoadSummary>),
}

#[derive(Debug, Default)]
struct Counters {
    frames_processed: AtomicU64,
    frames_failed: AtomicU64,
    duplicates_rejected: AtomicU64,
    gated_out: AtomicU64,
}

struct ControllerInner {
    config: CaptureConfig,
    state: Mutex<CaptureState>,
    gate: Mutex<FrameGate>,
    store: SampleStore,
    persistence: ImagePersistenceQueue,
    worker: CalibrationWorker,
    detector: Arc<dyn PatternDetector>,
    events: EventBus,
    rms: Mutex<Option<f64>>,
    image_size: Mutex<Option<ImageSize>>,
    last_pattern_found: AtomicBool,
    counters: Counters,
}

/// Orchestrates capture, persistence and calibration.
pub struct CalibrationController {
    inner: Arc<ControllerInner>,
    jobs: Option<mpsc::Sender<Job>>,
    job_thread: Option<JoinHandle<()>>,
}

impl CalibrationController {
    /// Build a controller that persists frames as PNG files.
    pub fn new(
        config: CaptureConfig,
        detector: Arc<dyn PatternDetector>,
        solver: Arc<dyn GeometrySolver>,
    ) -> Result<Self, CaptureError> {
        Self::with_frame_storage(config, detector, solver, Arc::new(PngFrameStorage))
    }

    pub fn with_frame_storage(
        config: CaptureConfig,
        detector: Arc<dyn PatternDetector>,
        solver: Arc<dyn GeometrySolver>,
        storage: Arc<dyn FrameStorage>,
    ) -> Result<Self, CaptureError> {
        config.validate()?;
        let gate = FrameGate::new(config.gate_params())?;
        let persistence = ImagePersistenceQueue::with_storage(
            config.image_dir.clone(),
            config.frame_naming,
            storage,
        )?;
        let worker = CalibrationWorker::with_model(solver, initial_model(&config));

        let inner = Arc::new(ControllerInner {
            config,
            state: Mutex::new(CaptureState::Idle),
            gate: Mutex::new(gate),
            store: SampleStore::new(),
            persistence,
            worker,
            detector,
            events: EventBus::default(),
            rms: Mutex::new(None),
            image_size: Mutex::new(None),
            last_pattern_found: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let (jobs, job_rx) = mpsc::channel();
        let runner = Arc::clone(&inner);
        let job_thread = thread::Builder::new()
            .name("calib-capture-jobs".into())
            .spawn(move || runner.run_jobs(job_rx))
            .map_err(CaptureError::Spawn)?;

        Ok(Self {
            inner,
            jobs: Some(jobs),
            job_thread: Some(job_thread),
        })
    }

    pub fn state(&self) -> CaptureState {
        *self.inner.state.lock()
    }

    pub fn sample_count(&self) -> usize {
        self.inner.store.count()
    }

    /// Reported residual; see [`CaptureStatus::rms`].
    pub fn rms(&self) -> Option<f64> {
        *self.inner.rms.lock()
    }

    /// Currently published intrinsic model.
    pub fn model(&self) -> Arc<IntrinsicModel> {
        self.inner.worker.model()
    }

    pub fn samples(&self) -> SampleSnapshot {
        self.inner.store.snapshot()
    }

    pub fn persistence(&self) -> &ImagePersistenceQueue {
        &self.inner.persistence
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<CaptureEvent> {
        self.inner.events.subscribe()
    }

    /// `Idle -> Capturing`.
    pub fn start_capture(&self) -> Result<(), CaptureError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if *state != CaptureState::Idle {
            return Err(CaptureError::InvalidState {
                op: "start capture",
                state: *state,
            });
        }
        inner.gate.lock().reset();
        *state = CaptureState::Capturing;
        inner.announce(CaptureState::Capturing);
        Ok(())
    }

    /// `Capturing -> Idle`.
    pub fn stop_capture(&self) -> Result<(), CaptureError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if *state != CaptureState::Capturing {
            return Err(CaptureError::InvalidState {
                op: "stop capture",
                state: *state,
            });
        }
        *state = CaptureState::Idle;
        inner.announce(CaptureState::Idle);
        Ok(())
    }

    /// Drop every sample and forget the reported residual. Idle only.
    pub fn clear_data(&self) -> Result<(), CaptureError> {
        let inner = &self.inner;
        let state = inner.state.lock();
        if *state != CaptureState::Idle {
            return Err(CaptureError::InvalidState {
                op: "clear data",
                state: *state,
            });
        }
        inner.reset_samples();
        drop(state);
        info!("cleared calibration samples");
        Ok(())
    }

    /// Restore identity intrinsics. Idle only.
    pub fn reset_model(&self) -> Result<(), CaptureError> {
        let state = self.inner.state.lock();
        if *state != CaptureState::Idle {
            return Err(CaptureError::InvalidState {
                op: "reset the model",
                state: *state,
            });
        }
        self.inner.worker.reset_model();
        Ok(())
    }

    /// `Idle -> Calibrating`, solve in the background, then back to `Idle`.
    ///
    /// Refused without touching the solver when not idle or when fewer than
    /// `min_samples_for_calibrate` samples are stored.
    pub fn request_calibrate(&self) -> Result<JobHandle<CalibrationOutcome>, CaptureError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if *state != CaptureState::Idle {
            return Err(CaptureError::InvalidState {
                op: "calibrate",
                state: *state,
            });
        }
        let have = inner.store.count();
        let need = inner.config.min_samples_for_calibrate;
        if have < need {
            info!("calibration refused: {have} of {need} samples");
            return Err(CaptureError::NotEnoughSamples { have, need });
        }

        let (tx, rx) = mpsc::channel();
        *state = CaptureState::Calibrating;
        inner.announce(CaptureState::Calibrating);
        if !self.submit(Job::Calibrate(tx)) {
            *state = CaptureState::Idle;
            inner.announce(CaptureState::Idle);
            return Err(CaptureError::WorkerUnavailable);
        }
        Ok(JobHandle { rx })
    }

    /// `Idle -> Loading`: clear the store, re-detect every stored frame in
    /// capture order, calibrate once, then back to `Idle`.
    pub fn request_load(&self) -> Result<JobHandle<LoadSummary>, CaptureError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if *state != CaptureState::Idle {
            return Err(CaptureError::InvalidState {
                op: "load images",
                state: *state,
            });
        }

        let (tx, rx) = mpsc::channel();
        *state = CaptureState::Loading;
        inner.announce(CaptureState::Loading);
        inner.reset_samples();
        if !self.submit(Job::Load(tx)) {
            *state = CaptureState::Idle;
            inner.announce(CaptureState::Idle);
            return Err(CaptureError::WorkerUnavailable);
        }
        Ok(JobHandle { rx })
    }

    fn submit(&self, job: Job) -> bool {
        self.jobs.as_ref().is_some_and(|tx| tx.send(job).is_ok())
    }
}

impl VisionStage for CalibrationController {
    fn name(&self) -> &str {
        "Camera Intrinsic Calibration"
    }

    /// Live capture cycle: gate, deduplicate, insert, persist.
    fn process_frame(&self, input: FrameInput<'_>) -> Result<FrameOutcome, CaptureError> {
        let inner = &self.inner;
        inner
            .counters
            .frames_processed
            .fetch_add(1, Ordering::Relaxed);

        let Some(frame) = input.frame else {
            inner.counters.frames_failed.fetch_add(1, Ordering::Relaxed);
            warn!("cannot run intrinsic calibration: greyscale frame is not available");
            return Err(CaptureError::MissingInput);
        };
        *inner.image_size.lock() = Some(frame.size());

        let capturing = *inner.state.lock() == CaptureState::Capturing;
        if !capturing && !inner.config.detection.enabled {
            return Ok(FrameOutcome::Skipped);
        }

        // detection is the expensive part and runs without any lock
        let detection = input.detection.unwrap_or_else(|| {
            detect_pattern(
                inner.detector.as_ref(),
                &frame,
                &inner.config.pattern,
                &inner.config.detection,
                Some(inner.config.detection.reduced_image_width),
            )
        });
        let found = detection.found;
        inner.last_pattern_found.store(found, Ordering::Relaxed);

        if !capturing {
            return Ok(FrameOutcome::Detected { found });
        }

        let state = inner.state.lock();
        if *state != CaptureState::Capturing {
            return Ok(FrameOutcome::Detected { found });
        }
        if !found {
            return Ok(FrameOutcome::NoPattern);
        }
        if !inner
            .gate
            .lock()
            .admit(input.timestamp, found, input.frame_index)
        {
            inner.counters.gated_out.fetch_add(1, Ordering::Relaxed);
            debug!("frame {} held back by capture gate", input.frame_index);
            return Ok(FrameOutcome::GatedOut);
        }

        let outcome = inner.accept(detection, input.timestamp);
        if matches!(outcome, FrameOutcome::Accepted { .. }) {
            inner.persistence.enqueue(frame.to_owned_frame());
        }
        drop(state);
        Ok(outcome)
    }

    fn config(&self) -> &CaptureConfig {
        &self.inner.config
    }

    fn status(&self) -> CaptureStatus {
        let inner = &self.inner;
        CaptureStatus {
            state: *inner.state.lock(),
            sample_count: inner.store.count(),
            rms: *inner.rms.lock(),
            frames_processed: inner.counters.frames_processed.load(Ordering::Relaxed),
            frames_failed: inner.counters.frames_failed.load(Ordering::Relaxed),
            duplicates_rejected: inner.counters.duplicates_rejected.load(Ordering::Relaxed),
            gated_out: inner.counters.gated_out.load(Ordering::Relaxed),
            last_pattern_found: inner.last_pattern_found.load(Ordering::Relaxed),
            image_size: *inner.image_size.lock(),
            pending_writes: inner.persistence.pending(),
            frames_written: inner.persistence.written(),
        }
    }
}

impl Drop for CalibrationController {
    fn drop(&mut self) {
        // closing the channel ends the job loop after the current job
        self.jobs.take();
        if let Some(handle) = self.job_thread.take() {
            if handle.join().is_err() {
                error!("calibration job thread panicked");
            }
        }
    }
}

impl ControllerInner {
    fn announce(&self, state: CaptureState) {
        info!("capture state: {state}");
        self.events.emit(CaptureEvent::StateChanged(state));
    }

    /// Caller holds the state lock.
    fn reset_samples(&self) {
        self.store.clear();
        *self.rms.lock() = None;
        self.events.emit(CaptureEvent::DataCleared);
        self.events.emit(CaptureEvent::SampleCountChanged(0));
    }

    /// Turn an admitted detection into a sample unless it is redundant.
    fn accept(&self, detection: Detection, timestamp: f64) -> FrameOutcome {
        let pattern = PatternSpec {
            size: detection.pattern_size,
            ..self.config.pattern
        };
        let sample =
            match CorrespondenceSample::from_detection(detection.image_points, &pattern, timestamp)
            {
                Ok(sample) => sample,
                Err(err) => {
                    warn!("dropping detection: {err}");
                    return FrameOutcome::Rejected;
                }
            };

        match self
            .store
            .insert_unless_duplicate(sample, self.config.dedup_threshold)
        {
            Ok(InsertOutcome::Inserted { count }) => {
                info!("added calibration sample #{count}");
                self.events.emit(CaptureEvent::SampleCountChanged(count));
                FrameOutcome::Accepted {
                    sample_count: count,
                }
            }
            Ok(InsertOutcome::Duplicate) => {
                self.counters
                    .duplicates_rejected
                    .fetch_add(1, Ordering::Relaxed);
                debug!("filtered near-duplicate sample");
                FrameOutcome::Duplicate
            }
            Err(err) => {
                warn!("dropping detection: {err}");
                FrameOutcome::Rejected
            }
        }
    }

    fn run_jobs(&self, jobs: mpsc::Receiver<Job>) {
        for job in jobs {
            match job {
                Job::Calibrate(reply) => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_calibration()))
                        .unwrap_or_else(|_| {
                            CalibrationOutcome::Failed(CalibrationFailure::Panicked(
                                "calibration job".into(),
                            ))
                        });
                    self.finish(CaptureState::Calibrating);
                    let _ = reply.send(outcome);
                }
                Job::Load(reply) => {
                    let summary = panic::catch_unwind(AssertUnwindSafe(|| self.run_load()));
                    self.finish(CaptureState::Loading);
                    match summary {
                        Ok(summary) => {
                            self.events.emit(CaptureEvent::LoadFinished(summary.clone()));
                            let _ = reply.send(summary);
                        }
                        // dropping `reply` makes the caller's wait fail
                        Err(_) => error!("bulk load aborted by a panic"),
                    }
                }
            }
        }
        debug!("job thread exiting");
    }

    fn finish(&self, busy: CaptureState) {
        let mut state = self.state.lock();
        if *state == busy {
            *state = CaptureState::Idle;
            self.announce(CaptureState::Idle);
        }
    }

    fn run_calibration(&self) -> CalibrationOutcome {
        let samples = self.store.snapshot();
        let image_size = (*self.image_size.lock()).unwrap_or(ImageSize::new(0, 0));
        self.calibrate_with(&samples, image_size)
    }

    fn calibrate_with(
        &self,
        samples: &[CorrespondenceSample],
        image_size: ImageSize,
    ) -> CalibrationOutcome {
        self.events.emit(CaptureEvent::CalibrationStarted {
            samples: samples.len(),
        });
        let outcome = self.worker.calibrate(samples, image_size);
        *self.rms.lock() = Some(outcome.reported_rms());

        if outcome.is_success() {
            if let Some(path) = &self.config.intrinsics_path {
                if let Err(err) = self.worker.model().write_json(path) {
                    warn!("failed to write intrinsics to {}: {err}", path.display());
                }
            }
        }
        self.events
            .emit(CaptureEvent::CalibrationFinished(outcome.clone()));
        outcome
    }

    #[cfg_attr(feature = "tracing", instrument(level = "info", skip(self)))]
    fn run_load(&self) -> LoadSummary {
        let frames = self.persistence.read_images(&self.config.image_dir);
        let total = frames.len();
        self.events
            .emit(CaptureEvent::LoadProgress { loaded: 0, total });

        // every stored frame already passed the live gate, so only
        // deduplication applies here
        let interval = self.config.min_interval_seconds;
        let (mut detected, mut accepted, mut duplicates, mut rejected) = (0, 0, 0, 0);
        let mut image_size = None;

        for (i, loaded) in frames.into_iter().enumerate() {
            let frame = loaded.frame.view();
            image_size = Some(frame.size());
            let detection = detect_pattern(
                self.detector.as_ref(),
                &frame,
                &self.config.pattern,
                &self.config.detection,
                None,
            );

            if detection.found {
                detected += 1;
                let timestamp = loaded.captured_at.unwrap_or(i as f64 * interval);
                match self.accept(detection, timestamp) {
                    FrameOutcome::Accepted { .. } => accepted += 1,
                    FrameOutcome::Duplicate => duplicates += 1,
                    _ => rejected += 1,
                }
            } else {
                debug!("no pattern detected in {}", loaded.path.display());
            }
            self.events.emit(CaptureEvent::LoadProgress {
                loaded: i + 1,
                total,
            });
        }

        info!(
            "loaded {total} frames: {detected} with pattern, {accepted} added, \
             {duplicates} filtered"
        );
        let image_size = image_size
            .or(*self.image_size.lock())
            .unwrap_or(ImageSize::new(0, 0));
        let calibration = self.calibrate_with(&self.store.snapshot(), image_size);

        LoadSummary {
            total,
            detected,
            accepted,
            duplicates,
            rejected,
            calibration,
        }
    }
}

fn initial_model(config: &CaptureConfig) -> IntrinsicModel {
    let Some(path) = config.intrinsics_path.as_deref().filter(|p| p.exists()) else {
        return IntrinsicModel::default();
    };
    match IntrinsicModel::load_json(path) {
        Ok(model) => {
            info!("loaded intrinsics from {}", path.display());
            model
        }
        Err(err) => {
            warn!("ignoring intrinsics at {}: {err}", path.display());
            IntrinsicModel::default()
        }
    }
}
