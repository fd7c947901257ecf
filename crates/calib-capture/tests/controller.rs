use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use approx::assert_relative_eq;
use calib_capture::core::{
    CorrespondenceSample, GrayFrame, GrayFrameView, ImageSize, IntrinsicModel, PatternSize,
    PatternSpec,
};
use calib_capture::{
    CalibrationController, CalibrationFailure, CalibrationOutcome, CaptureConfig, CaptureError,
    CaptureEvent, CaptureState, Detection, FrameInput, FrameNaming, FrameOutcome, FrameStorage,
    GeometrySolver, PatternDetector, PngFrameStorage, SolverError, SolverSolution, VisionStage,
    FAILED_RMS,
};
use nalgebra::{Matrix3, Point2};
use tempfile::TempDir;

/// Finds a 3x2 grid whenever the first pixel is non-zero, shifted by ten
/// pixels per grey level so that different levels never look alike.
struct LevelDetector;

impl PatternDetector for LevelDetector {
    fn find_pattern(
        &self,
        frame: &GrayFrameView<'_>,
        pattern: &PatternSpec,
    ) -> Option<Vec<Point2<f32>>> {
        let level = *frame.data.first()?;
        if level == 0 {
            return None;
        }
        let shift = f32::from(level) * 10.0;
        let mut pts = Vec::new();
        for y in 0..pattern.size.height {
            for x in 0..pattern.size.width {
                pts.push(Point2::new(shift + x as f32 * 4.0, shift + y as f32 * 4.0));
            }
        }
        Some(pts)
    }
}

/// Counts solver calls and remembers how many samples each call saw.
struct CountingSolver {
    calls: AtomicUsize,
    last_len: AtomicUsize,
    fail: bool,
}

impl CountingSolver {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            last_len: AtomicUsize::new(0),
            fail,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GeometrySolver for CountingSolver {
    fn solve(
        &self,
        samples: &[CorrespondenceSample],
        image_size: ImageSize,
    ) -> Result<SolverSolution, SolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_len.store(samples.len(), Ordering::SeqCst);
        if self.fail {
            return Err(SolverError::Degenerate("all views coplanar".into()));
        }
        Ok(SolverSolution {
            camera_matrix: Matrix3::new(
                600.0,
                0.0,
                image_size.width as f64 / 2.0,
                0.0,
                610.0,
                image_size.height as f64 / 2.0,
                0.0,
                0.0,
                1.0,
            ),
            distortion_coeffs: vec![-0.1, 0.02, 0.0, 0.0, 0.0],
            rms: 0.25,
        })
    }
}

/// Blocks every solve until the test releases it, so a job can be held in
/// flight while intents are issued.
struct HeldSolver {
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl HeldSolver {
    fn new() -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let solver = Arc::new(Self {
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        (solver, started_rx, release_tx)
    }
}

impl GeometrySolver for HeldSolver {
    fn solve(
        &self,
        _samples: &[CorrespondenceSample],
        _image_size: ImageSize,
    ) -> Result<SolverSolution, SolverError> {
        let _ = self.started.lock().unwrap().send(());
        // bounded so a failing test cannot hang the job thread forever
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10));
        Err(SolverError::Internal("released".into()))
    }
}

fn assert_busy(c: &CalibrationController, busy: CaptureState) {
    let refused = |res: Result<(), CaptureError>| {
        assert!(
            matches!(res, Err(CaptureError::InvalidState { state, .. }) if state == busy),
            "expected refusal while {busy}"
        );
    };
    assert_eq!(c.state(), busy);
    refused(c.start_capture());
    refused(c.stop_capture());
    refused(c.clear_data());
    refused(c.reset_model());
    refused(c.request_calibrate().map(drop));
    refused(c.request_load().map(drop));
}

fn config(dir: &Path) -> CaptureConfig {
    CaptureConfig {
        pattern: PatternSpec {
            size: PatternSize::new(3, 2),
            ..PatternSpec::default()
        },
        min_samples_for_calibrate: 3,
        image_dir: dir.join("frames"),
        ..CaptureConfig::default()
    }
}

fn controller(cfg: CaptureConfig, solver: Arc<CountingSolver>) -> CalibrationController {
    CalibrationController::new(cfg, Arc::new(LevelDetector), solver).expect("controller")
}

/// Feed one frame of the given grey level.
fn feed(c: &CalibrationController, t: f64, index: u64, level: u8) -> FrameOutcome {
    let frame = GrayFrame::filled(32, 24, level);
    c.process_frame(FrameInput::new(t, index, frame.view()))
        .expect("frame processed")
}

fn capture_levels(c: &CalibrationController, levels: impl IntoIterator<Item = u8>) {
    c.start_capture().unwrap();
    for (i, level) in levels.into_iter().enumerate() {
        feed(c, i as f64, i as u64, level);
    }
    c.stop_capture().unwrap();
}

#[test]
fn capture_accepts_distinct_detections_and_persists_them() {
    let dir = TempDir::new().unwrap();
    let c = controller(config(dir.path()), CountingSolver::new(false));

    c.start_capture().unwrap();
    assert_eq!(c.state(), CaptureState::Capturing);
    assert_eq!(feed(&c, 0.0, 0, 1), FrameOutcome::Accepted { sample_count: 1 });
    assert_eq!(feed(&c, 1.0, 1, 0), FrameOutcome::NoPattern);
    assert_eq!(feed(&c, 2.0, 2, 1), FrameOutcome::Duplicate);
    assert_eq!(feed(&c, 3.0, 3, 2), FrameOutcome::Accepted { sample_count: 2 });
    c.stop_capture().unwrap();

    c.persistence().flush();
    assert_eq!(c.persistence().written(), 2);
    let stored = std::fs::read_dir(dir.path().join("frames")).unwrap().count();
    assert_eq!(stored, 2);

    let status = c.status();
    assert_eq!(status.sample_count, 2);
    assert_eq!(status.frames_processed, 4);
    assert_eq!(status.duplicates_rejected, 1);
    assert_eq!(status.image_size, Some(ImageSize::new(32, 24)));
    assert_eq!(status.pending_writes, 0);
}

#[test]
fn sample_count_never_decreases_while_capturing() {
    let dir = TempDir::new().unwrap();
    let c = controller(config(dir.path()), CountingSolver::new(false));
    c.start_capture().unwrap();
    let mut last = 0;
    for (i, level) in [1u8, 1, 0, 2, 3, 3, 0, 4].into_iter().enumerate() {
        feed(&c, i as f64, i as u64, level);
        let count = c.sample_count();
        assert!(count >= last);
        last = count;
    }
    assert_eq!(last, 4);
}

#[test]
fn capture_gate_debounces_detections() {
    let dir = TempDir::new().unwrap();
    let cfg = CaptureConfig {
        min_interval_seconds: 5.0,
        ..config(dir.path())
    };
    let c = controller(cfg, CountingSolver::new(false));
    c.start_capture().unwrap();
    assert!(matches!(feed(&c, 0.0, 0, 1), FrameOutcome::Accepted { .. }));
    assert_eq!(feed(&c, 2.0, 1, 2), FrameOutcome::GatedOut);
    assert!(matches!(feed(&c, 6.0, 2, 3), FrameOutcome::Accepted { .. }));
    assert_eq!(c.status().gated_out, 1);
}

#[test]
fn calibrate_is_refused_below_minimum() {
    let dir = TempDir::new().unwrap();
    let solver = CountingSolver::new(false);
    let cfg = CaptureConfig {
        min_samples_for_calibrate: 30,
        ..config(dir.path())
    };
    let c = controller(cfg, Arc::clone(&solver));
    capture_levels(&c, 1..=10);
    assert_eq!(c.sample_count(), 10);

    let err = c.request_calibrate().unwrap_err();
    assert!(matches!(
        err,
        CaptureError::NotEnoughSamples { have: 10, need: 30 }
    ));
    assert_eq!(c.state(), CaptureState::Idle);
    assert_eq!(solver.calls(), 0);
}

#[test]
fn calibrate_publishes_model_and_writes_intrinsics() {
    let dir = TempDir::new().unwrap();
    let solver = CountingSolver::new(false);
    let intrinsics = dir.path().join("intrinsics.json");
    let cfg = CaptureConfig {
        intrinsics_path: Some(intrinsics.clone()),
        ..config(dir.path())
    };
    let c = controller(cfg, Arc::clone(&solver));
    capture_levels(&c, 1..=4);

    let outcome = c.request_calibrate().unwrap().wait().unwrap();
    assert_eq!(
        outcome,
        CalibrationOutcome::Solved {
            rms: 0.25,
            sample_count: 4
        }
    );
    assert_eq!(c.state(), CaptureState::Idle);
    assert_eq!(c.rms(), Some(0.25));
    assert_eq!(solver.calls(), 1);

    let params = c.model().parameters();
    assert_relative_eq!(params.focal_length_x, 600.0);
    assert_relative_eq!(params.principal_point_x, 16.0);
    assert_relative_eq!(params.dist_coeff_k1, -0.1);

    let saved = IntrinsicModel::load_json(&intrinsics).unwrap();
    assert_eq!(saved, *c.model());
}

#[test]
fn failed_solve_keeps_model_and_reports_failure() {
    let dir = TempDir::new().unwrap();
    let solver = CountingSolver::new(true);
    let c = controller(config(dir.path()), Arc::clone(&solver));
    capture_levels(&c, 1..=3);

    let before = c.model();
    let outcome = c.request_calibrate().unwrap().wait().unwrap();
    assert!(matches!(
        outcome,
        CalibrationOutcome::Failed(CalibrationFailure::Solver(SolverError::Degenerate(_)))
    ));
    assert_eq!(c.rms(), Some(FAILED_RMS));
    assert_eq!(*c.model(), *before);
    assert_eq!(c.state(), CaptureState::Idle);
}

#[test]
fn clear_data_drops_samples_and_residual() {
    let dir = TempDir::new().unwrap();
    let c = controller(config(dir.path()), CountingSolver::new(false));
    capture_levels(&c, 1..=3);
    c.request_calibrate().unwrap().wait().unwrap();
    assert!(c.rms().is_some());

    c.clear_data().unwrap();
    assert_eq!(c.sample_count(), 0);
    assert!(c.samples().is_empty());
    assert_eq!(c.rms(), None);
}

#[test]
fn bulk_load_detects_stored_frames_then_calibrates_once() {
    let dir = TempDir::new().unwrap();
    let frames_dir = dir.path().join("frames");
    std::fs::create_dir_all(&frames_dir).unwrap();
    for (i, level) in [1u8, 0, 2, 0, 3].into_iter().enumerate() {
        let path = frames_dir.join(format!("{:06}.png", i + 1));
        PngFrameStorage
            .write_frame(&GrayFrame::filled(40, 30, level), &path)
            .unwrap();
    }

    let solver = CountingSolver::new(false);
    let cfg = CaptureConfig {
        frame_naming: FrameNaming::Sequential,
        // bulk load always calibrates, whatever the minimum
        min_samples_for_calibrate: 30,
        ..config(dir.path())
    };
    let c = controller(cfg, Arc::clone(&solver));
    let events = c.subscribe();

    let summary = c.request_load().unwrap().wait().unwrap();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.detected, 3);
    assert_eq!(summary.accepted, 3);
    assert_eq!(summary.duplicates, 0);
    assert!(summary.calibration.is_success());
    assert_eq!(solver.calls(), 1);
    assert_eq!(solver.last_len.load(Ordering::SeqCst), 3);
    assert_eq!(c.sample_count(), 3);
    assert_eq!(c.state(), CaptureState::Idle);

    let got: Vec<_> = events.try_iter().collect();
    assert_eq!(got.first(), Some(&CaptureEvent::StateChanged(CaptureState::Loading)));
    assert!(got.contains(&CaptureEvent::LoadProgress { loaded: 5, total: 5 }));
    assert!(got.contains(&CaptureEvent::StateChanged(CaptureState::Idle)));
    assert!(matches!(got.last(), Some(CaptureEvent::LoadFinished(_))));
}

#[test]
fn bulk_load_replaces_live_samples() {
    let dir = TempDir::new().unwrap();
    let c = controller(config(dir.path()), CountingSolver::new(false));
    capture_levels(&c, 1..=2);
    c.persistence().flush();

    // frames written during capture are the ones reloaded
    let summary = c.request_load().unwrap().wait().unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.accepted, 2);
    assert_eq!(c.sample_count(), 2);
}

#[test]
fn bulk_load_keeps_frames_admitted_by_debounce() {
    let dir = TempDir::new().unwrap();
    let cfg = CaptureConfig {
        min_interval_seconds: 5.0,
        ..config(dir.path())
    };
    let c = controller(cfg, CountingSolver::new(false));
    c.start_capture().unwrap();
    for (i, (t, level)) in [(0.0, 1u8), (6.0, 2), (12.0, 3)].into_iter().enumerate() {
        assert!(matches!(
            feed(&c, t, i as u64, level),
            FrameOutcome::Accepted { .. }
        ));
    }
    c.stop_capture().unwrap();
    c.persistence().flush();

    // the frames are written within milliseconds of each other
    let summary = c.request_load().unwrap().wait().unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.detected, 3);
    assert_eq!(summary.accepted, 3);
    assert_eq!(c.sample_count(), 3);
}

#[test]
fn intents_are_refused_while_calibrating() {
    let dir = TempDir::new().unwrap();
    let (solver, started, release) = HeldSolver::new();
    let c = CalibrationController::new(config(dir.path()), Arc::new(LevelDetector), solver)
        .expect("controller");
    capture_levels(&c, 1..=3);

    let job = c.request_calibrate().unwrap();
    started.recv().unwrap();
    assert_busy(&c, CaptureState::Calibrating);

    // frames are still processed but never stored
    assert!(matches!(
        feed(&c, 10.0, 10, 7),
        FrameOutcome::Skipped | FrameOutcome::Detected { .. }
    ));
    assert_eq!(c.sample_count(), 3);

    release.send(()).unwrap();
    assert!(!job.wait().unwrap().is_success());
    assert_eq!(c.state(), CaptureState::Idle);
    assert!(c.start_capture().is_ok());
}

#[test]
fn intents_are_refused_while_loading() {
    let dir = TempDir::new().unwrap();
    let frames_dir = dir.path().join("frames");
    std::fs::create_dir_all(&frames_dir).unwrap();
    for (i, level) in [1u8, 2].into_iter().enumerate() {
        PngFrameStorage
            .write_frame(
                &GrayFrame::filled(40, 30, level),
                &frames_dir.join(format!("{:06}.png", i + 1)),
            )
            .unwrap();
    }
    let (solver, started, release) = HeldSolver::new();
    let cfg = CaptureConfig {
        frame_naming: FrameNaming::Sequential,
        ..config(dir.path())
    };
    let c = CalibrationController::new(cfg, Arc::new(LevelDetector), solver).expect("controller");

    // the load job blocks in its final solve
    let job = c.request_load().unwrap();
    started.recv().unwrap();
    assert_busy(&c, CaptureState::Loading);

    release.send(()).unwrap();
    let summary = job.wait().unwrap();
    assert_eq!(summary.accepted, 2);
    assert_eq!(c.state(), CaptureState::Idle);
}

#[test]
fn missing_frame_is_an_error_and_counted() {
    let dir = TempDir::new().unwrap();
    let c = controller(config(dir.path()), CountingSolver::new(false));
    c.start_capture().unwrap();
    let input = FrameInput {
        timestamp: 0.0,
        frame_index: 0,
        frame: None,
        detection: None,
    };
    assert!(matches!(
        c.process_frame(input),
        Err(CaptureError::MissingInput)
    ));
    assert_eq!(c.status().frames_failed, 1);
    assert_eq!(c.sample_count(), 0);
}

#[test]
fn intents_respect_state() {
    let dir = TempDir::new().unwrap();
    let c = controller(config(dir.path()), CountingSolver::new(false));

    assert!(matches!(
        c.stop_capture(),
        Err(CaptureError::InvalidState {
            state: CaptureState::Idle,
            ..
        })
    ));
    c.start_capture().unwrap();
    assert!(c.start_capture().is_err());
    assert!(c.clear_data().is_err());
    assert!(c.request_calibrate().is_err());
    assert!(c.request_load().is_err());
    assert!(c.reset_model().is_err());
    c.stop_capture().unwrap();
    assert!(c.clear_data().is_ok());
}

#[test]
fn host_detection_bypasses_detector() {
    let dir = TempDir::new().unwrap();
    let c = controller(config(dir.path()), CountingSolver::new(false));
    c.start_capture().unwrap();

    // all-black frame: the built-in detector would find nothing
    let frame = GrayFrame::filled(32, 24, 0);
    let corners = (0..6)
        .map(|i| Point2::new(i as f32 * 5.0, 3.0))
        .collect::<Vec<_>>();
    let input = FrameInput::new(0.0, 0, frame.view())
        .with_detection(Detection::found(corners, PatternSize::new(3, 2)));
    assert_eq!(
        c.process_frame(input).unwrap(),
        FrameOutcome::Accepted { sample_count: 1 }
    );
}

#[test]
fn idle_frames_run_detection_only_when_enabled() {
    let dir = TempDir::new().unwrap();
    let c = controller(config(dir.path()), CountingSolver::new(false));
    assert_eq!(feed(&c, 0.0, 0, 1), FrameOutcome::Skipped);

    let mut cfg = config(dir.path());
    cfg.detection.enabled = true;
    let c = controller(cfg, CountingSolver::new(false));
    assert_eq!(feed(&c, 0.0, 0, 1), FrameOutcome::Detected { found: true });
    assert!(c.status().last_pattern_found);
    assert_eq!(c.sample_count(), 0);
}

#[test]
fn events_follow_capture() {
    let dir = TempDir::new().unwrap();
    let c = controller(config(dir.path()), CountingSolver::new(false));
    let events = c.subscribe();

    c.start_capture().unwrap();
    feed(&c, 0.0, 0, 1);
    c.stop_capture().unwrap();

    let got: Vec<_> = events.try_iter().collect();
    assert_eq!(
        got,
        vec![
            CaptureEvent::StateChanged(CaptureState::Capturing),
            CaptureEvent::SampleCountChanged(1),
            CaptureEvent::StateChanged(CaptureState::Idle),
        ]
    );
}

#[test]
fn saved_intrinsics_are_loaded_at_startup() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("intrinsics.json");
    let mut model = IntrinsicModel::default();
    model.camera_matrix[(0, 0)] = 812.5;
    model.rms = Some(0.3);
    model.write_json(&path).unwrap();

    let cfg = CaptureConfig {
        intrinsics_path: Some(path),
        ..config(dir.path())
    };
    let c = controller(cfg, CountingSolver::new(false));
    assert_eq!(*c.model(), model);
    assert_eq!(c.name(), "Camera Intrinsic Calibration");
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cfg = CaptureConfig {
        dedup_threshold: 0.0,
        ..config(dir.path())
    };
    let res = CalibrationController::new(cfg, Arc::new(LevelDetector), CountingSolver::new(false));
    assert!(matches!(res, Err(CaptureError::Config(_))));
}
