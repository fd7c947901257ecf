//! Asynchronous persistence of captured frames and chronological reload.
//!
//! `enqueue` only touches an in-memory FIFO; a dedicated drain thread pops
//! one task at a time and performs the write with the queue unlocked.
//! File stems are fixed-width integers, so lexicographic order of the
//! directory listing equals capture order.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use calib_capture_core::GrayFrame;
use image::ImageReader;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug)]
pub enum PersistError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("frame buffer does not match {width}x{height}")]
    InvalidBuffer { width: usize, height: usize },
}

/// File naming scheme for persisted frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameNaming {
    /// Wall-clock nanoseconds, zero padded to 20 digits.
    #[default]
    Timestamp,
    /// Running index, zero padded to 6 digits (legacy layout).
    Sequential,
}

impl FrameNaming {
    fn stem(self, key: u64) -> String {
        match self {
            FrameNaming::Timestamp => format!("{key:020}"),
            FrameNaming::Sequential => format!("{key:06}"),
        }
    }

    /// Capture time in seconds encoded in a timestamp-named file.
    pub fn capture_time(self, path: &Path) -> Option<f64> {
        match self {
            FrameNaming::Timestamp => parse_stem(path).map(|ns| ns as f64 * 1e-9),
            FrameNaming::Sequential => None,
        }
    }
}

fn parse_stem(path: &Path) -> Option<u64> {
    let stem = path.file_stem().and_then(OsStr::to_str)?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Generates strictly increasing, collision-free keys.
#[derive(Debug)]
struct FrameNamer {
    naming: FrameNaming,
    last: Option<u64>,
}

impl FrameNamer {
    fn next_key(&mut self) -> u64 {
        let key = match (self.naming, self.last) {
            (FrameNaming::Timestamp, Some(last)) => now_nanos().max(last.saturating_add(1)),
            (FrameNaming::Timestamp, None) => now_nanos(),
            (FrameNaming::Sequential, Some(last)) => last.saturating_add(1),
            (FrameNaming::Sequential, None) => 0,
        };
        self.last = Some(key);
        key
    }
}

/// Reads and writes single frames. The default is PNG through `image`.
pub trait FrameStorage: Send + Sync {
    /// File extension (without the dot) of written frames.
    fn extension(&self) -> &str;
    fn write_frame(&self, frame: &GrayFrame, path: &Path) -> Result<(), PersistError>;
    /// Load a frame, converting to 8-bit greyscale.
    fn read_frame(&self, path: &Path) -> Result<GrayFrame, PersistError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PngFrameStorage;

impl FrameStorage for PngFrameStorage {
    fn extension(&self) -> &str {
        "png"
    }

    fn write_frame(&self, frame: &GrayFrame, path: &Path) -> Result<(), PersistError> {
        let invalid = || PersistError::InvalidBuffer {
            width: frame.width,
            height: frame.height,
        };
        let w = u32::try_from(frame.width).map_err(|_| invalid())?;
        let h = u32::try_from(frame.height).map_err(|_| invalid())?;
        let img = image::GrayImage::from_raw(w, h, frame.data.clone()).ok_or_else(invalid)?;
        img.save(path)?;
        Ok(())
    }

    fn read_frame(&self, path: &Path) -> Result<GrayFrame, PersistError> {
        let img = ImageReader::open(path)?
            .with_guessed_format()?
            .decode()?
            .to_luma8();
        let (w, h) = img.dimensions();
        GrayFrame::from_raw(w as usize, h as usize, img.into_raw()).ok_or(
            PersistError::InvalidBuffer {
                width: w as usize,
                height: h as usize,
            },
        )
    }
}

/// One frame waiting to be written.
#[derive(Clone, Debug)]
pub struct PersistTask {
    pub frame: GrayFrame,
    pub target_path: PathBuf,
}

/// A frame read back from the persistence directory.
#[derive(Clone, Debug)]
pub struct LoadedFrame {
    pub path: PathBuf,
    pub frame: GrayFrame,
    /// Capture time from the file name, when the naming scheme carries one.
    pub captured_at: Option<f64>,
}

#[derive(Debug)]
struct QueueState {
    tasks: VecDeque<PersistTask>,
    namer: FrameNamer,
}

struct QueueShared {
    state: Mutex<QueueState>,
    // queued + in flight
    pending: Mutex<usize>,
    idle: Condvar,
    storage: Arc<dyn FrameStorage>,
    written: AtomicU64,
    failed: AtomicU64,
}

impl QueueShared {
    fn pop(&self) -> Option<PersistTask> {
        self.state.lock().tasks.pop_front()
    }

    /// Write until the queue is empty. The lock is released before each write.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all))]
    fn drain(&self) {
        while let Some(task) = self.pop() {
            self.write(&task);
            let mut pending = self.pending.lock();
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                self.idle.notify_all();
            }
        }
    }

    fn write(&self, task: &PersistTask) {
        let res = match task.target_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
            _ => Ok(()),
        }
        .map_err(PersistError::from)
        .and_then(|()| self.storage.write_frame(&task.frame, &task.target_path));

        match res {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
                debug!("saved frame {}", task.target_path.display());
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "failed to save frame {}: {err}",
                    task.target_path.display()
                );
            }
        }
    }
}

/// FIFO of frames to write, drained by its own background thread.
pub struct ImagePersistenceQueue {
    dir: PathBuf,
    naming: FrameNaming,
    shared: Arc<QueueShared>,
    wake: Option<mpsc::Sender<()>>,
    drain_thread: Option<JoinHandle<()>>,
}

impl ImagePersistenceQueue {
    /// Start a queue writing PNG frames into `dir`.
    pub fn new(dir: impl Into<PathBuf>, naming: FrameNaming) -> Result<Self, PersistError> {
        Self::with_storage(dir, naming, Arc::new(PngFrameStorage))
    }

    pub fn with_storage(
        dir: impl Into<PathBuf>,
        naming: FrameNaming,
        storage: Arc<dyn FrameStorage>,
    ) -> Result<Self, PersistError> {
        let dir = dir.into();
        // continue after whatever is already on disk
        let last = frame_paths(&dir)
            .ok()
            .and_then(|paths| paths.iter().filter_map(|p| parse_stem(p)).max());

        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                namer: FrameNamer { naming, last },
            }),
            pending: Mutex::new(0),
            idle: Condvar::new(),
            storage,
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let (wake, wake_rx) = mpsc::channel::<()>();
        let worker = Arc::clone(&shared);
        let drain_thread = thread::Builder::new()
            .name("calib-capture-persist".into())
            .spawn(move || {
                while wake_rx.recv().is_ok() {
                    worker.drain();
                }
                worker.drain();
            })?;

        Ok(Self {
            dir,
            naming,
            shared,
            wake: Some(wake),
            drain_thread: Some(drain_thread),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn naming(&self) -> FrameNaming {
        self.naming
    }

    /// Queue a frame for writing and return its target path. Never blocks on I/O.
    pub fn enqueue(&self, frame: GrayFrame) -> PathBuf {
        *self.shared.pending.lock() += 1;
        let target_path = {
            let mut state = self.shared.state.lock();
            let key = state.namer.next_key();
            let path = self.dir.join(format!(
                "{}.{}",
                self.naming.stem(key),
                self.shared.storage.extension()
            ));
            state.tasks.push_back(PersistTask {
                frame,
                target_path: path.clone(),
            });
            path
        };

        let sent = self.wake.as_ref().is_some_and(|tx| tx.send(()).is_ok());
        if !sent {
            warn!(
                "persistence thread is gone; {} will not be written",
                target_path.display()
            );
        }
        target_path
    }

    /// Block until every frame enqueued so far has been written or failed.
    pub fn flush(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    /// Frames queued or being written.
    pub fn pending(&self) -> usize {
        *self.shared.pending.lock()
    }

    pub fn written(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }

    /// Load every stored frame from `dir` in chronological order.
    pub fn read_images(&self, dir: &Path) -> Vec<LoadedFrame> {
        read_images(dir, self.shared.storage.as_ref(), self.naming)
    }
}

impl Drop for ImagePersistenceQueue {
    fn drop(&mut self) {
        // closing the channel lets the thread finish the backlog and exit
        self.wake.take();
        if let Some(handle) = self.drain_thread.take() {
            if handle.join().is_err() {
                warn!("persistence thread panicked");
            }
        }
    }
}

/// Non-hidden files of `dir`, sorted by file name.
pub fn frame_paths(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !entry.file_type()?.is_file() {
            continue;
        }
        paths.push(entry.path());
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

/// Load every stored frame from `dir`, oldest first.
///
/// An unreadable directory is logged and yields no frames; a single
/// undecodable file is logged and skipped.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(storage, dir), fields(dir = %dir.display()))
)]
pub fn read_images(
    dir: &Path,
    storage: &dyn FrameStorage,
    naming: FrameNaming,
) -> Vec<LoadedFrame> {
    let paths = match frame_paths(dir) {
        Ok(paths) => paths,
        Err(err) => {
            warn!("failed to open directory {}: {err}", dir.display());
            return Vec::new();
        }
    };

    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        debug!("loading {}", path.display());
        match storage.read_frame(&path) {
            Ok(frame) => frames.push(LoadedFrame {
                captured_at: naming.capture_time(&path),
                path,
                frame,
            }),
            Err(err) => warn!("skipping {}: {err}", path.display()),
        }
    }
    info!("read {} frames from {}", frames.len(), dir.display());
    frames
}
