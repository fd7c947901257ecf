//! Stderr logger for capture sessions.
//!
//! Lines look like `   1.204s  INFO calib-capture-jobs  worker: message`.
//! Frame processing, persistence and calibration each run on their own
//! named thread, so the thread column tells them apart.

use std::fmt;
use std::io::Write;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use log::{Level, LevelFilter, Log, Metadata, Record};

#[cfg(feature = "tracing")]
use tracing_subscriber::fmt::format::FmtSpan;
#[cfg(feature = "tracing")]
use tracing_subscriber::prelude::*;
#[cfg(feature = "tracing")]
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

const CRATE_PREFIXES: [&str; 2] = ["calib_capture_core::", "calib_capture::"];

struct CaptureLogger {
    started: Instant,
}

impl Log for CaptureLogger {
    // the global max level is the only filter, so re-initialising adjusts it
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let thread = std::thread::current();
        let line = render(
            self.started.elapsed(),
            record.level(),
            thread.name(),
            record.target(),
            record.args(),
        );
        // one locked write per line keeps threads from interleaving
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn render(
    elapsed: Duration,
    level: Level,
    thread: Option<&str>,
    target: &str,
    args: &fmt::Arguments<'_>,
) -> String {
    let module = CRATE_PREFIXES
        .iter()
        .find_map(|p| target.strip_prefix(p))
        .unwrap_or(target);
    format!(
        "{:>8.3}s {:>5} {:<20} {}: {}\n",
        elapsed.as_secs_f64(),
        level,
        thread.unwrap_or("-"),
        module,
        args
    )
}

/// Level for a `-v` count: warnings by default, then info, debug, trace.
pub fn level_for_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the stderr logger, or change its level if it is already installed.
///
/// Fails only when a different logger owns the `log` facade.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    if INSTALLED.get().is_none() {
        log::set_boxed_logger(Box::new(CaptureLogger {
            started: Instant::now(),
        }))?;
        let _ = INSTALLED.set(());
    }
    log::set_max_level(level);
    Ok(())
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// `json` switches from uptime-stamped text to flattened JSON lines. Span
/// close events are emitted so the solve and the bulk load report their
/// duration.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_layer = json.then(|| {
        tracing_fmt::layer()
            .json()
            .flatten_event(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
    });
    let text_layer = (!json).then(|| {
        tracing_fmt::layer()
            .with_thread_names(true)
            .with_timer(tracing_fmt::time::Uptime::default())
            .with_span_events(FmtSpan::CLOSE)
    });
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_strips_crate_prefix() {
        let line = render(
            Duration::from_millis(1500),
            Level::Info,
            Some("calib-capture-jobs"),
            "calib_capture::worker",
            &format_args!("rms {}", 0.5),
        );
        assert!(line.starts_with("   1.500s  INFO calib-capture-jobs"));
        assert!(line.ends_with(" worker: rms 0.5\n"));
    }

    #[test]
    fn render_keeps_foreign_targets() {
        let line = render(
            Duration::ZERO,
            Level::Warn,
            None,
            "png::decoder",
            &format_args!("x"),
        );
        assert!(line.contains(" - "));
        assert!(line.ends_with("png::decoder: x\n"));
    }

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_for_verbosity(0), LevelFilter::Warn);
        assert_eq!(level_for_verbosity(1), LevelFilter::Info);
        assert_eq!(level_for_verbosity(2), LevelFilter::Debug);
        assert_eq!(level_for_verbosity(9), LevelFilter::Trace);
    }

    #[test]
    fn reinstalling_changes_the_level() {
        init_with_level(LevelFilter::Info).unwrap();
        assert_eq!(log::max_level(), LevelFilter::Info);
        init_with_level(LevelFilter::Debug).unwrap();
        assert_eq!(log::max_level(), LevelFilter::Debug);
    }
}
