use std::error::Error;
use std::path::{Path, PathBuf};

#[cfg(feature = "tracing")]
use calib_capture::core::init_tracing;
#[cfg(not(feature = "tracing"))]
use calib_capture::core::init_with_level;
use calib_capture::core::level_for_verbosity;
use calib_capture::persist::{read_images, FrameNaming, PngFrameStorage};
use calib_capture::CaptureConfig;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
#[cfg(feature = "tracing")]
use tracing_log::LogTracer;

/// Utilities around the intrinsic calibration capture pipeline.
#[derive(Debug, Parser)]
#[command(author, version, about = "Camera intrinsic calibration capture tools")]
struct Args {
    /// More log output on stderr (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Emit tracing output as JSON lines.
    #[cfg(feature = "tracing")]
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a config file holding every option at its default value.
    InitConfig { path: PathBuf },
    /// Parse and validate a config file, then print it back in full.
    CheckConfig { path: PathBuf },
    /// List stored frames in the order a bulk load reads them.
    Frames {
        dir: PathBuf,
        #[arg(long, value_enum, default_value_t = NamingArg::Timestamp)]
        naming: NamingArg,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NamingArg {
    Timestamp,
    Sequential,
}

impl From<NamingArg> for FrameNaming {
    fn from(arg: NamingArg) -> Self {
        match arg {
            NamingArg::Timestamp => FrameNaming::Timestamp,
            NamingArg::Sequential => FrameNaming::Sequential,
        }
    }
}

fn init_config(path: &Path) -> Result<String, Box<dyn Error>> {
    CaptureConfig::default().write_json(path)?;
    Ok(format!("wrote default config to {}", path.display()))
}

fn check_config(path: &Path) -> Result<String, Box<dyn Error>> {
    let cfg = CaptureConfig::load_json(path)?;
    Ok(serde_json::to_string_pretty(&cfg)?)
}

fn list_frames(dir: &Path, naming: FrameNaming) -> String {
    let frames = read_images(dir, &PngFrameStorage, naming);
    let mut out = String::new();
    for loaded in &frames {
        let name = loaded
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let time = loaded
            .captured_at
            .map_or_else(|| "-".to_string(), |t| format!("{t:.3}"));
        out.push_str(&format!(
            "{name}\t{}x{}\t{time}\n",
            loaded.frame.width, loaded.frame.height
        ));
    }
    out.push_str(&format!("{} frames\n", frames.len()));
    out
}

#[cfg(not(feature = "tracing"))]
fn init_logging(args: &Args) -> Result<(), Box<dyn Error>> {
    init_with_level(level_for_verbosity(args.verbose))?;
    Ok(())
}

#[cfg(feature = "tracing")]
fn init_logging(args: &Args) -> Result<(), Box<dyn Error>> {
    // route `log` records from the library into the subscriber
    LogTracer::init()?;
    if args.verbose > 0 && std::env::var_os("RUST_LOG").is_none() {
        let level = level_for_verbosity(args.verbose).to_string();
        std::env::set_var("RUST_LOG", level.to_ascii_lowercase());
    }
    init_tracing(args.json);
    Ok(())
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(&args)?;

    let out = match &args.command {
        Command::InitConfig { path } => init_config(path)?,
        Command::CheckConfig { path } => check_config(path)?,
        Command::Frames { dir, naming } => list_frames(dir, (*naming).into()),
    };
    print!("{out}");
    if !out.ends_with('\n') {
        println!();
    }
    Ok(())
}
