use std::time::Duration;

use clap::{Parser, Subcommand};
use microbe_capture::backend::{self, Backends, SyntheticBackend};
use microbe_capture::config::{CameraConfig, CameraId, Settings};
use microbe_capture::registry::{CameraHandle, CameraRegistry};
use microbe_capture::snapshot::save_snapshot;
use microbe_capture::{OurError, OurResult};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "microbe-capture")]
#[command(about = "Camera acquisition for the microscope imaging station")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Use generated test-pattern cameras instead of hardware
    #[arg(long, global = true)]
    synthetic: bool,
}

/// Camera selection, falling back to the configured defaults
#[derive(clap::Args)]
struct CameraArgs {
    /// Camera index or stream address
    #[arg(long)]
    id: Option<String>,
    /// Camera type (usb, csi, ip)
    #[arg(long = "type")]
    camera_type: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
}

impl CameraArgs {
    fn into_config(self, settings: &Settings) -> CameraConfig {
        let defaults = settings.default_camera();
        CameraConfig {
            id: self.id.map(CameraId::from).unwrap_or(defaults.id),
            camera_type: self
                .camera_type
                .map(|camera_type| camera_type.as_str().into())
                .unwrap_or(defaults.camera_type),
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            fps: self.fps.unwrap_or(defaults.fps),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List local cameras
    Devices,
    /// Start a camera, save one frame as JPEG and stop
    Snapshot {
        #[command(flatten)]
        camera: CameraArgs,
        /// How long to wait for the first frame, in seconds
        #[arg(long, default_value = "5")]
        wait: u64,
    },
    /// Stream a camera and log its status every second
    Watch {
        #[command(flatten)]
        camera: CameraArgs,
        /// Stop after this many seconds; runs until Ctrl-C when omitted
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> OurResult<()> {
    let cli = Cli::parse();

    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let default_level = if cli.debug || settings.debug {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| OurError::App(format!("Failed to set tracing subscriber: {e}")))?;

    debug!("Loaded settings: {settings:?}");

    let synthetic = cli.synthetic || settings.synthetic_cameras;
    match cli.command {
        Commands::Devices => list_devices(synthetic),
        Commands::Snapshot { camera, wait } => {
            let handle = camera_handle(&settings, synthetic);
            take_snapshot(&handle, camera.into_config(&settings), wait, &settings).await
        }
        Commands::Watch { camera, seconds } => {
            let handle = camera_handle(&settings, synthetic);
            watch(&handle, camera.into_config(&settings), seconds).await
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn camera_handle(settings: &Settings, synthetic: bool) -> CameraHandle {
    let backends = if synthetic {
        info!("Using synthetic cameras");
        Backends::synthetic(SyntheticBackend::default())
    } else {
        Backends::native()
    };
    CameraHandle::new(CameraRegistry::new(backends, settings.timings()))
}

fn list_devices(synthetic: bool) -> OurResult<()> {
    if synthetic {
        println!("Synthetic cameras accept any index or address");
        return Ok(());
    }
    let cameras = backend::native::enumerate()?;
    if cameras.is_empty() {
        println!("No cameras detected");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&cameras)?);
    Ok(())
}

async fn take_snapshot(
    handle: &CameraHandle,
    config: CameraConfig,
    wait: u64,
    settings: &Settings,
) -> OurResult<()> {
    let id = config.id.clone();
    handle.add(config).await?;
    handle.start(id.clone()).await?;

    let frame = handle
        .wait_for_frame(Some(&id), Duration::from_secs(wait))
        .await;
    handle.stop_all().await?;

    let frame = frame.ok_or_else(|| {
        OurError::App(format!("Camera {id} produced no frame within {wait}s"))
    })?;
    let path = save_snapshot(&frame, &settings.capture_directory, settings.jpeg_quality)?;
    println!("{}", path.display());
    Ok(())
}

async fn watch(handle: &CameraHandle, config: CameraConfig, seconds: Option<u64>) -> OurResult<()> {
    let id = config.id.clone();
    handle.add(config).await?;
    handle.start(id.clone()).await?;

    let deadline = seconds.map(|seconds| tokio::time::Instant::now() + Duration::from_secs(seconds));
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let info = handle.info(&id)?;
                info!("{}", serde_json::to_string(&info)?);
                if !info.streaming {
                    warn!("Camera {id} is no longer streaming");
                    break;
                }
                if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    handle.stop_all().await
}
