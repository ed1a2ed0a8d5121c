//! Camflow binary for testing camera capture.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camflow::geometry::Affine;
use camflow::traits::Result;
use camflow::{
    CameraConfig, CameraError, CameraHelper, CameraId, CameraListener, CameraProvider,
    HostContext, NodeAccessContext, PlanarFrame, PreviewSurface, Rotation, Size, V4l2Provider,
};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "camflow")]
#[command(about = "Stream planar 4:2:0 frames from a V4L2 camera")]
#[command(version)]
struct Cli {
    /// Camera id (the N of /dev/videoN)
    #[arg(short, long)]
    device: Option<String>,

    /// Target preview width
    #[arg(long)]
    width: Option<u32>,

    /// Target preview height
    #[arg(long)]
    height: Option<u32>,

    /// Frame rotation in degrees (0, 90 or 180)
    #[arg(short, long)]
    rotation: Option<u32>,

    /// How long to stream, in seconds
    #[arg(short, long, default_value = "5")]
    seconds: u64,

    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// List cameras and exit
    #[arg(short, long)]
    list: bool,
}

/// Preview surface for running without a display.
struct HeadlessSurface {
    size: Size,
}

impl PreviewSurface for HeadlessSurface {
    fn is_available(&self) -> bool {
        true
    }

    fn size(&self) -> Size {
        self.size
    }

    fn set_default_buffer_size(&self, size: Size) {
        info!(%size, "preview buffer size");
    }

    fn set_transform(&self, _transform: &Affine) {}
}

/// Listener that logs lifecycle callbacks and frame statistics.
#[derive(Default)]
struct LoggingListener {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl CameraListener for LoggingListener {
    fn on_camera_opened(&self, size: Size, display_orientation: u32) {
        info!(%size, display_orientation, "camera opened");
    }

    fn on_camera_closed(&self) {
        info!("camera closed");
    }

    fn on_camera_error(&self, error: &CameraError) {
        error!(%error, "camera error");
    }

    fn on_preview_frame(&self, frame: &PlanarFrame<'_>) {
        let count = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        self.bytes
            .fetch_add(frame.data.len() as u64, Ordering::Relaxed);
        if count % 30 == 1 {
            info!(
                count,
                sequence = frame.sequence,
                size = %frame.size(),
                bytes = frame.data.len(),
                "frame"
            );
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    if let Err(err) = run(&Cli::parse()) {
        error!(%err, "camflow failed");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<CameraConfig> {
    let mut config = match &cli.config {
        Some(path) => CameraConfig::from_path(path)?,
        None => CameraConfig::default(),
    };
    if let Some(device) = &cli.device {
        config.camera_id = CameraId::new(device.as_str());
    }
    if let Some(width) = cli.width {
        config.target_size.width = width;
    }
    if let Some(height) = cli.height {
        config.target_size.height = height;
    }
    if let Some(degrees) = cli.rotation {
        config.rotation = Rotation::try_from(degrees)?;
    }
    config.validate()?;
    Ok(config)
}

fn list_cameras(provider: &V4l2Provider) -> Result<()> {
    for id in provider.camera_ids()? {
        match provider.characteristics(&id) {
            Ok(characteristics) => {
                let sizes = characteristics
                    .output_sizes
                    .unwrap_or_default()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                info!(camera_id = %id, %sizes, "camera");
            }
            Err(err) => warn!(camera_id = %id, %err, "camera unavailable"),
        }
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let provider = V4l2Provider::new();
    if cli.list {
        return list_cameras(&provider);
    }

    let config = load_config(cli)?;
    info!(
        camera_id = %config.camera_id,
        target = %config.target_size,
        rotation = config.rotation.degrees(),
        "starting camera"
    );

    let surface = Arc::new(HeadlessSurface {
        size: config.target_size,
    });
    let listener = Arc::new(LoggingListener::default());
    let context: Arc<dyn HostContext> = Arc::new(NodeAccessContext);

    let mut helper = CameraHelper::new(
        Arc::new(provider),
        surface,
        Arc::clone(&listener) as Arc<dyn CameraListener>,
        Arc::downgrade(&context),
        config,
    );
    helper.start();

    thread::sleep(Duration::from_secs(cli.seconds));
    helper.stop();

    info!(
        frames = listener.frames.load(Ordering::Relaxed),
        bytes = listener.bytes.load(Ordering::Relaxed),
        state = ?helper.state(),
        "stopped"
    );
    Ok(())
}
