use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tumtum_core::FaceDetector;

mod backend;
mod config;
mod controller;
mod dbus_interface;
mod detector;
mod engine;
mod pipeline;

use backend::{BackendClient, VerificationBackend};
use controller::{BackendFactory, ControllerOptions};
use dbus_interface::{ChallengeService, DbusNotifier};
use detector::{CommandDetector, NullDetector};
use pipeline::StillImagePipeline;

/// Frames buffered between the media thread and the coordinator.
const FRAME_QUEUE: usize = 2;

#[derive(Parser)]
#[command(name = "tumtumd", version, about = "Liveness challenge daemon")]
struct Args {
    /// Debug logging for the tumtum crates (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    /// Settings file [default: $TUMTUM_CONFIG or $XDG_CONFIG_HOME/tumtum.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Video source to use instead of the configured one
    #[arg(long)]
    device: Option<String>,

    /// Start a challenge as soon as the daemon is ready
    #[arg(long)]
    start: bool,

    /// Write the default settings file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "info,tumtumd=debug,tumtum_core=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let path = args.config.unwrap_or_else(config::config_path);
    if args.init_config {
        config::Settings::default()
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    tracing::info!("tumtumd starting");
    let mut settings = config::Settings::load_or_default(&path);
    if let Some(device) = args.device {
        settings.daemon.camera_device = device;
    }

    let detector: Arc<dyn FaceDetector> = match &settings.daemon.detector_command {
        Some(argv) => Arc::new(
            CommandDetector::new(argv)
                .context("invalid detector command")?
                .with_timeout(Duration::from_millis(settings.daemon.detector_timeout_ms)),
        ),
        None => {
            tracing::warn!("no detector_command configured, faces will never be detected");
            Arc::new(NullDetector)
        }
    };
    let pool = engine::spawn_pool(detector, settings.daemon.detection_workers)?;
    let media = Arc::new(StillImagePipeline::new(settings.daemon.fps));

    let backend_settings = settings.clone();
    let make_backend: BackendFactory = Box::new(move |kind| {
        let client = BackendClient::from_settings(kind, &backend_settings)?;
        Ok(Arc::new(client) as Arc<dyn VerificationBackend>)
    });

    let (notifier, messages) = DbusNotifier::channel();
    let (handle, coordinator) = controller::spawn(
        ControllerOptions {
            device: settings.daemon.camera_device.clone(),
            backend: settings.daemon.backend,
            jpeg_quality: settings.daemon.jpeg_quality,
            shutdown_timeout: Duration::from_millis(settings.daemon.shutdown_timeout_ms),
            frame_queue: FRAME_QUEUE,
        },
        pool,
        media,
        make_backend,
        Arc::new(notifier),
    )?;

    let conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, ChallengeService::new(handle.clone()))?
        .build()
        .await
        .context("failed to register on the session bus")?;
    let forwarder = dbus_interface::forward_messages(conn.clone(), messages);

    tracing::info!(
        bus = dbus_interface::BUS_NAME,
        backend = %settings.daemon.backend,
        device = %settings.daemon.camera_device,
        "tumtumd ready"
    );

    if args.start {
        if let Err(e) = handle.start().await {
            tracing::error!(error = %e, "initial challenge did not start");
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("tumtumd shutting down");

    handle.shutdown().await?;
    coordinator.await?;
    forwarder.abort();
    Ok(())
}
