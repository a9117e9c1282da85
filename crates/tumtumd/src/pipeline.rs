//! Frame sources.
//!
//! A media pipeline runs on its own thread and pushes frames into a
//! [`FrameSink`]. The sink never blocks the media thread: when the
//! coordinator falls behind, frames are dropped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tumtum_core::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Hardware-backed preview path.
    Accelerated,
    /// Plain software path, always attempted second.
    Basic,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topology::Accelerated => "accelerated",
            Topology::Basic => "basic",
        })
    }
}

#[derive(Error, Debug)]
pub enum PipelineBuildError {
    #[error("{topology} pipeline unavailable for {device}: {reason}")]
    Unavailable {
        device: String,
        topology: Topology,
        reason: String,
    },
    #[error("failed to open {device}: {source}")]
    Source {
        device: String,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to start media thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Non-blocking entry point for frames coming off a media thread.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Frame>,
}

impl FrameSink {
    /// A sink holding at most `capacity` undelivered frames, and its receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Hand over one frame. Returns `false` if it was dropped.
    pub fn on_frame(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!("frame queue full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

pub trait RunningPipeline: Send {
    /// Stream geometry as (width, height).
    fn geometry(&self) -> (u32, u32);

    fn topology(&self) -> Topology;

    /// Stop the media thread, waiting at most `timeout` for it to exit.
    fn stop(self: Box<Self>, timeout: Duration) -> bool;
}

pub trait MediaPipeline: Send + Sync {
    fn build(
        &self,
        device: &str,
        topology: Topology,
        sink: FrameSink,
    ) -> Result<Box<dyn RunningPipeline>, PipelineBuildError>;
}

/// Try the accelerated topology, then the basic one.
pub fn build_with_fallback(
    media: &dyn MediaPipeline,
    device: &str,
    sink: FrameSink,
) -> Result<Box<dyn RunningPipeline>, PipelineBuildError> {
    let pipeline = match media.build(device, Topology::Accelerated, sink.clone()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::info!(device, error = %e, "accelerated pipeline unavailable, falling back");
            media.build(device, Topology::Basic, sink).map_err(|e| {
                tracing::error!(device, error = %e, "failed to build media pipeline");
                e
            })?
        }
    };
    tracing::info!(
        device,
        topology = %pipeline.topology(),
        geometry = ?pipeline.geometry(),
        "media pipeline running"
    );
    Ok(pipeline)
}

/// Replays an image file, or every image in a directory, at a fixed rate.
#[derive(Debug, Clone)]
pub struct StillImagePipeline {
    fps: u32,
}

impl StillImagePipeline {
    pub fn new(fps: u32) -> Self {
        Self { fps: fps.max(1) }
    }
}

impl MediaPipeline for StillImagePipeline {
    fn build(
        &self,
        device: &str,
        topology: Topology,
        sink: FrameSink,
    ) -> Result<Box<dyn RunningPipeline>, PipelineBuildError> {
        if topology == Topology::Accelerated {
            return Err(PipelineBuildError::Unavailable {
                device: device.to_string(),
                topology,
                reason: "still images have no hardware path".into(),
            });
        }

        let images = load_images(Path::new(device))?;
        let Some(first) = images.first() else {
            return Err(PipelineBuildError::Unavailable {
                device: device.to_string(),
                topology,
                reason: "no images found".into(),
            });
        };
        let geometry = first.dimensions();
        let interval = Duration::from_secs(1) / self.fps;

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (done_tx, done_rx) = std_mpsc::channel::<()>();
        std::thread::Builder::new()
            .name("tumtum-media".into())
            .spawn(move || {
                let started = Instant::now();
                for image in images.iter().cycle() {
                    sink.on_frame(Frame {
                        image: Arc::clone(image),
                        timestamp: started.elapsed(),
                    });
                    match stop_rx.recv_timeout(interval) {
                        Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                tracing::debug!("media thread exiting");
                let _ = done_tx.send(());
            })
            .map_err(PipelineBuildError::Spawn)?;

        Ok(Box::new(StillImageRunning {
            geometry,
            stop_tx,
            done_rx,
        }))
    }
}

struct StillImageRunning {
    geometry: (u32, u32),
    stop_tx: std_mpsc::Sender<()>,
    done_rx: std_mpsc::Receiver<()>,
}

impl RunningPipeline for StillImageRunning {
    fn geometry(&self) -> (u32, u32) {
        self.geometry
    }

    fn topology(&self) -> Topology {
        Topology::Basic
    }

    fn stop(self: Box<Self>, timeout: Duration) -> bool {
        drop(self.stop_tx);
        let stopped = self.done_rx.recv_timeout(timeout).is_ok();
        if !stopped {
            tracing::warn!(?timeout, "media thread did not stop in time");
        }
        stopped
    }
}

/// Decode `path` (a file, or a directory read in name order). Images whose
/// size differs from the first one are skipped.
fn load_images(path: &Path) -> Result<Vec<Arc<RgbImage>>, PipelineBuildError> {
    let source_err = |source: image::ImageError| PipelineBuildError::Source {
        device: path.display().to_string(),
        source,
    };

    let files: Vec<PathBuf> = if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|e| source_err(image::ImageError::IoError(e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && image::ImageFormat::from_path(p).is_ok())
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut images: Vec<Arc<RgbImage>> = Vec::with_capacity(files.len());
    for file in files {
        let image = image::open(&file).map_err(source_err)?.to_rgb8();
        if let Some(first) = images.first() {
            if first.dimensions() != image.dimensions() {
                tracing::warn!(file = %file.display(), "skipping image with different size");
                continue;
            }
        }
        images.push(Arc::new(image));
    }
    Ok(images)
}
