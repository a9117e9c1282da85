use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self as std_mpsc, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tumtum_core::{DetectionResult, FaceDetector, Frame};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn detection worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("detection pool needs at least one worker")]
    NoWorkers,
}

/// One frame waiting for a worker.
struct Job {
    frame: Frame,
    reply: oneshot::Sender<Option<DetectionResult>>,
}

/// Fixed-size pool of detection threads.
///
/// The job queue holds at most one job per worker. `submit` never blocks:
/// when the queue is full the frame is refused and its future resolves to
/// `None`, which callers treat exactly like "no face".
pub struct DetectionPool {
    tx: Option<SyncSender<Job>>,
    exited: std_mpsc::Receiver<()>,
    workers: usize,
}

/// Spawn `workers` detection threads sharing `detector`.
pub fn spawn_pool(
    detector: Arc<dyn FaceDetector>,
    workers: usize,
) -> Result<DetectionPool, EngineError> {
    if workers == 0 {
        return Err(EngineError::NoWorkers);
    }

    let (tx, rx) = std_mpsc::sync_channel::<Job>(workers);
    let rx = Arc::new(Mutex::new(rx));
    let (exited_tx, exited) = std_mpsc::channel();

    for i in 0..workers {
        let rx = Arc::clone(&rx);
        let detector = Arc::clone(&detector);
        let exited_tx = exited_tx.clone();
        std::thread::Builder::new()
            .name(format!("tumtum-detect-{i}"))
            .spawn(move || {
                tracing::debug!(worker = i, "detection worker started");
                loop {
                    // Lock only while waiting for the next job.
                    let job = {
                        let rx = rx.lock().unwrap_or_else(|e| e.into_inner());
                        rx.recv()
                    };
                    let Ok(job) = job else { break };
                    let result = run_detection(detector.as_ref(), &job.frame);
                    // The requester may have gone away; nothing to do then.
                    let _ = job.reply.send(result);
                }
                tracing::debug!(worker = i, "detection worker exiting");
                let _ = exited_tx.send(());
            })
            .map_err(EngineError::Spawn)?;
    }

    tracing::info!(workers, "detection pool started");
    Ok(DetectionPool {
        tx: Some(tx),
        exited,
        workers,
    })
}

impl DetectionPool {
    /// Queue `frame` for detection.
    ///
    /// The returned future resolves once a worker is done with the frame, or
    /// immediately to `None` if the frame could not be queued.
    pub fn submit(
        &self,
        frame: Frame,
    ) -> impl Future<Output = Option<DetectionResult>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let queued = match &self.tx {
            Some(tx) => match tx.try_send(Job { frame, reply }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!("detection queue full, frame dropped");
                    false
                }
                Err(TrySendError::Disconnected(_)) => {
                    tracing::warn!("detection workers gone, frame dropped");
                    false
                }
            },
            None => false,
        };
        async move {
            if !queued {
                return None;
            }
            rx.await.ok().flatten()
        }
    }

    /// Close the queue and wait up to `timeout` for all workers to exit.
    ///
    /// Returns `false` if some worker was still busy when the wait ran out;
    /// that thread is left to finish its current frame on its own.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        drop(self.tx.take());
        let deadline = Instant::now() + timeout;
        for _ in 0..self.workers {
            let left = deadline.saturating_duration_since(Instant::now());
            if self.exited.recv_timeout(left).is_err() {
                tracing::warn!(?timeout, "detection workers did not exit in time");
                return false;
            }
        }
        tracing::info!("detection pool stopped");
        true
    }
}

/// Run the detector on one frame. Failures and panics count as "no face".
fn run_detection(detector: &dyn FaceDetector, frame: &Frame) -> Option<DetectionResult> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| detector.detect(frame)));
    match outcome {
        Ok(Ok(faces)) => {
            tracing::trace!(faces = faces.len(), "detection done");
            DetectionResult::from_faces(faces)
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "detection failed, treating as no face");
            None
        }
        Err(_) => {
            tracing::error!("detector panicked, treating as no face");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tumtum_core::{DetectedFace, DetectionError, Point, Rect};

    fn frame() -> Frame {
        Frame::from_rgb(vec![0; 4 * 4 * 3], 4, 4, Duration::ZERO).unwrap()
    }

    struct TwoFaces;

    impl FaceDetector for TwoFaces {
        fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedFace>, DetectionError> {
            let face = |x| DetectedFace {
                bounds: Rect::new(x, 0, 5, 5),
                nose_tip: vec![Point::new(x + 2, 2)],
                nose_bridge: vec![],
            };
            Ok(vec![face(1), face(9)])
        }
    }

    struct Failing;

    impl FaceDetector for Failing {
        fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedFace>, DetectionError> {
            Err(DetectionError::Failed("model missing".into()))
        }
    }

    struct Panicking;

    impl FaceDetector for Panicking {
        fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedFace>, DetectionError> {
            panic!("boom")
        }
    }

    /// Blocks every call until the test releases it.
    struct Gated {
        gate: Mutex<std_mpsc::Receiver<()>>,
    }

    impl FaceDetector for Gated {
        fn detect(&self, _frame: &Frame) -> Result<Vec<DetectedFace>, DetectionError> {
            let _ = self.gate.lock().unwrap().recv();
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_first_face_is_used() {
        let pool = spawn_pool(Arc::new(TwoFaces), 1).unwrap();
        let result = pool.submit(frame()).await.unwrap();
        assert_eq!(result.face, Some(Rect::new(1, 0, 5, 5)));
        assert!(pool.shutdown(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_detector_error_is_no_face() {
        let pool = spawn_pool(Arc::new(Failing), 1).unwrap();
        assert!(pool.submit(frame()).await.is_none());
        assert!(pool.shutdown(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_detector_panic_is_no_face_and_worker_survives() {
        let pool = spawn_pool(Arc::new(Panicking), 1).unwrap();
        assert!(pool.submit(frame()).await.is_none());
        assert!(pool.submit(frame()).await.is_none());
        assert!(pool.shutdown(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_full_queue_refuses_without_blocking() {
        let (gate_tx, gate_rx) = std_mpsc::channel();
        let pool = spawn_pool(
            Arc::new(Gated {
                gate: Mutex::new(gate_rx),
            }),
            1,
        )
        .unwrap();

        // One frame in the worker, one in the queue, the third is refused.
        let first = pool.submit(frame());
        let first = tokio::spawn(first);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = tokio::spawn(pool.submit(frame()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let third = pool.submit(frame()).await;
        assert!(third.is_none());

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        assert!(first.await.unwrap().is_none());
        assert!(second.await.unwrap().is_none());
        assert!(pool.shutdown(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_shutdown_wait_is_bounded() {
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let pool = spawn_pool(
            Arc::new(Gated {
                gate: Mutex::new(gate_rx),
            }),
            1,
        )
        .unwrap();
        let pending = tokio::spawn(pool.submit(frame()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let clean = tokio::task::spawn_blocking(move || pool.shutdown(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(!clean);
        assert!(started.elapsed() < Duration::from_secs(2));

        drop(gate_tx);
        assert!(pending.await.unwrap().is_none());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            spawn_pool(Arc::new(Failing), 0),
            Err(EngineError::NoWorkers)
        ));
    }
}
