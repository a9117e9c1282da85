use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::Frame;
use crate::geometry::{Point, Rect};

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("detector failed: {0}")]
    Failed(String),
    #[error("detector produced unreadable output: {0}")]
    BadOutput(String),
    #[error("detector did not answer within {0:?}")]
    TimedOut(std::time::Duration),
    #[error("detector I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One face as reported by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounds: Rect,
    pub nose_tip: Vec<Point>,
    pub nose_bridge: Vec<Point>,
}

/// Outcome of analysing one frame.
///
/// `Default` is the "no face found" result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub face: Option<Rect>,
    pub nose_tip: Vec<Point>,
    pub nose_bridge: Vec<Point>,
}

impl DetectionResult {
    /// Build a result from the detector's face list, keeping only the first face.
    pub fn from_faces(faces: Vec<DetectedFace>) -> Option<Self> {
        let face = faces.into_iter().next()?;
        Some(Self {
            face: Some(face.bounds),
            nose_tip: face.nose_tip,
            nose_bridge: face.nose_bridge,
        })
    }

    pub fn has_face(&self) -> bool {
        self.face.is_some()
    }
}

/// Pluggable face/landmark detector.
///
/// Implementations are called from detection worker threads, one frame at a
/// time, and must not keep per-call state.
pub trait FaceDetector: Send + Sync {
    /// Detect faces in `frame`. Order matters: callers use the first entry.
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectionError>;
}
