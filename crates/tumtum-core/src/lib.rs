//! Liveness challenge building blocks.
//!
//! Everything here is free of I/O: the challenge lifecycle state machine,
//! the geometry used to decide whether a face or nose sits inside its
//! guidance box, the single-slot overlay buffer shared with the render step,
//! and the frame type passed between the media thread and detection workers.

pub mod detection;
pub mod frame;
pub mod geometry;
pub mod lifecycle;
pub mod overlay;
pub mod session;

pub use detection::{DetectedFace, DetectionError, DetectionResult, FaceDetector};
pub use frame::{Frame, FrameError};
pub use geometry::{Point, Rect};
pub use lifecycle::{ChallengeLifecycle, LifecycleError, MessageLevel, Notifier, Phase};
pub use overlay::{OverlayDrawData, OverlayState};
pub use session::{ChallengeSession, GuidanceBox};
