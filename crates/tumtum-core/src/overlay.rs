use std::sync::Mutex;

use serde::Serialize;

use crate::detection::DetectionResult;
use crate::geometry::{Point, Rect};
use crate::lifecycle::Phase;
use crate::session::ChallengeSession;

/// Single-slot, newest-wins holder of the latest detection result.
///
/// Writers overwrite; the render step peeks. Older results are dropped on
/// write whether or not anyone read them.
#[derive(Debug, Default)]
pub struct OverlayState {
    slot: Mutex<Option<DetectionResult>>,
}

impl OverlayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held result, returning the one it displaced.
    pub fn put(&self, result: DetectionResult) -> Option<DetectionResult> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.replace(result)
    }

    /// Copy of the held result, leaving it in place for the next draw.
    pub fn latest(&self) -> Option<DetectionResult> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn take(&self) -> Option<DetectionResult> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn clear(&self) {
        self.take();
    }
}

/// What the render step should draw for one video frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverlayDrawData {
    pub face_box: Option<Rect>,
    pub nose_tip: Vec<Point>,
    pub nose_bridge: Vec<Point>,
    /// Target face area, present while target geometry applies.
    pub target_area: Option<Rect>,
    /// Target nose box, shown once the user is asked to move their nose.
    pub target_nose: Option<Rect>,
    pub face_in_area: bool,
    pub nose_in_box: bool,
    /// Share of the target area the face covers, in percent.
    pub face_coverage_percent: Option<u32>,
    /// Coverage reached the session's `min_face_area_percent`. Advisory only.
    pub face_large_enough: bool,
}

impl OverlayDrawData {
    /// Combine the latest detection with the current phase and session.
    pub fn compose(
        detection: Option<&DetectionResult>,
        phase: Option<Phase>,
        session: Option<&ChallengeSession>,
    ) -> Self {
        let mut data = match detection {
            Some(d) => Self {
                face_box: d.face,
                nose_tip: d.nose_tip.clone(),
                nose_bridge: d.nose_bridge.clone(),
                ..Default::default()
            },
            None => Self::default(),
        };

        let (Some(phase), Some(session)) = (phase, session) else {
            return data;
        };
        if !phase.uses_target_geometry() {
            return data;
        }

        let target = &session.target;
        data.target_area = Some(target.area);
        if matches!(phase, Phase::PositioningNose | Phase::Verifying) {
            data.target_nose = Some(target.nose);
        }
        if let Some(d) = detection {
            data.face_in_area = target.face_fits(d);
            data.nose_in_box = target.nose_fits(d);
            if let Some(face) = &d.face {
                let pct = target.face_coverage_percent(face);
                data.face_coverage_percent = Some(pct);
                data.face_large_enough = pct >= target.min_face_area_percent;
            }
        }
        data
    }
}
