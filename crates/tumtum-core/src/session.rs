use serde::{Deserialize, Serialize};

use crate::detection::DetectionResult;
use crate::geometry::Rect;

/// Target geometry issued by the backend when a challenge starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidanceBox {
    /// Box the whole face must sit in.
    pub area: Rect,
    /// Box every nose-tip landmark must sit in.
    pub nose: Rect,
    /// Minimum share of `area` the face should cover, in percent.
    pub min_face_area_percent: u32,
}

impl GuidanceBox {
    /// Face rectangle fully inside the face area.
    pub fn face_fits(&self, detection: &DetectionResult) -> bool {
        detection
            .face
            .as_ref()
            .is_some_and(|face| self.area.contains(face))
    }

    /// Every nose-tip point inside the nose box (and at least one point).
    pub fn nose_fits(&self, detection: &DetectionResult) -> bool {
        self.nose.contains_all(&detection.nose_tip)
    }

    /// Share of the face area covered by `face`, in percent.
    pub fn face_coverage_percent(&self, face: &Rect) -> u32 {
        let area = self.area.area();
        if area <= 0 {
            return 0;
        }
        let pct = face.area().saturating_mul(100) / area;
        u32::try_from(pct.max(0)).unwrap_or(u32::MAX)
    }
}

/// One in-progress challenge, as issued by the backend's start call.
///
/// Read-only once built. A new challenge replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSession {
    /// Opaque challenge identifier assigned by the backend.
    pub id: String,
    pub user_id: String,
    pub frame_width: u32,
    pub frame_height: u32,
    pub target: GuidanceBox,
    /// Auth token for follow-up calls, when the backend issues one.
    #[serde(skip_serializing)]
    pub token: Option<String>,
}
