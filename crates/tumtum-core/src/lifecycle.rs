//! Challenge lifecycle state machine.
//!
//! A challenge walks one fixed path:
//!
//! ```text
//! (none) -> Starting -> CenteringFace -> PositioningNose -> Verifying -> Success | Failed | Stopped
//! ```
//!
//! and may be cancelled into `Stopped` from any non-terminal phase. Each
//! event declares the phase it must be fired from. Firing it from any other
//! phase returns [`LifecycleError::InvalidTransition`] and changes nothing,
//! which is what keeps a phase-entry side effect (a backend call, a guidance
//! message) from running twice when two frames race to satisfy the same
//! condition.
//!
//! The machine is not `Sync`-safe by itself: a single coordinator owns it and
//! serialises all events.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::detection::DetectionResult;
use crate::session::GuidanceBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Phase {
    Starting,
    CenteringFace,
    PositioningNose,
    Verifying,
    Success,
    Failed,
    Stopped,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Success | Phase::Failed | Phase::Stopped)
    }

    /// Whether geometry checks against the session's target boxes apply.
    pub fn uses_target_geometry(self) -> bool {
        matches!(
            self,
            Phase::CenteringFace | Phase::PositioningNose | Phase::Verifying
        )
    }

    /// Short label suitable for a status line.
    pub fn label(self) -> &'static str {
        match self {
            Phase::Starting => "Starting...",
            Phase::CenteringFace => "Center face",
            Phase::PositioningNose => "Move nose",
            Phase::Verifying => "Verifying",
            Phase::Success => "Success",
            Phase::Failed => "Failed",
            Phase::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Error,
}

impl MessageLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageLevel::Info => "info",
            MessageLevel::Error => "error",
        }
    }
}

/// Receives user guidance emitted on phase entry.
pub trait Notifier: Send + Sync {
    fn user_message(&self, message: &str, level: MessageLevel);
}

/// Lifecycle events. Each maps to exactly one source phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    CenterFace,
    PositionNose,
    Verify,
    FinishSuccess,
    FinishFailed(String),
    Stop,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::CenterFace => "center_face",
            Event::PositionNose => "position_nose",
            Event::Verify => "verify",
            Event::FinishSuccess => "finish_success",
            Event::FinishFailed(_) => "finish_failed",
            Event::Stop => "stop",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("{event} is not allowed from phase {}", describe(.from))]
    InvalidTransition {
        event: &'static str,
        from: Option<Phase>,
    },
    #[error("{event} guard not satisfied by the latest detection")]
    GuardRejected { event: &'static str },
}

fn describe(phase: &Option<Phase>) -> &'static str {
    phase.map(Phase::label).unwrap_or("(none)")
}

/// Outcome of a legal transition: the phase change plus its guidance effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: Option<Phase>,
    pub to: Phase,
    pub guidance: Option<(String, MessageLevel)>,
}

/// The transition table as a pure function of (phase, event).
pub fn transition(from: Option<Phase>, event: &Event) -> Result<Transition, LifecycleError> {
    let info = |msg: &str| Some((msg.to_string(), MessageLevel::Info));
    let (to, guidance) = match (from, event) {
        (None, Event::Start) => (Phase::Starting, None),
        (Some(Phase::Starting), Event::CenterFace) => (
            Phase::CenteringFace,
            info("Put your face into the center of the box"),
        ),
        (Some(Phase::CenteringFace), Event::PositionNose) => {
            (Phase::PositioningNose, info("Put your nose to the yellow box"))
        }
        (Some(Phase::PositioningNose), Event::Verify) => (Phase::Verifying, info("Verifying...")),
        (Some(Phase::Verifying), Event::FinishSuccess) => (Phase::Success, info("Success")),
        (Some(Phase::Verifying), Event::FinishFailed(message)) => {
            let message = if message.is_empty() {
                "Verification failed"
            } else {
                message.as_str()
            };
            (Phase::Failed, Some((message.to_string(), MessageLevel::Error)))
        }
        (Some(phase), Event::Stop) if !phase.is_terminal() => (Phase::Stopped, info("Stopped")),
        _ => {
            return Err(LifecycleError::InvalidTransition {
                event: event.name(),
                from,
            })
        }
    };
    Ok(Transition { from, to, guidance })
}

/// Phase holder for one challenge instance.
#[derive(Default)]
pub struct ChallengeLifecycle {
    phase: Option<Phase>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl fmt::Debug for ChallengeLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeLifecycle")
            .field("phase", &self.phase)
            .field("has_notifier", &self.notifier.is_some())
            .finish()
    }
}

impl ChallengeLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase; `None` before `start`.
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn start(&mut self, notifier: Arc<dyn Notifier>) -> Result<Phase, LifecycleError> {
        let t = transition(self.phase, &Event::Start)?;
        self.notifier = Some(notifier);
        Ok(self.apply(t))
    }

    pub fn center_face(&mut self) -> Result<Phase, LifecycleError> {
        self.fire(Event::CenterFace)
    }

    /// Guarded by the face rectangle sitting inside the target face area.
    pub fn position_nose(
        &mut self,
        target: &GuidanceBox,
        detection: &DetectionResult,
    ) -> Result<Phase, LifecycleError> {
        let t = transition(self.phase, &Event::PositionNose)?;
        if !target.face_fits(detection) {
            return Err(LifecycleError::GuardRejected {
                event: Event::PositionNose.name(),
            });
        }
        Ok(self.apply(t))
    }

    /// Guarded by every nose-tip point sitting inside the target nose box.
    pub fn verify(
        &mut self,
        target: &GuidanceBox,
        detection: &DetectionResult,
    ) -> Result<Phase, LifecycleError> {
        let t = transition(self.phase, &Event::Verify)?;
        if !target.nose_fits(detection) {
            return Err(LifecycleError::GuardRejected {
                event: Event::Verify.name(),
            });
        }
        Ok(self.apply(t))
    }

    pub fn finish_success(&mut self) -> Result<Phase, LifecycleError> {
        self.fire(Event::FinishSuccess)
    }

    pub fn finish_failed(&mut self, message: &str) -> Result<Phase, LifecycleError> {
        self.fire(Event::FinishFailed(message.to_string()))
    }

    pub fn stop(&mut self) -> Result<Phase, LifecycleError> {
        self.fire(Event::Stop)
    }

    fn fire(&mut self, event: Event) -> Result<Phase, LifecycleError> {
        let t = transition(self.phase, &event)?;
        Ok(self.apply(t))
    }

    fn apply(&mut self, t: Transition) -> Phase {
        tracing::info!(from = ?t.from, to = ?t.to, "challenge phase changed");
        self.phase = Some(t.to);
        if let (Some(notifier), Some((message, level))) = (&self.notifier, &t.guidance) {
            notifier.user_message(message, *level);
        }
        t.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Point, Rect};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(String, MessageLevel)>>,
    }

    impl Notifier for Recorder {
        fn user_message(&self, message: &str, level: MessageLevel) {
            self.messages.lock().unwrap().push((message.to_string(), level));
        }
    }

    fn target() -> GuidanceBox {
        GuidanceBox {
            area: Rect::new(100, 100, 200, 200),
            nose: Rect::new(150, 150, 40, 40),
            min_face_area_percent: 40,
        }
    }

    fn centered_face() -> DetectionResult {
        DetectionResult {
            face: Some(Rect::new(120, 120, 150, 150)),
            nose_tip: vec![Point::new(160, 170), Point::new(175, 172)],
            nose_bridge: vec![Point::new(168, 140)],
        }
    }

    fn lifecycle_at(phase: Phase) -> (ChallengeLifecycle, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        let mut lc = ChallengeLifecycle::new();
        lc.start(rec.clone()).unwrap();
        let det = centered_face();
        let path = [
            Phase::CenteringFace,
            Phase::PositioningNose,
            Phase::Verifying,
        ];
        for step in path {
            if lc.phase() == Some(phase) {
                break;
            }
            match step {
                Phase::CenteringFace => lc.center_face().unwrap(),
                Phase::PositioningNose => lc.position_nose(&target(), &det).unwrap(),
                _ => lc.verify(&target(), &det).unwrap(),
            };
        }
        assert_eq!(lc.phase(), Some(phase));
        (lc, rec)
    }

    #[test]
    fn test_happy_path_emits_guidance_in_order() {
        let (mut lc, rec) = lifecycle_at(Phase::Verifying);
        lc.finish_success().unwrap();
        assert_eq!(lc.phase(), Some(Phase::Success));

        let messages: Vec<String> = rec
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect();
        assert_eq!(
            messages,
            vec![
                "Put your face into the center of the box",
                "Put your nose to the yellow box",
                "Verifying...",
                "Success",
            ]
        );
    }

    #[test]
    fn test_verify_from_centering_is_rejected() {
        let (mut lc, rec) = lifecycle_at(Phase::CenteringFace);
        let before = rec.messages.lock().unwrap().len();

        let err = lc.verify(&target(), &centered_face()).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                event: "verify",
                from: Some(Phase::CenteringFace)
            }
        );
        assert_eq!(lc.phase(), Some(Phase::CenteringFace));
        assert_eq!(rec.messages.lock().unwrap().len(), before);
    }

    #[test]
    fn test_second_verify_is_rejected() {
        let (mut lc, rec) = lifecycle_at(Phase::PositioningNose);
        lc.verify(&target(), &centered_face()).unwrap();
        let before = rec.messages.lock().unwrap().len();

        assert!(matches!(
            lc.verify(&target(), &centered_face()),
            Err(LifecycleError::InvalidTransition { .. })
        ));
        assert_eq!(lc.phase(), Some(Phase::Verifying));
        assert_eq!(rec.messages.lock().unwrap().len(), before);
    }

    #[test]
    fn test_stop_twice_from_every_reachable_phase() {
        for phase in [
            Phase::Starting,
            Phase::CenteringFace,
            Phase::PositioningNose,
            Phase::Verifying,
        ] {
            let (mut lc, _rec) = lifecycle_at(phase);
            assert_eq!(lc.stop(), Ok(Phase::Stopped));
            assert!(matches!(
                lc.stop(),
                Err(LifecycleError::InvalidTransition {
                    event: "stop",
                    from: Some(Phase::Stopped)
                })
            ));
            assert_eq!(lc.phase(), Some(Phase::Stopped));
        }
    }

    #[test]
    fn test_stop_after_terminal_is_rejected() {
        let (mut lc, _rec) = lifecycle_at(Phase::Verifying);
        lc.finish_failed("").unwrap();
        assert!(lc.stop().is_err());
        assert_eq!(lc.phase(), Some(Phase::Failed));
    }

    #[test]
    fn test_stop_before_start_is_rejected() {
        let mut lc = ChallengeLifecycle::new();
        assert!(lc.stop().is_err());
        assert_eq!(lc.phase(), None);
    }

    #[test]
    fn test_start_only_once() {
        let (mut lc, rec) = lifecycle_at(Phase::Starting);
        assert!(lc.start(rec).is_err());
        assert_eq!(lc.phase(), Some(Phase::Starting));
    }

    #[test]
    fn test_position_nose_guard() {
        let (mut lc, _rec) = lifecycle_at(Phase::CenteringFace);
        let outside = DetectionResult {
            face: Some(Rect::new(250, 120, 100, 100)),
            ..Default::default()
        };
        assert_eq!(
            lc.position_nose(&target(), &outside),
            Err(LifecycleError::GuardRejected {
                event: "position_nose"
            })
        );
        assert_eq!(
            lc.position_nose(&target(), &DetectionResult::default()),
            Err(LifecycleError::GuardRejected {
                event: "position_nose"
            })
        );
        assert_eq!(lc.phase(), Some(Phase::CenteringFace));
    }

    #[test]
    fn test_verify_guard() {
        let (mut lc, _rec) = lifecycle_at(Phase::PositioningNose);
        let mut det = centered_face();
        det.nose_tip.push(Point::new(10, 10));
        assert!(matches!(
            lc.verify(&target(), &det),
            Err(LifecycleError::GuardRejected { .. })
        ));
        assert_eq!(lc.phase(), Some(Phase::PositioningNose));
    }

    #[test]
    fn test_finish_failed_uses_error_level() {
        let (mut lc, rec) = lifecycle_at(Phase::Verifying);
        lc.finish_failed("face mismatch").unwrap();
        let last = rec.messages.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last, ("face mismatch".to_string(), MessageLevel::Error));

        let (mut lc, rec) = lifecycle_at(Phase::Verifying);
        lc.finish_failed("").unwrap();
        let last = rec.messages.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.0, "Verification failed");
    }

    /// Every accepted event over all short event sequences follows a declared edge.
    #[test]
    fn test_observed_phases_follow_declared_edges() {
        use Phase::*;
        let edges = [
            (None, Starting),
            (Some(Starting), CenteringFace),
            (Some(CenteringFace), PositioningNose),
            (Some(PositioningNose), Verifying),
            (Some(Verifying), Success),
            (Some(Verifying), Failed),
            (Some(Starting), Stopped),
            (Some(CenteringFace), Stopped),
            (Some(PositioningNose), Stopped),
            (Some(Verifying), Stopped),
        ];
        let events = [
            Event::Start,
            Event::CenterFace,
            Event::PositionNose,
            Event::Verify,
            Event::FinishSuccess,
            Event::FinishFailed(String::new()),
            Event::Stop,
        ];

        fn walk(
            from: Option<Phase>,
            depth: usize,
            events: &[Event],
            edges: &[(Option<Phase>, Phase)],
        ) {
            if depth == 0 {
                return;
            }
            for event in events {
                match transition(from, event) {
                    Ok(t) => {
                        assert!(
                            edges.contains(&(from, t.to)),
                            "undeclared edge {from:?} -> {:?}",
                            t.to
                        );
                        walk(Some(t.to), depth - 1, events, edges);
                    }
                    Err(LifecycleError::InvalidTransition { from: f, .. }) => {
                        assert_eq!(f, from)
                    }
                    Err(e) => panic!("unexpected error {e}"),
                }
            }
        }

        walk(None, 6, &events, &edges);
    }

    #[test]
    fn test_error_display() {
        let err = transition(None, &Event::Verify).unwrap_err();
        assert_eq!(err.to_string(), "verify is not allowed from phase (none)");
    }
}
