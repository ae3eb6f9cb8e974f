// THEORY:
// The `PerceptionTracker` is the detector-side half of a rig session. The
// `VisualDetector` answers single questions about a frame; the tracker knows
// which question to ask next and turns the answers into `PerceptionEvent`s.
//
// Phases:
// - Dormant: nothing to watch. Frames are not even pulled.
// - AwaitingBeginCapture: entered when the controller acknowledges `init`. The
//   reference is cleared so the first frame is accepted as stable.
// - AwaitingTestScreen: wait for a full-screen transition, then for the new
//   screen to settle.
// - AwaitingPopup: wait for a large contiguous change.
// - Watching: the popup is up. Small pointer-sized changes mean the operator
//   re-engaged. If frame time since the popup exceeds the dwell window first,
//   one `alert-due` is raised.
//
// The tracker returns to Dormant after reporting an interaction, or when the
// controller acknowledges an alert reset (for example after a switch press).

use crate::core_modules::frame::Frame;
use crate::core_modules::visual_detector::{DetectorProfile, VisualDetector};
use crate::protocol::{ControllerAck, PerceptionEvent, PerceptionKind, ReadyScreen, RigId, WireStage};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerPhase {
    Dormant,
    AwaitingBeginCapture,
    AwaitingTestScreen {
        /// A full-screen transition has been seen; waiting for it to settle.
        transitioned: bool,
    },
    AwaitingPopup,
    Watching {
        popup_at: Duration,
        alert_raised: bool,
    },
}

pub struct PerceptionTracker {
    rig: RigId,
    detector: VisualDetector,
    phase: TrackerPhase,
}

impl PerceptionTracker {
    pub fn new(rig: RigId, profile: DetectorProfile) -> Self {
        Self {
            rig,
            detector: VisualDetector::new(profile),
            phase: TrackerPhase::Dormant,
        }
    }

    pub fn phase(&self) -> TrackerPhase {
        self.phase
    }

    pub fn is_dormant(&self) -> bool {
        self.phase == TrackerPhase::Dormant
    }

    /// Follows the controller's acknowledgements.
    pub fn on_ack(&mut self, ack: ControllerAck) {
        if ack.is_success(WireStage::Init) {
            info!(rig = %self.rig, "controller initialised, waiting for a stable screen");
            self.detector.clear_reference();
            self.set_phase(TrackerPhase::AwaitingBeginCapture);
        } else if ack.is_success(WireStage::AlertReset) {
            self.set_phase(TrackerPhase::Dormant);
        }
    }

    /// Runs the check the current phase calls for. At most one event per frame.
    pub fn on_frame(&mut self, frame: &Frame) -> Option<PerceptionEvent> {
        match self.phase {
            TrackerPhase::Dormant => None,
            TrackerPhase::AwaitingBeginCapture => {
                if !self.detector.begin_capture_check(frame) {
                    return None;
                }
                self.set_phase(TrackerPhase::AwaitingTestScreen { transitioned: false });
                Some(self.event(PerceptionKind::StageReady(ReadyScreen::BeginCapture), frame))
            }
            TrackerPhase::AwaitingTestScreen { transitioned: false } => {
                if self.detector.transition_check(frame) {
                    debug!(rig = %self.rig, "screen transition observed");
                    self.phase = TrackerPhase::AwaitingTestScreen { transitioned: true };
                }
                None
            }
            TrackerPhase::AwaitingTestScreen { transitioned: true } => {
                if !self.detector.begin_capture_check(frame) {
                    return None;
                }
                self.set_phase(TrackerPhase::AwaitingPopup);
                Some(self.event(PerceptionKind::StageReady(ReadyScreen::TestScreen), frame))
            }
            TrackerPhase::AwaitingPopup => {
                if !self.detector.popup_check(frame) {
                    return None;
                }
                self.set_phase(TrackerPhase::Watching {
                    popup_at: frame.timestamp(),
                    alert_raised: false,
                });
                Some(self.event(PerceptionKind::PopupSeen, frame))
            }
            TrackerPhase::Watching { popup_at, alert_raised } => {
                if self.detector.interaction_check(frame) {
                    self.set_phase(TrackerPhase::Dormant);
                    return Some(self.event(PerceptionKind::InteractionSeen, frame));
                }
                let waited = frame.timestamp().saturating_sub(popup_at);
                if alert_raised || waited <= self.detector.profile().dwell_window() {
                    return None;
                }
                self.phase = TrackerPhase::Watching {
                    popup_at,
                    alert_raised: true,
                };
                Some(self.event(PerceptionKind::AlertDue, frame))
            }
        }
    }

    fn event(&self, kind: PerceptionKind, frame: &Frame) -> PerceptionEvent {
        PerceptionEvent {
            kind,
            rig: self.rig.clone(),
            timestamp: frame.timestamp(),
            confidence: self.detector.last_measure(),
        }
    }

    fn set_phase(&mut self, phase: TrackerPhase) {
        debug!(rig = %self.rig, from = ?self.phase, to = ?phase, "tracker phase");
        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireStatus;
    use image::{GrayImage, Luma};

    fn tracker() -> PerceptionTracker {
        let profile = DetectorProfile {
            threshold: 30,
            significant_ratio: 0.01,
            minor_ratio: 0.0001,
            pointer_ratio: 0.001,
            dwell_window_secs: 5.0,
            ..DetectorProfile::default()
        };
        PerceptionTracker::new(RigId::new("vid1").expect("valid id"), profile)
    }

    fn at(value: u8, secs: u64) -> Frame {
        Frame::filled(200, 200, value, Duration::from_secs(secs))
    }

    /// A 200x200 frame at 200 with a 50x40 dark block in the corner.
    fn popup(secs: u64) -> Frame {
        let mut image = GrayImage::from_pixel(200, 200, Luma([200]));
        for y in 0..40 {
            for x in 0..50 {
                image.put_pixel(x, y, Luma([0]));
            }
        }
        Frame::new(image, Duration::from_secs(secs))
    }

    /// The popup frame with a 4x4 pointer moved onto the bright area.
    fn pointer(secs: u64) -> Frame {
        let mut image = popup(secs).into_image();
        for y in 100..104 {
            for x in 100..104 {
                image.put_pixel(x, y, Luma([0]));
            }
        }
        Frame::new(image, Duration::from_secs(secs))
    }

    fn init_ack() -> ControllerAck {
        ControllerAck {
            stage: WireStage::Init,
            status: WireStatus::Success,
        }
    }

    fn kind(event: Option<PerceptionEvent>) -> Option<PerceptionKind> {
        event.map(|e| e.kind)
    }

    fn drive_to_popup(tracker: &mut PerceptionTracker) {
        tracker.on_ack(init_ack());
        assert_eq!(
            kind(tracker.on_frame(&at(0, 0))),
            Some(PerceptionKind::StageReady(ReadyScreen::BeginCapture))
        );
        assert_eq!(kind(tracker.on_frame(&at(200, 1))), None);
        assert_eq!(
            kind(tracker.on_frame(&at(200, 2))),
            Some(PerceptionKind::StageReady(ReadyScreen::TestScreen))
        );
        let seen = tracker.on_frame(&popup(3)).expect("popup detected");
        assert_eq!(seen.kind, PerceptionKind::PopupSeen);
        assert_eq!(seen.confidence.largest_region, 2000);
    }

    #[test]
    fn dormant_until_init_is_acknowledged() {
        let mut tracker = tracker();

        assert!(tracker.is_dormant());
        assert!(tracker.on_frame(&at(0, 0)).is_none());
        tracker.on_ack(ControllerAck {
            stage: WireStage::Init,
            status: WireStatus::Failed,
        });
        assert!(tracker.is_dormant());
    }

    #[test]
    fn full_cycle_ends_with_interaction() {
        let mut tracker = tracker();
        drive_to_popup(&mut tracker);

        assert_eq!(kind(tracker.on_frame(&popup(4))), None);
        assert_eq!(kind(tracker.on_frame(&pointer(5))), Some(PerceptionKind::InteractionSeen));
        assert!(tracker.is_dormant());
    }

    #[test]
    fn alert_due_is_raised_once_after_dwell() {
        let mut tracker = tracker();
        drive_to_popup(&mut tracker);

        assert_eq!(kind(tracker.on_frame(&popup(8))), None);
        assert_eq!(kind(tracker.on_frame(&popup(9))), Some(PerceptionKind::AlertDue));
        assert_eq!(kind(tracker.on_frame(&popup(10))), None);
        // Interaction still ends the cycle after the alert.
        assert_eq!(kind(tracker.on_frame(&pointer(11))), Some(PerceptionKind::InteractionSeen));
    }

    #[test]
    fn alert_reset_ack_makes_tracker_dormant() {
        let mut tracker = tracker();
        drive_to_popup(&mut tracker);

        tracker.on_ack(ControllerAck {
            stage: WireStage::AlertReset,
            status: WireStatus::Success,
        });

        assert!(tracker.is_dormant());
    }

    #[test]
    fn init_ack_restarts_from_a_fresh_reference() {
        let mut tracker = tracker();
        drive_to_popup(&mut tracker);

        tracker.on_ack(init_ack());

        assert_eq!(tracker.phase(), TrackerPhase::AwaitingBeginCapture);
        assert_eq!(
            kind(tracker.on_frame(&at(90, 20))),
            Some(PerceptionKind::StageReady(ReadyScreen::BeginCapture))
        );
    }
}
