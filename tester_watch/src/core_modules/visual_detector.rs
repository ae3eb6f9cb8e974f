// THEORY:
// The `VisualDetector` turns a stream of grayscale frames into yes/no answers
// about what the tester screen is doing. It owns exactly one piece of state,
// the reference frame, and every check compares the incoming frame against it.
//
// Checks:
// 1.  `begin_capture_check`: has the screen settled? The first frame ever seen
//     is settled by definition. While the screen is still moving the reference
//     is held, so the settling is measured against the last stable picture.
// 2.  `transition_check`: did (most of) the whole screen just change?
// 3.  `popup_check`: did a large, contiguous part of the screen change? Both a
//     significant changed ratio and one sufficiently large connected region are
//     required.
// 4.  `interaction_check`: did a small part of the screen change, inside the
//     band between the minor floor and the pointer ceiling?
//
// Apart from a waiting `begin_capture_check`, every check re-bases the
// reference to the frame it just evaluated, so each answer describes the change
// since the previous frame.
//
// Thresholds come from a `DetectorProfile`, one per rig type.

use crate::core_modules::frame::Frame;
use crate::core_modules::frame_diff::ChangeMask;
use crate::core_modules::region_detector::{find_regions, largest_region_area};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Rig type used when a configuration does not name one.
pub const DEFAULT_RIG_TYPE: usize = 2;

/// Per-rig-type `(threshold, dwell seconds)` pairs.
const RIG_TYPES: [(u8, f64); 3] = [(150, 30.0), (150, 30.0), (100, 30.0)];

/// Tunable parameters of the change detector for one type of tester rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorProfile {
    /// Minimum per-pixel intensity delta (exclusive) for a pixel to count as changed.
    pub threshold: u8,
    /// Seconds without interaction after a popup before an alert is due.
    pub dwell_window_secs: f64,
    /// Changed ratio below which the screen counts as settled. Above it, a full-screen transition.
    pub stable_ratio: f64,
    /// Changed ratio a popup must exceed.
    pub significant_ratio: f64,
    /// Exclusive lower bound of the interaction band.
    pub minor_ratio: f64,
    /// Exclusive upper bound of the interaction band.
    pub pointer_ratio: f64,
    /// Area (pixels) a connected region must enclose, exclusive, for a popup.
    pub min_region_area: usize,
    /// Consecutive unsettled frames before the settle reference is re-anchored. 0 disables.
    pub max_settle_frames: u32,
}

impl DetectorProfile {
    /// Built-in profile for a rig type, if the type is known.
    pub fn for_rig_type(rig_type: usize) -> Option<Self> {
        let (threshold, dwell_window_secs) = *RIG_TYPES.get(rig_type)?;
        Some(Self {
            threshold,
            dwell_window_secs,
            stable_ratio: 0.5,
            significant_ratio: 0.001,
            minor_ratio: 0.0001,
            pointer_ratio: 0.0009,
            min_region_area: 1000,
            max_settle_frames: 0,
        })
    }

    pub fn dwell_window(&self) -> Duration {
        Duration::from_secs_f64(self.dwell_window_secs.max(0.0))
    }
}

impl Default for DetectorProfile {
    fn default() -> Self {
        let (threshold, dwell_window_secs) = RIG_TYPES[DEFAULT_RIG_TYPE];
        Self {
            threshold,
            dwell_window_secs,
            stable_ratio: 0.5,
            significant_ratio: 0.001,
            minor_ratio: 0.0001,
            pointer_ratio: 0.0009,
            min_region_area: 1000,
            max_settle_frames: 0,
        }
    }
}

/// The measurements behind the most recent check, reported alongside events.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameMeasure {
    pub changed_ratio: f64,
    pub largest_region: usize,
}

pub struct VisualDetector {
    profile: DetectorProfile,
    reference: Option<GrayImage>,
    unsettled_frames: u32,
    last_measure: FrameMeasure,
}

impl VisualDetector {
    pub fn new(profile: DetectorProfile) -> Self {
        Self {
            profile,
            reference: None,
            unsettled_frames: 0,
            last_measure: FrameMeasure::default(),
        }
    }

    pub fn profile(&self) -> &DetectorProfile {
        &self.profile
    }

    pub fn last_measure(&self) -> FrameMeasure {
        self.last_measure
    }

    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Forgets the reference; the next `begin_capture_check` is immediately settled.
    pub fn clear_reference(&mut self) {
        self.reference = None;
        self.unsettled_frames = 0;
        self.last_measure = FrameMeasure::default();
    }

    pub fn begin_capture_check(&mut self, frame: &Frame) -> bool {
        let Some(mask) = self.compare(frame) else {
            self.rebase(frame);
            self.last_measure = FrameMeasure::default();
            self.unsettled_frames = 0;
            return true;
        };
        let ratio = mask.ratio();
        self.last_measure = FrameMeasure {
            changed_ratio: ratio,
            largest_region: 0,
        };

        if ratio < self.profile.stable_ratio {
            self.rebase(frame);
            self.unsettled_frames = 0;
            return true;
        }

        self.unsettled_frames += 1;
        if self.profile.max_settle_frames > 0 && self.unsettled_frames >= self.profile.max_settle_frames {
            warn!(
                frames = self.unsettled_frames,
                ratio, "screen did not settle, re-anchoring reference"
            );
            self.rebase(frame);
            self.unsettled_frames = 0;
        }
        false
    }

    pub fn transition_check(&mut self, frame: &Frame) -> bool {
        let ratio = self.measure_and_rebase(frame, false).map(|m| m.changed_ratio);
        matches!(ratio, Some(r) if r > self.profile.stable_ratio)
    }

    pub fn popup_check(&mut self, frame: &Frame) -> bool {
        match self.measure_and_rebase(frame, true) {
            Some(m) => {
                m.changed_ratio > self.profile.significant_ratio
                    && m.largest_region > self.profile.min_region_area
            }
            None => false,
        }
    }

    pub fn interaction_check(&mut self, frame: &Frame) -> bool {
        match self.measure_and_rebase(frame, false) {
            Some(m) => {
                m.changed_ratio > self.profile.minor_ratio && m.changed_ratio < self.profile.pointer_ratio
            }
            None => false,
        }
    }

    /// Measures the change against the reference, then re-bases.
    /// `None` when there was no comparable reference.
    fn measure_and_rebase(&mut self, frame: &Frame, with_regions: bool) -> Option<FrameMeasure> {
        let measure = self.compare(frame).map(|mask| {
            let changed_ratio = mask.ratio();
            // Regions only matter once the ratio alone already qualifies.
            let largest_region = if with_regions && changed_ratio > self.profile.significant_ratio {
                largest_region_area(&find_regions(&mask))
            } else {
                0
            };
            FrameMeasure {
                changed_ratio,
                largest_region,
            }
        });
        self.last_measure = measure.unwrap_or_default();
        self.rebase(frame);
        measure
    }

    fn compare(&self, frame: &Frame) -> Option<ChangeMask> {
        let reference = self.reference.as_ref()?;
        let mask = ChangeMask::between(frame.image(), reference, self.profile.threshold);
        if mask.is_none() {
            debug!(
                width = frame.width(),
                height = frame.height(),
                "frame size differs from reference"
            );
        }
        mask
    }

    fn rebase(&mut self, frame: &Frame) {
        self.reference = Some(frame.image().clone());
    }
}
