// THEORY:
// `core_modules` holds the vision side of the crate, layered bottom-up:
// `frame` (grayscale frames) → `frame_diff` (thresholded change masks) →
// `region_detector` (connected changed regions) → `visual_detector` (the four
// screen checks) → `perception` (which check to run next, and the events it
// produces). Nothing in here knows about hardware or the stage machine.

pub mod frame;
pub mod frame_diff;
pub mod perception;
pub mod region_detector;
pub mod visual_detector;
