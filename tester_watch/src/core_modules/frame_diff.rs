// THEORY:
// `ChangeMask` is the binary result of comparing two grayscale frames: the
// absolute per-pixel intensity difference, thresholded so that only deltas
// strictly above the rig's threshold count as "changed". It is a plain data
// container. Deciding what a given amount or shape of change *means* is the
// detector's job; grouping changed pixels into regions lives in
// `region_detector`.

use image::GrayImage;

/// Which pixels changed between a frame and its reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMask {
    width: u32,
    height: u32,
    changed: Vec<bool>,
    changed_count: usize,
}

impl ChangeMask {
    /// Thresholded absolute difference of two equally sized frames.
    /// Returns `None` when the dimensions differ.
    pub fn between(current: &GrayImage, reference: &GrayImage, threshold: u8) -> Option<Self> {
        if current.dimensions() != reference.dimensions() {
            return None;
        }
        let changed: Vec<bool> = current
            .as_raw()
            .iter()
            .zip(reference.as_raw())
            .map(|(a, b)| a.abs_diff(*b) > threshold)
            .collect();
        let changed_count = changed.iter().filter(|c| **c).count();
        Some(Self {
            width: current.width(),
            height: current.height(),
            changed,
            changed_count,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn changed_pixels(&self) -> usize {
        self.changed_count
    }

    pub fn total_pixels(&self) -> usize {
        self.changed.len()
    }

    /// Fraction of the frame that changed, in `[0, 1]`. An empty frame reports 0.
    pub fn ratio(&self) -> f64 {
        if self.changed.is_empty() {
            return 0.0;
        }
        self.changed_count as f64 / self.changed.len() as f64
    }

    pub fn is_changed(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.changed[(y * self.width + x) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn delta_must_strictly_exceed_threshold() {
        let reference = GrayImage::from_pixel(2, 1, Luma([100]));
        let mut current = reference.clone();
        current.put_pixel(0, 0, Luma([150]));
        current.put_pixel(1, 0, Luma([151]));

        let mask = ChangeMask::between(&current, &reference, 50).expect("same size");

        assert!(!mask.is_changed(0, 0));
        assert!(mask.is_changed(1, 0));
        assert_eq!(mask.changed_pixels(), 1);
        assert_eq!(mask.ratio(), 0.5);
    }

    #[test]
    fn darkening_counts_as_change() {
        let reference = GrayImage::from_pixel(1, 1, Luma([200]));
        let current = GrayImage::from_pixel(1, 1, Luma([10]));

        let mask = ChangeMask::between(&current, &reference, 100).expect("same size");

        assert_eq!(mask.changed_pixels(), 1);
    }

    #[test]
    fn mismatched_dimensions_yield_none() {
        let a = GrayImage::new(4, 4);
        let b = GrayImage::new(4, 5);

        assert!(ChangeMask::between(&a, &b, 10).is_none());
    }
}
