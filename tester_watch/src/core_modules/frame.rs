// THEORY:
// A `Frame` is the unit a capture source hands to the detector: one 8-bit
// grayscale image plus the capture-relative time it was taken at. Every source
// (recorded image sequence, live camera, scripted test fixture) converts its
// native pixel layout into luminance here, so the change-detection layer only
// ever deals with a single channel.
//
// Timestamps are offsets from the start of capture rather than wall-clock
// instants. Recorded sources derive them from the frame index and a nominal
// frame rate, which keeps dwell measurements on replayed footage reproducible.

use image::{DynamicImage, GrayImage, Luma};
use std::time::Duration;

/// Rec. 601 luma weights.
const LUMA_RED: f32 = 0.299;
const LUMA_GREEN: f32 = 0.587;
const LUMA_BLUE: f32 = 0.114;

fn luma(red: u8, green: u8, blue: u8) -> u8 {
    let value = LUMA_RED * red as f32 + LUMA_GREEN * green as f32 + LUMA_BLUE * blue as f32;
    value.round().clamp(0.0, 255.0) as u8
}

/// A single grayscale camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    image: GrayImage,
    /// Time since the capture source started producing frames.
    timestamp: Duration,
}

impl Frame {
    pub fn new(image: GrayImage, timestamp: Duration) -> Self {
        Self { image, timestamp }
    }

    /// Converts a decoded image of any colour type to grayscale.
    pub fn from_dynamic(image: &DynamicImage, timestamp: Duration) -> Self {
        Self::new(image.to_luma8(), timestamp)
    }

    /// Builds a frame from a tightly packed RGBA buffer.
    /// Returns `None` when the buffer is shorter than `width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, buffer: &[u8], timestamp: Duration) -> Option<Self> {
        let pixel_count = width as usize * height as usize;
        if buffer.len() < pixel_count * 4 {
            return None;
        }
        let gray: Vec<u8> = buffer
            .chunks_exact(4)
            .take(pixel_count)
            .map(|px| luma(px[0], px[1], px[2]))
            .collect();
        GrayImage::from_raw(width, height, gray).map(|image| Self::new(image, timestamp))
    }

    /// A uniformly filled frame.
    pub fn filled(width: u32, height: u32, value: u8, timestamp: Duration) -> Self {
        Self::new(GrayImage::from_pixel(width, height, Luma([value])), timestamp)
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn into_image(self) -> GrayImage {
        self.image
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixel_count(&self) -> usize {
        self.image.width() as usize * self.image.height() as usize
    }
}
