use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::time::Instant;
use tester_watch::capture::{CaptureError, CaptureSource, FrameRead};
use tester_watch::Frame;

/// A live camera opened through OpenCV.
pub struct CameraSource {
    index: i32,
    capture: Option<VideoCapture>,
    started: Instant,
}

impl CameraSource {
    pub fn new(index: i32) -> Self {
        Self {
            index,
            capture: None,
            started: Instant::now(),
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> CaptureError {
        CaptureError::Unavailable {
            name: format!("camera {}", self.index),
            reason: reason.into(),
        }
    }

    fn convert(frame: &Mat, started: Instant) -> opencv::Result<Option<Frame>> {
        // OpenCV delivers BGR; the detector wants luma from RGBA.
        let mut rgba = Mat::default();
        imgproc::cvt_color(frame, &mut rgba, imgproc::COLOR_BGR2RGBA, 0)?;
        let width = rgba.cols() as u32;
        let height = rgba.rows() as u32;
        Ok(Frame::from_rgba(width, height, rgba.data_bytes()?, started.elapsed()))
    }
}

impl CaptureSource for CameraSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        let capture = VideoCapture::new(self.index, videoio::CAP_ANY).map_err(|e| self.unavailable(e.to_string()))?;
        if !capture.is_opened().unwrap_or(false) {
            return Err(self.unavailable("device did not open"));
        }
        self.capture = Some(capture);
        self.started = Instant::now();
        Ok(())
    }

    fn next_frame(&mut self) -> FrameRead {
        let Some(capture) = self.capture.as_mut() else {
            return FrameRead::EndOfStream;
        };
        let mut frame = Mat::default();
        match capture.read(&mut frame) {
            Ok(true) if !frame.empty() => match Self::convert(&frame, self.started) {
                Ok(Some(frame)) => FrameRead::Frame(frame),
                Ok(None) => FrameRead::Unreadable("short frame buffer".into()),
                Err(e) => FrameRead::Unreadable(e.to_string()),
            },
            Ok(_) => FrameRead::Unreadable("empty frame".into()),
            Err(e) => FrameRead::Unreadable(e.to_string()),
        }
    }
}
