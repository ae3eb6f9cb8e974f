// THEORY:
// A capture source hands frames to the perception loop one at a time. Three
// outcomes are possible for every pull: a frame, an unreadable frame (skipped
// by the caller; a camera hiccup must not end a test), or the end of the
// stream. Failing to open the source at all is the only fatal case.
//
// Sources are restartable: `open` rewinds to the first frame.

use crate::core_modules::frame::Frame;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture source `{name}` unavailable: {reason}")]
    Unavailable { name: String, reason: String },
}

#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    Unreadable(String),
    EndOfStream,
}

pub trait CaptureSource: Send + 'static {
    /// Opens (or rewinds) the source.
    fn open(&mut self) -> Result<(), CaptureError>;
    fn next_frame(&mut self) -> FrameRead;
}

/// Replays a directory of still images in file-name order at a nominal frame interval.
pub struct ImageSequenceSource {
    directory: PathBuf,
    frame_interval: Duration,
    files: Vec<PathBuf>,
    position: usize,
}

impl ImageSequenceSource {
    pub fn new(directory: impl Into<PathBuf>, frame_interval: Duration) -> Self {
        Self {
            directory: directory.into(),
            frame_interval,
            files: Vec::new(),
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn unavailable(&self, reason: impl Into<String>) -> CaptureError {
        CaptureError::Unavailable {
            name: self.directory.display().to_string(),
            reason: reason.into(),
        }
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl CaptureSource for ImageSequenceSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        let entries = std::fs::read_dir(&self.directory).map_err(|e| self.unavailable(e.to_string()))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        if files.is_empty() {
            return Err(self.unavailable("no image files"));
        }
        files.sort();
        info!(directory = %self.directory.display(), frames = files.len(), "image sequence opened");
        self.files = files;
        self.position = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> FrameRead {
        let Some(path) = self.files.get(self.position) else {
            return FrameRead::EndOfStream;
        };
        let timestamp = self.frame_interval * self.position as u32;
        self.position += 1;
        match image::open(path) {
            Ok(image) => FrameRead::Frame(Frame::from_dynamic(&image, timestamp)),
            Err(error) => {
                debug!(path = %path.display(), %error, "undecodable frame");
                FrameRead::Unreadable(format!("{}: {error}", path.display()))
            }
        }
    }
}

/// Replays frames held in memory. `None` entries read as unreadable frames.
pub struct ScriptedSource {
    frames: Vec<Option<Frame>>,
    position: usize,
    openable: bool,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Option<Frame>>) -> Self {
        Self {
            frames,
            position: 0,
            openable: true,
        }
    }

    /// A source whose `open` always fails.
    pub fn unavailable() -> Self {
        Self {
            frames: Vec::new(),
            position: 0,
            openable: false,
        }
    }
}

impl CaptureSource for ScriptedSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        if !self.openable {
            return Err(CaptureError::Unavailable {
                name: "scripted".into(),
                reason: "device missing".into(),
            });
        }
        self.position = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> FrameRead {
        let Some(entry) = self.frames.get(self.position) else {
            return FrameRead::EndOfStream;
        };
        self.position += 1;
        match entry {
            Some(frame) => FrameRead::Frame(frame.clone()),
            None => FrameRead::Unreadable(format!("scripted frame {} unreadable", self.position - 1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tester_watch_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn image_sequence_replays_in_name_order() {
        let dir = scratch_dir("sequence");
        GrayImage::from_pixel(4, 4, Luma([10])).save(dir.join("b.png")).expect("write png");
        GrayImage::from_pixel(4, 4, Luma([200])).save(dir.join("a.png")).expect("write png");
        std::fs::write(dir.join("c.png"), b"not an image").expect("write junk");
        std::fs::write(dir.join("notes.txt"), b"ignored").expect("write txt");

        let mut source = ImageSequenceSource::new(&dir, Duration::from_millis(100));
        source.open().expect("directory has images");

        assert_eq!(source.len(), 3);
        let FrameRead::Frame(first) = source.next_frame() else {
            panic!("expected a frame");
        };
        assert_eq!(first.image().get_pixel(0, 0)[0], 200);
        let FrameRead::Frame(second) = source.next_frame() else {
            panic!("expected a frame");
        };
        assert_eq!(second.timestamp(), Duration::from_millis(100));
        assert!(matches!(source.next_frame(), FrameRead::Unreadable(_)));
        assert!(matches!(source.next_frame(), FrameRead::EndOfStream));

        source.open().expect("rewind");
        assert!(matches!(source.next_frame(), FrameRead::Frame(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_or_empty_directory_is_unavailable() {
        let dir = scratch_dir("empty");

        assert!(ImageSequenceSource::new(&dir, Duration::ZERO).open().is_err());
        assert!(ImageSequenceSource::new(dir.join("missing"), Duration::ZERO).open().is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn scripted_source_reports_gaps_and_end() {
        let mut source = ScriptedSource::new(vec![Some(Frame::filled(2, 2, 0, Duration::ZERO)), None]);
        source.open().expect("scripted sources open");

        assert!(matches!(source.next_frame(), FrameRead::Frame(_)));
        assert!(matches!(source.next_frame(), FrameRead::Unreadable(_)));
        assert!(matches!(source.next_frame(), FrameRead::EndOfStream));
        assert!(ScriptedSource::unavailable().open().is_err());
    }
}
