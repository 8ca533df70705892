//! Replay capture from a directory of still images.
//!
//! The directory holds PNG/JPEG frames played back in file-name order, plus
//! an optional `annotations.json` mapping file names to face boxes:
//!
//! ```json
//! { "0001.png": [{ "x": 210, "y": 90, "width": 160, "height": 190, "confidence": 0.93 }] }
//! ```
//!
//! The source and its [`ReplayDetector`] together stand in for a camera and a
//! detection model on a bench terminal.

use crate::frame::Frame;
use crate::source::{DetectorError, FaceDetector, FramePacer, FrameSource, SensorError};
use bioentry_core::BoundingBox;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const ANNOTATIONS_FILE: &str = "annotations.json";

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("bad annotations: {0}")]
    Annotations(#[from] serde_json::Error),
    #[error("no frames in {0}")]
    Empty(PathBuf),
}

struct ReplayFrame {
    name: String,
    width: u32,
    height: u32,
    data: Vec<u8>,
}

/// Summary of a loaded replay directory.
#[derive(Debug, Clone)]
pub struct ReplayInfo {
    pub frames: usize,
    pub annotated: usize,
    pub width: u32,
    pub height: u32,
}

pub struct ReplaySource {
    dir: PathBuf,
    frames: Arc<Vec<ReplayFrame>>,
    faces: Arc<Vec<Vec<BoundingBox>>>,
    sequence: u64,
    pacer: FramePacer,
}

impl ReplaySource {
    /// Load every image in `dir` and play them back at `fps`.
    pub fn open(dir: impl AsRef<Path>, fps: u32) -> Result<Self, ReplayError> {
        let dir = dir.as_ref().to_path_buf();
        let (frames, faces) = load_dir(&dir)?;
        tracing::info!(
            dir = %dir.display(),
            frames = frames.len(),
            fps,
            "replay source opened"
        );
        Ok(Self {
            dir,
            frames: Arc::new(frames),
            faces: Arc::new(faces),
            sequence: 0,
            pacer: FramePacer::new(fps),
        })
    }

    /// Detector that answers from the annotations of this source.
    pub fn detector(&self) -> ReplayDetector {
        ReplayDetector {
            faces: Arc::clone(&self.faces),
        }
    }

    pub fn info(&self) -> ReplayInfo {
        let first = &self.frames[0];
        ReplayInfo {
            frames: self.frames.len(),
            annotated: self.faces.iter().filter(|f| !f.is_empty()).count(),
            width: first.width,
            height: first.height,
        }
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Frame, SensorError> {
        self.pacer.wait();
        let idx = (self.sequence % self.frames.len() as u64) as usize;
        let src = &self.frames[idx];
        tracing::trace!(seq = self.sequence, file = %src.name, "replay frame");
        let frame = Frame::new(src.data.clone(), src.width, src.height, self.sequence);
        self.sequence += 1;
        Ok(frame)
    }

    fn reacquire(&mut self) -> Result<(), SensorError> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(SensorError::Unavailable(format!(
                "replay directory missing: {}",
                self.dir.display()
            )))
        }
    }

    fn frame_interval(&self) -> Duration {
        self.pacer.interval()
    }
}

/// Returns the annotated faces for a replayed frame, indexed by sequence.
pub struct ReplayDetector {
    faces: Arc<Vec<Vec<BoundingBox>>>,
}

impl FaceDetector for ReplayDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        if self.faces.is_empty() {
            return Err(DetectorError::Unavailable("no replay frames".into()));
        }
        let idx = (frame.sequence % self.faces.len() as u64) as usize;
        Ok(self.faces[idx].clone())
    }
}

fn load_dir(dir: &Path) -> Result<(Vec<ReplayFrame>, Vec<Vec<BoundingBox>>), ReplayError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_image(p))
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(ReplayError::Empty(dir.to_path_buf()));
    }

    let annotations_path = dir.join(ANNOTATIONS_FILE);
    let mut annotations: HashMap<String, Vec<BoundingBox>> = if annotations_path.exists() {
        serde_json::from_str(&std::fs::read_to_string(&annotations_path)?)?
    } else {
        tracing::warn!(dir = %dir.display(), "no annotations; replay detector will see no faces");
        HashMap::new()
    };

    let mut frames = Vec::with_capacity(paths.len());
    let mut faces = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let gray = image::open(&path)?.to_luma8();
        let (width, height) = gray.dimensions();
        faces.push(annotations.remove(&name).unwrap_or_default());
        frames.push(ReplayFrame {
            name,
            width,
            height,
            data: gray.into_raw(),
        });
    }

    if !annotations.is_empty() {
        tracing::warn!(
            unmatched = ?annotations.keys().collect::<Vec<_>>(),
            "annotations reference missing frames"
        );
    }

    Ok((frames, faces))
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("png" | "jpg" | "jpeg")
    )
}
