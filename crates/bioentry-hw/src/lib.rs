//! bioentry-hw: Hardware abstraction for the terminal's capture path.
//!
//! Defines the frame type and the camera/detector seams consumed by the
//! capture loop, plus a replay source that plays back annotated stills.

pub mod frame;
pub mod replay;
pub mod source;

pub use frame::{Frame, FrameError};
pub use replay::{ReplayDetector, ReplayError, ReplayInfo, ReplaySource};
pub use source::{DetectorError, FaceDetector, FramePacer, FrameSource, SensorError};
