//! Frame type and image utilities: dark detection and JPEG encoding.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use std::time::Instant;

/// Share of pixels in the darkest bucket above which a frame is considered dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// A captured grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    /// Monotonic per-source sequence number.
    pub sequence: u64,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap grayscale pixels captured now.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_THRESHOLD);
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    /// Encode the frame as a baseline grayscale JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let expected = self.width as usize * self.height as usize;
        if self.data.len() < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: self.data.len(),
            });
        }

        let mut out = Vec::with_capacity(expected / 4);
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .write_image(
                &self.data[..expected],
                self.width,
                self.height,
                ExtendedColorType::L8,
            )
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out)
    }
}

/// Check if a frame is dark.
///
/// Returns true if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("jpeg encoding failed: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dark_frame_all_black() {
        let gray = vec![0u8; 1000];
        assert!(is_dark_frame(&gray, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_normal() {
        let gray = vec![128u8; 1000];
        assert!(!is_dark_frame(&gray, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_dark_frame_borderline_bright() {
        // 94% dark, 6% bright → should NOT be dark
        let mut gray = vec![10u8; 940];
        gray.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&gray, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_new_flags_dark_frames() {
        assert!(Frame::new(vec![0u8; 64], 8, 8, 0).is_dark);
        assert!(!Frame::new(vec![200u8; 64], 8, 8, 1).is_dark);
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(vec![100, 200], 2, 1, 0);
        assert!((frame.avg_brightness() - 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_encode_jpeg_produces_jfif() {
        let data: Vec<u8> = (0..64 * 48).map(|i| (i % 251) as u8).collect();
        let frame = Frame::new(data, 64, 48, 0);
        let jpeg = frame.encode_jpeg(85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_encode_jpeg_short_buffer() {
        let frame = Frame::new(vec![128u8; 10], 8, 8, 0);
        assert!(matches!(
            frame.encode_jpeg(85),
            Err(FrameError::InvalidLength { expected: 64, actual: 10 })
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_encode_jpeg_huge_dimensions_rejected() {
        // 70000 * 70000 does not fit in u32
        let frame = Frame::new(vec![128u8; 16], 70_000, 70_000, 0);
        assert!(matches!(
            frame.encode_jpeg(85),
            Err(FrameError::InvalidLength { expected: 4_900_000_000, actual: 16 })
        ));
    }
}
