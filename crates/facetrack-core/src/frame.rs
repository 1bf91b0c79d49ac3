//! Grayscale video frame shared by the camera, the analyzer and the capture path.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height}")]
    InvalidLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
}

/// A captured grayscale frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
        })
    }

    /// Decode any image format the `image` crate understands into a grayscale frame.
    pub fn from_image_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let gray = image::load_from_memory(bytes)?.to_luma8();
        let (width, height) = gray.dimensions();
        Self::new(gray.into_raw(), width, height, 0)
    }

    /// Encode the full frame as a JPEG still.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).write_image(
            &self.data,
            self.width,
            self.height,
            ExtendedColorType::L8,
        )?;
        Ok(out)
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_wrong_length() {
        let result = Frame::new(vec![0u8; 10], 4, 4, 0);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 16, actual: 10, .. })
        ));
    }

    #[test]
    fn test_jpeg_roundtrip_keeps_dimensions() {
        let data: Vec<u8> = (0..64 * 48).map(|i| (i % 256) as u8).collect();
        let frame = Frame::new(data, 64, 48, 7).unwrap();
        let jpeg = frame.encode_jpeg(90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "JPEG SOI marker");

        let decoded = Frame::from_image_bytes(&jpeg).unwrap();
        assert_eq!((decoded.width, decoded.height), (64, 48));
    }

    #[test]
    fn test_from_image_bytes_rejects_garbage() {
        assert!(Frame::from_image_bytes(b"not an image").is_err());
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(vec![100, 200], 2, 1, 0).unwrap();
        assert!((frame.avg_brightness() - 150.0).abs() < 1e-6);
    }
}
