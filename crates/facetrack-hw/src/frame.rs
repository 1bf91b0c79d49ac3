//! Pixel format conversion from raw V4L2 buffers to 8-bit grayscale.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("{format:?} buffer too short: expected {expected}, got {actual}")]
    TooShort {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

/// Capture formats we know how to turn into grayscale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed; luma is every even byte.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        match code {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Grey => 1,
            Self::Yuyv | Self::Y16 => 2,
        }
    }

    /// Extract `width * height` luma bytes from a raw buffer.
    pub fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
        let pixels = width as usize * height as usize;
        let expected = pixels * self.bytes_per_pixel();
        if buf.len() < expected {
            return Err(ConvertError::TooShort {
                format: self,
                expected,
                actual: buf.len(),
            });
        }
        let raw = &buf[..expected];
        Ok(match self {
            Self::Grey => raw.to_vec(),
            Self::Yuyv => raw.iter().step_by(2).copied().collect(),
            // High byte of each little-endian sample.
            Self::Y16 => raw.chunks_exact(2).map(|px| px[1]).collect(),
        })
    }
}

/// True when more than `threshold` of the pixels are near black (< 32).
pub fn is_dark_frame(gray: &[u8], threshold: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        let yuyv = vec![100, 128, 200, 128];
        assert_eq!(PixelFormat::Yuyv.to_grayscale(&yuyv, 2, 1).unwrap(), vec![100, 200]);
    }

    #[test]
    fn test_yuyv_4x2_takes_even_bytes() {
        let yuyv: Vec<u8> = (0..16).collect();
        let gray = PixelFormat::Yuyv.to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let err = PixelFormat::Yuyv.to_grayscale(&[100, 128], 2, 1).unwrap_err();
        assert_eq!(
            err,
            ConvertError::TooShort {
                format: PixelFormat::Yuyv,
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let y16 = vec![0x34, 0x12, 0xff, 0xab];
        assert_eq!(PixelFormat::Y16.to_grayscale(&y16, 2, 1).unwrap(), vec![0x12, 0xab]);
    }

    #[test]
    fn test_grey_truncates_padding() {
        let grey = vec![1, 2, 3, 4, 99, 99];
        assert_eq!(PixelFormat::Grey.to_grayscale(&grey, 2, 2).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_fourcc_lookup() {
        assert_eq!(PixelFormat::from_fourcc(b"GREY"), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(b"Y16 "), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), None);
    }

    #[test]
    fn test_dark_frame() {
        assert!(is_dark_frame(&[0u8; 1000], 0.95));
        assert!(!is_dark_frame(&[128u8; 1000], 0.95));
        assert!(is_dark_frame(&[], 0.95));
        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend([128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, 0.95));
    }
}
