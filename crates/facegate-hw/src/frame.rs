//! Frame type and raw-buffer conversion to 8-bit grayscale.

use image::GrayImage;
use thiserror::Error;

/// A captured grayscale camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl Frame {
    /// Wrap the pixel data as an image without copying.
    pub fn into_image(self) -> Result<GrayImage, FrameError> {
        let expected = self.width as usize * self.height as usize;
        let actual = self.data.len();
        GrayImage::from_raw(self.width, self.height, self.data).ok_or(FrameError::InvalidLength { expected, actual })
    }
}

/// Pixel formats the camera layer can turn into grayscale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale, kept to its high byte.
    Y16,
}

impl PixelFormat {
    /// Match a V4L2 FourCC code.
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

    /// Convert a raw buffer of this format to `width * height` gray bytes.
    pub fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
        let pixels = width as usize * height as usize;
        let expected = pixels * self.bytes_per_pixel();
        if buf.len() < expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: buf.len(),
            });
        }

        Ok(match self {
            Self::Grey => buf[..pixels].to_vec(),
            Self::Yuyv => buf[..expected].iter().step_by(2).copied().collect(),
            Self::Y16 => buf[..expected].chunks_exact(2).map(|px| px[1]).collect(),
        })
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
