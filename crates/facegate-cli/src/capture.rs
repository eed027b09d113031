//! Glue between the hardware crate, the SCRFD locator and the session engine.

use anyhow::{Context, Result};
use facegate_core::detector::{DetectorError, ScrfdLocator};
use facegate_core::session::{FaceLocator, FrameSource, SourceError, WholeFrameLocator};
use facegate_core::Region;
use facegate_hw::{Camera, CameraError};
use image::GrayImage;
use std::path::Path;

/// Live camera frames for [`facegate_core::Engine::run`].
pub struct CameraSource {
    camera: Camera,
}

impl CameraSource {
    pub fn open(device: &str, width: u32, height: u32) -> Result<Self, SourceError> {
        let camera = Camera::open(device, width, height).map_err(|e| SourceError::Unavailable(e.to_string()))?;
        Ok(Self { camera })
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Result<Option<GrayImage>, SourceError> {
        let frame = self.camera.capture_frame().map_err(|e| match e {
            CameraError::DeviceNotFound(_) | CameraError::DeviceBusy => SourceError::Unavailable(e.to_string()),
            _ => SourceError::ReadFailed(e.to_string()),
        })?;
        let image = frame.into_image().map_err(|e| SourceError::ReadFailed(e.to_string()))?;
        Ok(Some(image))
    }
}

/// Face locator picked by configuration.
pub enum Locator {
    Scrfd(Box<ScrfdLocator>),
    WholeFrame(WholeFrameLocator),
}

impl Locator {
    /// SCRFD when `detect` is set (the model must exist), whole frame otherwise.
    pub fn from_config(detect: bool, model_path: &Path) -> Result<Self> {
        if !detect {
            return Ok(Self::WholeFrame(WholeFrameLocator));
        }
        let scrfd = ScrfdLocator::load(model_path)
            .context("loading face detector (set detect = false or FACEGATE_DETECT=0 to use whole frames)")?;
        Ok(Self::Scrfd(Box::new(scrfd)))
    }
}

impl FaceLocator for Locator {
    type Error = DetectorError;

    fn locate(&mut self, frame: &GrayImage) -> Result<Vec<Region>, DetectorError> {
        match self {
            Self::Scrfd(scrfd) => scrfd.locate(frame),
            Self::WholeFrame(whole) => match whole.locate(frame) {
                Ok(regions) => Ok(regions),
                Err(never) => match never {},
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_frame_locator_without_detection() {
        let mut locator = Locator::from_config(false, Path::new("/nonexistent/det.onnx")).unwrap();
        let regions = locator.locate(&GrayImage::new(40, 30)).unwrap();
        assert_eq!(regions, vec![Region::full(40, 30)]);
    }

    #[test]
    fn test_missing_model_is_an_error() {
        let err = Locator::from_config(true, Path::new("/nonexistent/det.onnx")).err().unwrap();
        assert!(format!("{err:#}").contains("model file not found"));
    }

    #[test]
    fn test_missing_camera_is_unavailable() {
        let err = CameraSource::open("/dev/facegate-missing", 640, 480).err().unwrap();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }
}
