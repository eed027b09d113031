//! facegate-hw — Camera capture for the identification console.
//!
//! Opens V4L2 devices, negotiates a frame format and hands back
//! grayscale frames ready for face localization.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use frame::{Frame, FrameError, PixelFormat};
