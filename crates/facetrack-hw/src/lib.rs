//! V4L2 camera capture.
//!
//! Opens a capture device, negotiates a grayscale-convertible pixel format
//! and streams frames from a background thread into a latest-frame channel
//! that implements the core `FrameSource` seam.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, V4l2Camera};
pub use frame::PixelFormat;
