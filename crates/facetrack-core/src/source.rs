//! Camera seam: where live frames come from.

use crate::frame::Frame;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("camera not found: {0}")]
    NotFound(String),
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera busy: {0}")]
    Busy(String),
    #[error("camera failure: {0}")]
    Failed(String),
    #[error("camera stream closed")]
    Closed,
    #[error("no frame available yet")]
    NoFrame,
}

/// An open camera stream.
#[allow(async_fn_in_trait)]
pub trait FrameSource {
    /// Wait until the stream delivers frames; returns their dimensions.
    async fn ready(&mut self) -> Result<(u32, u32), SourceError>;

    /// The most recent frame.
    fn current_frame(&mut self) -> Result<Frame, SourceError>;

    /// Release the device. Further calls return [`SourceError::Closed`].
    fn stop(&mut self);
}

/// Opens camera streams.
pub trait CameraProvider {
    type Source: FrameSource;

    fn open(&self) -> Result<Self::Source, SourceError>;
}
