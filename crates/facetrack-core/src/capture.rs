//! Turning a click on an unknown face into a [`PendingCapture`].

use crate::frame::{Frame, FrameError};
use crate::pipeline::TrackedFace;
use crate::source::SourceError;
use crate::types::PendingCapture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("frame grab: {0}")]
    Source(#[from] SourceError),
    #[error("snapshot encoding: {0}")]
    Encode(#[from] FrameError),
}

/// Pointer position in display coordinates, with the displayed width of the
/// video surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
    pub x: f32,
    pub y: f32,
    pub display_width: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureBridge {
    pub hit_padding: f32,
    pub jpeg_quality: u8,
}

impl Default for CaptureBridge {
    fn default() -> Self {
        Self {
            hit_padding: 10.0,
            jpeg_quality: 90,
        }
    }
}

impl CaptureBridge {
    pub fn new(hit_padding: f32, jpeg_quality: u8) -> Self {
        Self {
            hit_padding,
            jpeg_quality,
        }
    }

    /// Capture the last face if it is unrecognised and the pointer is on it.
    ///
    /// `surface_width` is the intrinsic width of the video surface; both
    /// pointer axes are scaled by `surface_width / display_width`. The frame is
    /// only grabbed once the hit test passes.
    pub fn claim<G>(
        &self,
        pointer: &PointerEvent,
        surface_width: u32,
        last_face: Option<&TrackedFace>,
        grab_frame: G,
    ) -> Result<Option<PendingCapture>, CaptureError>
    where
        G: FnOnce() -> Result<Frame, SourceError>,
    {
        let Some(face) = last_face else {
            return Ok(None);
        };
        if !face.recognition.is_unknown() {
            return Ok(None);
        }
        if !(pointer.display_width > 0.0) {
            tracing::debug!(display_width = pointer.display_width, "ignoring claim on zero-width display");
            return Ok(None);
        }

        let scale = surface_width as f32 / pointer.display_width;
        let (x, y) = (pointer.x * scale, pointer.y * scale);
        let hit_area = face.detection.bbox.expand(self.hit_padding);
        if !hit_area.contains(x, y) {
            tracing::trace!(x, y, ?hit_area, "claim missed the face");
            return Ok(None);
        }

        let frame = grab_frame()?;
        let image = frame.encode_jpeg(self.jpeg_quality)?;
        let detection = &face.detection;
        tracing::info!(bytes = image.len(), "captured unknown face");

        Ok(Some(PendingCapture {
            image,
            embedding: detection.embedding.clone(),
            age: detection.rounded_age(),
            gender: detection.gender.clone(),
            expression: detection.dominant_expression(),
        }))
    }
}
