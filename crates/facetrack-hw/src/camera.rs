//! V4L2 camera capture via the `v4l` crate.

use crate::frame::PixelFormat;
use facetrack_core::{CameraProvider, Frame, FrameSource, SourceError};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::watch;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

/// Consecutive dequeue failures after which the capture thread gives up.
const MAX_CAPTURE_FAILURES: u32 = 10;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device does not support video capture")]
    StreamingNotSupported,
}

impl From<CameraError> for SourceError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::DeviceNotFound(d) => SourceError::NotFound(d),
            CameraError::PermissionDenied(d) => SourceError::PermissionDenied(d),
            CameraError::DeviceBusy(d) => SourceError::Busy(d),
            other => SourceError::Failed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` and negotiate a `width` x `height` capture format.
    ///
    /// YUYV is requested; drivers that answer with GREY or Y16 are accepted too.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(&fourcc.repr).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {fourcc:?} (need YUYV, GREY or Y16)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Ask the driver for `fps` frames per second. Not every driver honours it.
    pub fn set_frame_rate(&self, fps: u32) {
        match self.device.set_params(&Parameters::with_fps(fps)) {
            Ok(params) => tracing::debug!(fps, interval = ?params.interval, "frame rate set"),
            Err(e) => tracing::warn!(fps, error = %e, "driver rejected frame rate"),
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Grab one frame on a short-lived stream.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("create mmap stream: {e}")))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;
        self.to_frame(buf, meta.sequence)
    }

    fn to_frame(&self, buf: &[u8], sequence: u32) -> Result<Frame, CameraError> {
        let gray = self
            .pixel_format
            .to_grayscale(buf, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
        Frame::new(gray, self.width, self.height, sequence).map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    /// Hand the device to a capture thread that keeps the latest frame available.
    pub fn into_stream(self) -> Result<CameraStream, CameraError> {
        let (tx, rx) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));
        let device_path = self.device_path.clone();

        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("facetrack-capture".into())
            .spawn(move || self.capture_loop(&tx, &thread_stop))
            .map_err(|e| CameraError::CaptureFailed(format!("spawn capture thread: {e}")))?;

        Ok(CameraStream::new(rx, stop, Some(handle), device_path))
    }

    fn capture_loop(self, tx: &watch::Sender<Option<Frame>>, stop: &AtomicBool) {
        let mut stream = match MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(device = %self.device_path, error = %e, "could not start streaming");
                return;
            }
        };

        let mut failures = 0u32;
        while !stop.load(Ordering::SeqCst) && !tx.is_closed() {
            let frame = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))
                .and_then(|(buf, meta)| self.to_frame(buf, meta.sequence));
            match frame {
                Ok(frame) => {
                    failures = 0;
                    tx.send_replace(Some(frame));
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "frame capture failed");
                    if failures >= MAX_CAPTURE_FAILURES {
                        tracing::error!(device = %self.device_path, "giving up on camera after repeated failures");
                        break;
                    }
                }
            }
        }
        tracing::debug!(device = %self.device_path, "capture thread exiting");
    }

    /// Video capture devices among /dev/video0..15.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

fn open_error(device_path: &str, e: io::Error) -> CameraError {
    let detail = format!("{device_path}: {e}");
    match e.kind() {
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(detail),
        io::ErrorKind::NotFound => CameraError::DeviceNotFound(detail),
        _ if detail.contains("busy") => CameraError::DeviceBusy(detail),
        _ => CameraError::CaptureFailed(detail),
    }
}

/// Live stream of the most recent frame from a capture thread.
pub struct CameraStream {
    rx: watch::Receiver<Option<Frame>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    device_path: String,
}

impl CameraStream {
    fn new(
        rx: watch::Receiver<Option<Frame>>,
        stop: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
        device_path: String,
    ) -> Self {
        Self {
            rx,
            stop,
            handle,
            device_path,
        }
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

impl FrameSource for CameraStream {
    async fn ready(&mut self) -> Result<(u32, u32), SourceError> {
        loop {
            if self.is_stopped() {
                return Err(SourceError::Closed);
            }
            if let Some(frame) = self.rx.borrow_and_update().as_ref() {
                return Ok((frame.width, frame.height));
            }
            self.rx.changed().await.map_err(|_| SourceError::Closed)?;
        }
    }

    fn current_frame(&mut self) -> Result<Frame, SourceError> {
        if self.is_stopped() {
            return Err(SourceError::Closed);
        }
        if let Some(frame) = self.rx.borrow().clone() {
            return Ok(frame);
        }
        if self.rx.has_changed().is_err() {
            // Sender gone and nothing was ever captured.
            return Err(SourceError::Closed);
        }
        Err(SourceError::NoFrame)
    }

    fn stop(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!(device = %self.device_path, "capture thread panicked");
            }
        }
        tracing::info!(device = %self.device_path, "camera released");
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens the configured V4L2 device as a [`CameraStream`].
#[derive(Debug, Clone)]
pub struct V4l2Camera {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl CameraProvider for V4l2Camera {
    type Source = CameraStream;

    fn open(&self) -> Result<CameraStream, SourceError> {
        let camera = Camera::open(&self.device, self.width, self.height)?;
        camera.set_frame_rate(self.frame_rate);
        Ok(camera.into_stream()?)
    }
}
