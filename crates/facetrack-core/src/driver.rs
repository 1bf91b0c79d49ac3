//! Detection cycle driver: brings a stream up, runs it one tick at a time,
//! and tears it down.
//!
//! ```text
//! Uninitialized -> AwaitingCapability -> AwaitingCameraStream -> Ready
//!     -> Running <-> ErrorRecovering -> Stopped
//! ```
//!
//! The host owns scheduling and calls [`StreamDriver::tick`] once per frame.
//! A tick is never re-entered; failures inside one are logged and the next
//! tick runs normally.

use crate::analyzer::{AnalyzerError, FaceAnalyzer, ModelLoader};
use crate::capture::{CaptureBridge, CaptureError, PointerEvent};
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::pipeline::{FrameOutcome, Tracker};
use crate::source::{CameraProvider, FrameSource, SourceError};
use crate::store::ObjectStore;
use crate::types::{Detection, PendingCapture};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const TIMING_LOG_EVERY: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverState {
    Uninitialized,
    AwaitingCapability,
    AwaitingCameraStream,
    Ready,
    Running,
    ErrorRecovering,
    Stopped,
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("model load failed: {0}")]
    ModelLoad(#[from] AnalyzerError),
    #[error("camera unavailable: {0}")]
    Camera(#[from] SourceError),
    #[error("operation not valid in state {0:?}")]
    InvalidState(DriverState),
    #[error("stopped during initialization")]
    Stopped,
}

/// Shared stop flag. Cloned out of the driver so a stop can be requested while
/// `initialize` is suspended.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Called with the raw (frame-sized) detection on every tick that found a face.
pub type DetectionListener = Box<dyn FnMut(&Detection)>;

#[derive(Debug, Default)]
struct TickTiming {
    ticks: u64,
    busy: Duration,
    failures: u64,
}

pub struct StreamDriver<A, F, S, M = EuclideanMatcher> {
    state: DriverState,
    stop: StopHandle,
    analyzer: Option<A>,
    source: Option<F>,
    frame_size: (u32, u32),
    tracker: Tracker<S, M>,
    bridge: CaptureBridge,
    listener: Option<DetectionListener>,
    timing: TickTiming,
}

impl<A, F, S, M> StreamDriver<A, F, S, M>
where
    A: FaceAnalyzer,
    F: FrameSource,
    S: ObjectStore,
    M: Matcher,
{
    pub fn new(tracker: Tracker<S, M>, bridge: CaptureBridge) -> Self {
        Self {
            state: DriverState::Uninitialized,
            stop: StopHandle::default(),
            analyzer: None,
            source: None,
            frame_size: (0, 0),
            tracker,
            bridge,
            listener: None,
            timing: TickTiming::default(),
        }
    }

    /// Wait for the model capability, load every model, open the camera and
    /// wait for its first frame.
    ///
    /// Model and camera failures are fatal: the driver stays in the state
    /// where it failed. A stop requested through [`StopHandle`] while this is
    /// suspended releases anything acquired and ends in `Stopped`.
    pub async fn initialize<L, C, Cap>(&mut self, capability: Cap, camera: &C) -> Result<(u32, u32), DriverError>
    where
        Cap: Future<Output = L>,
        L: ModelLoader<Analyzer = A>,
        C: CameraProvider<Source = F>,
    {
        if self.state != DriverState::Uninitialized {
            return Err(DriverError::InvalidState(self.state));
        }

        self.state = DriverState::AwaitingCapability;
        let loader = capability.await;
        self.bail_if_stopped()?;

        let started = Instant::now();
        let analyzer = loader.load().map_err(|e| {
            tracing::error!(error = %e, "model load failed");
            DriverError::ModelLoad(e)
        })?;
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            embedding_dim = analyzer.embedding_dim(),
            "models ready"
        );
        self.analyzer = Some(analyzer);
        self.bail_if_stopped()?;

        self.state = DriverState::AwaitingCameraStream;
        let mut source = camera.open().map_err(|e| {
            tracing::error!(error = %e, "camera open failed");
            DriverError::Camera(e)
        })?;
        let ready = source.ready().await;
        if self.stop.is_stopped() {
            source.stop();
            return Err(self.halt());
        }
        let (width, height) = match ready {
            Ok(size) => size,
            Err(e) => {
                source.stop();
                tracing::error!(error = %e, "camera stream never delivered a frame");
                return Err(DriverError::Camera(e));
            }
        };

        self.source = Some(source);
        self.frame_size = (width, height);
        self.state = DriverState::Ready;
        tracing::info!(width, height, "stream ready");
        Ok((width, height))
    }

    pub fn start(&mut self) -> Result<(), DriverError> {
        if self.state != DriverState::Ready {
            return Err(DriverError::InvalidState(self.state));
        }
        self.state = DriverState::Running;
        Ok(())
    }

    /// One detection cycle. Returns `None` when the driver is not running or
    /// the tick failed.
    pub async fn tick(&mut self) -> Option<FrameOutcome> {
        if self.stop.is_stopped() {
            self.state = DriverState::Stopped;
            return None;
        }
        if !matches!(self.state, DriverState::Running | DriverState::ErrorRecovering) {
            return None;
        }
        let (Some(source), Some(analyzer)) = (self.source.as_mut(), self.analyzer.as_mut()) else {
            return None;
        };

        let started = Instant::now();
        let frame = match source.current_frame() {
            Ok(frame) => frame,
            Err(SourceError::NoFrame) => {
                tracing::debug!("no frame yet; skipping tick");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame fetch failed; skipping tick");
                self.tracker.clear_detection();
                self.record_failure();
                return None;
            }
        };
        let detection = match analyzer.detect_one(&frame) {
            Ok(detection) => detection,
            Err(e) => {
                tracing::warn!(error = %e, sequence = frame.sequence, "detector failed; skipping tick");
                self.tracker.clear_detection();
                self.record_failure();
                return None;
            }
        };

        let outcome = self
            .tracker
            .process_frame(frame.width, frame.height, detection)
            .await;
        if let (Some(listener), Some(face)) = (self.listener.as_mut(), self.tracker.last_face()) {
            listener(&face.detection);
        }

        self.state = DriverState::Running;
        self.record_tick(started.elapsed());
        Some(outcome)
    }

    /// Claim the last face for enrollment if it is unknown and under the pointer.
    pub fn claim(&mut self, pointer: &PointerEvent) -> Result<Option<PendingCapture>, CaptureError> {
        let source = &mut self.source;
        self.bridge
            .claim(pointer, self.frame_size.0, self.tracker.last_face(), || {
                source.as_mut().ok_or(SourceError::Closed)?.current_frame()
            })
    }

    /// Stop ticking, then release the camera. Safe to call at any point and
    /// more than once.
    pub fn teardown(&mut self) {
        self.stop.stop();
        let was = std::mem::replace(&mut self.state, DriverState::Stopped);
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
        if was != DriverState::Stopped {
            tracing::info!(from = ?was, ticks = self.timing.ticks, "stream stopped");
        }
    }

    pub fn set_listener(&mut self, listener: DetectionListener) {
        self.listener = Some(listener);
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    pub fn tracker(&self) -> &Tracker<S, M> {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut Tracker<S, M> {
        &mut self.tracker
    }

    /// The loaded analyzer, once initialization got past model loading.
    pub fn analyzer_mut(&mut self) -> Option<&mut A> {
        self.analyzer.as_mut()
    }

    fn bail_if_stopped(&mut self) -> Result<(), DriverError> {
        if self.stop.is_stopped() {
            return Err(self.halt());
        }
        Ok(())
    }

    fn halt(&mut self) -> DriverError {
        tracing::info!(during = ?self.state, "stop requested during initialization");
        self.teardown();
        DriverError::Stopped
    }

    fn record_failure(&mut self) {
        self.state = DriverState::ErrorRecovering;
        self.timing.failures += 1;
    }

    fn record_tick(&mut self, elapsed: Duration) {
        let t = &mut self.timing;
        t.ticks += 1;
        t.busy += elapsed;
        if t.ticks % TIMING_LOG_EVERY == 0 {
            tracing::info!(
                ticks = t.ticks,
                failures = t.failures,
                avg_ms = t.busy.as_secs_f64() * 1000.0 / TIMING_LOG_EVERY as f64,
                gallery = self.tracker.gallery_size(),
                "tick timing"
            );
            t.busy = Duration::ZERO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PointerEvent;
    use crate::clock::ManualClock;
    use crate::frame::Frame;
    use crate::settings::TrackerSettings;
    use crate::store::{MemoryStore, FACE_KIND};
    use crate::types::{BoundingBox, Embedding, Expressions, UNKNOWN_LABEL};
    use serde_json::json;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    const DIM: usize = 4;
    const ALICE: [f32; DIM] = [0.5, 0.5, 0.5, 0.5];

    #[derive(Clone)]
    enum Step {
        Face(Vec<f32>),
        Empty,
        Fail,
    }

    struct ScriptedAnalyzer(VecDeque<Step>);

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn detect_one(&mut self, frame: &Frame) -> Result<Option<Detection>, AnalyzerError> {
            match self.0.pop_front().unwrap_or(Step::Empty) {
                Step::Empty => Ok(None),
                Step::Fail => Err(AnalyzerError::Other("scripted failure".into())),
                Step::Face(values) => Ok(Some(Detection {
                    bbox: BoundingBox::new(100.0, 80.0, 120.0, 140.0),
                    score: 0.97,
                    landmarks: None,
                    embedding: Embedding::new(values),
                    age: Some(30.2),
                    gender: Some("female".into()),
                    expressions: Expressions::new(vec![("happy".into(), 0.8), ("neutral".into(), 0.2)]),
                    source_size: (frame.width, frame.height),
                })),
            }
        }

        fn embedding_dim(&self) -> usize {
            DIM
        }
    }

    struct ScriptedLoader {
        steps: Vec<Step>,
        fail: bool,
    }

    impl ModelLoader for ScriptedLoader {
        type Analyzer = ScriptedAnalyzer;

        fn load(&self) -> Result<ScriptedAnalyzer, AnalyzerError> {
            if self.fail {
                return Err(AnalyzerError::Other("weights missing".into()));
            }
            Ok(ScriptedAnalyzer(self.steps.iter().cloned().collect()))
        }
    }

    struct FakeSource {
        stopped: Rc<Cell<u32>>,
        sequence: u32,
    }

    impl FrameSource for FakeSource {
        async fn ready(&mut self) -> Result<(u32, u32), SourceError> {
            Ok((640, 480))
        }

        fn current_frame(&mut self) -> Result<Frame, SourceError> {
            self.sequence += 1;
            Frame::new(vec![40u8; 640 * 480], 640, 480, self.sequence).map_err(|e| SourceError::Failed(e.to_string()))
        }

        fn stop(&mut self) {
            self.stopped.set(self.stopped.get() + 1);
        }
    }

    #[derive(Default)]
    struct FakeCamera {
        stopped: Rc<Cell<u32>>,
        opened: Cell<u32>,
        deny: bool,
    }

    impl CameraProvider for FakeCamera {
        type Source = FakeSource;

        fn open(&self) -> Result<FakeSource, SourceError> {
            if self.deny {
                return Err(SourceError::PermissionDenied("/dev/video0".into()));
            }
            self.opened.set(self.opened.get() + 1);
            Ok(FakeSource {
                stopped: self.stopped.clone(),
                sequence: 0,
            })
        }
    }

    type TestDriver = StreamDriver<ScriptedAnalyzer, FakeSource, Arc<MemoryStore>>;

    async fn new_driver(records: Vec<serde_json::Value>) -> (TestDriver, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        for record in records {
            store.create(FACE_KIND, record).await.unwrap();
        }
        let mut settings = TrackerSettings::default();
        settings.gallery.embedding_dim = DIM;
        let clock = Arc::new(ManualClock::new());
        let tracker = Tracker::new(store, &settings, clock.clone());
        (StreamDriver::new(tracker, settings.capture_bridge()), clock)
    }

    async fn running(steps: Vec<Step>, records: Vec<serde_json::Value>) -> (TestDriver, Arc<ManualClock>, FakeCamera) {
        let (mut driver, clock) = new_driver(records).await;
        let camera = FakeCamera::default();
        let loader = ScriptedLoader { steps, fail: false };
        let size = driver.initialize(std::future::ready(loader), &camera).await.unwrap();
        assert_eq!(size, (640, 480));
        driver.start().unwrap();
        (driver, clock, camera)
    }

    #[tokio::test]
    async fn test_known_face_matches_end_to_end() {
        let query: Vec<f32> = ALICE.iter().map(|v| v + 0.02).collect();
        let (mut driver, _, _) = running(
            vec![Step::Face(query)],
            vec![json!({ "name": "alice", "descriptor": ALICE })],
        )
        .await;

        let outcome = driver.tick().await.unwrap();
        let recognition = outcome.recognition.unwrap();
        assert_eq!(recognition.label, "alice");
        assert!(recognition.confidence > 0.9, "confidence {}", recognition.confidence);
        assert_eq!(recognition.age, Some(30));
        assert_eq!(recognition.expression.as_deref(), Some("happy"));
        assert_eq!(driver.state(), DriverState::Running);
    }

    #[tokio::test]
    async fn test_empty_gallery_is_unknown() {
        let (mut driver, _, _) = running(vec![Step::Face(ALICE.to_vec())], vec![]).await;
        let recognition = driver.tick().await.unwrap().recognition.unwrap();
        assert_eq!(recognition.label, UNKNOWN_LABEL);
        assert_eq!(recognition.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_detector_error_is_swallowed() {
        let (mut driver, clock, _) = running(
            vec![Step::Face(ALICE.to_vec()), Step::Fail, Step::Face(ALICE.to_vec())],
            vec![],
        )
        .await;

        assert!(driver.tick().await.is_some());
        clock.advance(Duration::from_millis(40));
        assert!(driver.tick().await.is_none());
        assert_eq!(driver.state(), DriverState::ErrorRecovering);

        clock.advance(Duration::from_millis(40));
        let outcome = driver.tick().await.expect("tick after a failure runs normally");
        assert!(outcome.recognition.is_some());
        assert_eq!(driver.state(), DriverState::Running);
    }

    #[tokio::test]
    async fn test_failed_tick_forgets_previous_face() {
        let (mut driver, clock, _) = running(vec![Step::Face(ALICE.to_vec()), Step::Fail], vec![]).await;

        driver.tick().await;
        assert!(driver.tracker().recognition().is_some());

        clock.advance(Duration::from_millis(40));
        assert!(driver.tick().await.is_none());
        assert!(driver.tracker().recognition().is_none());
        assert!(driver.tracker().last_face().is_none());

        // Inside where the face was on the previous tick.
        let pointer = PointerEvent {
            x: 60.0,
            y: 60.0,
            display_width: 320.0,
        };
        assert!(driver.claim(&pointer).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listener_sees_frame_sized_detection() {
        let (mut driver, _, _) = running(vec![Step::Face(ALICE.to_vec()), Step::Empty], vec![]).await;
        let seen = Rc::new(Cell::new(0u32));
        let counter = seen.clone();
        driver.set_listener(Box::new(move |d: &Detection| {
            assert_eq!(d.source_size, (640, 480));
            counter.set(counter.get() + 1);
        }));

        driver.tick().await;
        driver.tick().await;
        assert_eq!(seen.get(), 1);
    }

    #[tokio::test]
    async fn test_claim_inside_and_outside() {
        let (mut driver, _, _) = running(vec![Step::Face(ALICE.to_vec())], vec![]).await;
        driver.tick().await;

        // Display at half size: box (100, 80, 120, 140) spans 50..110 x 40..110.
        let outside = PointerEvent {
            x: 20.0,
            y: 20.0,
            display_width: 320.0,
        };
        assert!(driver.claim(&outside).unwrap().is_none());

        let inside = PointerEvent {
            x: 60.0,
            y: 60.0,
            display_width: 320.0,
        };
        let capture = driver.claim(&inside).unwrap().expect("hit");
        assert_eq!(capture.embedding, Embedding::new(ALICE.to_vec()));
        assert_eq!(capture.age, Some(30));
        assert_eq!(capture.expression.as_deref(), Some("happy"));
    }

    #[tokio::test]
    async fn test_model_load_failure_halts() {
        let (mut driver, _) = new_driver(vec![]).await;
        let camera = FakeCamera::default();
        let loader = ScriptedLoader {
            steps: vec![],
            fail: true,
        };
        let result = driver.initialize(std::future::ready(loader), &camera).await;
        assert!(matches!(result, Err(DriverError::ModelLoad(_))));
        assert_eq!(driver.state(), DriverState::AwaitingCapability);
        assert_eq!(camera.opened.get(), 0);
        assert!(driver.start().is_err());
    }

    #[tokio::test]
    async fn test_camera_denied_is_fatal() {
        let (mut driver, _) = new_driver(vec![]).await;
        let camera = FakeCamera {
            deny: true,
            ..Default::default()
        };
        let loader = ScriptedLoader {
            steps: vec![],
            fail: false,
        };
        let result = driver.initialize(std::future::ready(loader), &camera).await;
        assert!(matches!(
            result,
            Err(DriverError::Camera(SourceError::PermissionDenied(_)))
        ));
        assert_eq!(driver.state(), DriverState::AwaitingCameraStream);
    }

    #[tokio::test]
    async fn test_stop_while_awaiting_capability() {
        let (mut driver, _) = new_driver(vec![]).await;
        let camera = FakeCamera::default();
        let handle = driver.stop_handle();
        let capability = async move {
            handle.stop();
            ScriptedLoader {
                steps: vec![],
                fail: false,
            }
        };

        let result = driver.initialize(capability, &camera).await;
        assert!(matches!(result, Err(DriverError::Stopped)));
        assert_eq!(driver.state(), DriverState::Stopped);
        assert_eq!(camera.opened.get(), 0);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (mut driver, _, camera) = running(vec![Step::Face(ALICE.to_vec())], vec![]).await;
        driver.teardown();
        driver.teardown();
        assert_eq!(driver.state(), DriverState::Stopped);
        assert_eq!(camera.stopped.get(), 1);
        assert!(driver.tick().await.is_none());

        let (mut fresh, _) = new_driver(vec![]).await;
        fresh.teardown();
        assert_eq!(fresh.state(), DriverState::Stopped);
    }
}
