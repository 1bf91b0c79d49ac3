use crate::config::Config;
use facetrack_core::{
    CaptureError, Detection, DriverError, DriverState, EmbeddingProfile, EnrollError, EnrollForm,
    EnrolledFace, FaceRegistry, FrameOutcome, OnnxAnalyzer, OnnxModels, OverlayInstructions,
    PendingCapture, PointerEvent, RecognitionResult, StoreError, StreamDriver, SystemClock,
    Tracker,
};
use facetrack_hw::{CameraStream, V4l2Camera};
use facetrack_store::{SqliteStore, SqliteStoreError};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

type Store = Arc<SqliteStore>;
type Driver = StreamDriver<OnnxAnalyzer, CameraStream, Store>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face store: {0}")]
    Store(#[from] SqliteStoreError),
    #[error("{0}")]
    Driver(#[from] DriverError),
    #[error("{0}")]
    Enroll(#[from] EnrollError),
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("no claimed face to enroll; claim an unknown face first")]
    NoPendingCapture,
    #[error("models are not loaded")]
    ModelsNotLoaded,
    #[error("engine runtime: {0}")]
    Runtime(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of the engine for `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: DriverState,
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    pub embedding_profile: EmbeddingProfile,
    pub gallery_size: usize,
    pub pending_capture: bool,
}

/// What a successful claim captured, minus the image itself.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimSummary {
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub expression: Option<String>,
    pub image_bytes: usize,
}

impl From<&PendingCapture> for ClaimSummary {
    fn from(capture: &PendingCapture) -> Self {
        Self {
            age: capture.age,
            gender: capture.gender.clone(),
            expression: capture.expression.clone(),
            image_bytes: capture.image.len(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Recognition {
        reply: oneshot::Sender<Option<RecognitionResult>>,
    },
    Overlay {
        reply: oneshot::Sender<Option<OverlayInstructions>>,
    },
    Claim {
        pointer: PointerEvent,
        reply: Reply<Option<ClaimSummary>>,
    },
    Enroll {
        form: EnrollForm,
        reply: Reply<String>,
    },
    EnrollImage {
        form: EnrollForm,
        image: Vec<u8>,
        reply: Reply<String>,
    },
    ListFaces {
        reply: Reply<Vec<EnrolledFace>>,
    },
    RemoveFace {
        id: String,
        reply: Reply<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    pub async fn recognition(&self) -> Result<Option<RecognitionResult>, EngineError> {
        self.request(|reply| EngineRequest::Recognition { reply }).await
    }

    pub async fn overlay(&self) -> Result<Option<OverlayInstructions>, EngineError> {
        self.request(|reply| EngineRequest::Overlay { reply }).await
    }

    /// Claim the current face if it is unknown and under the pointer.
    pub async fn claim(&self, pointer: PointerEvent) -> Result<Option<ClaimSummary>, EngineError> {
        self.request(|reply| EngineRequest::Claim { pointer, reply })
            .await?
    }

    /// Enroll the most recent claim.
    pub async fn enroll(&self, form: EnrollForm) -> Result<String, EngineError> {
        self.request(|reply| EngineRequest::Enroll { form, reply }).await?
    }

    pub async fn enroll_image(&self, form: EnrollForm, image: Vec<u8>) -> Result<String, EngineError> {
        self.request(|reply| EngineRequest::EnrollImage { form, image, reply })
            .await?
    }

    pub async fn list_faces(&self) -> Result<Vec<EnrolledFace>, EngineError> {
        self.request(|reply| EngineRequest::ListFaces { reply }).await?
    }

    /// Returns false when no face has that id.
    pub async fn remove_face(&self, id: String) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::RemoveFace { id, reply })
            .await?
    }

    /// Stop ticking and release the camera. Waits until the engine is down.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Shutdown { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the store, loads every model, opens the camera and waits for its
/// first frame before returning. Any failure there is fatal and comes back
/// here; after that the engine ticks at the configured frame rate and serves
/// requests between ticks.
pub async fn spawn_engine(config: Config) -> Result<EngineHandle, EngineError> {
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let (init_tx, init_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("facetrack-engine".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = init_tx.send(Err(EngineError::Runtime(e)));
                    return;
                }
            };
            runtime.block_on(run(config, rx, init_tx));
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Runtime)?;

    init_rx.await.map_err(|_| EngineError::ChannelClosed)??;
    Ok(EngineHandle { tx })
}

async fn run(
    config: Config,
    mut rx: mpsc::Receiver<EngineRequest>,
    init_tx: oneshot::Sender<Result<(), EngineError>>,
) {
    let mut engine = match Engine::start(&config).await {
        Ok(engine) => engine,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    let _ = init_tx.send(Ok(()));

    let mut ticker = tokio::time::interval(config.tick_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(fps = config.frame_rate, "engine running");

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                if engine.handle(request).await.is_break() {
                    break;
                }
            }
            _ = ticker.tick() => engine.tick().await,
        }
    }
    engine.driver.teardown();
}

struct Engine {
    driver: Driver,
    registry: FaceRegistry<Store>,
    pending: Option<PendingCapture>,
    latest: FrameOutcome,
    camera_device: String,
    profile: EmbeddingProfile,
    list_limit: usize,
}

impl Engine {
    async fn start(config: &Config) -> Result<Self, EngineError> {
        let store = Arc::new(SqliteStore::open(&config.db_path).await?);
        let tracker = Tracker::new(store.clone(), &config.tracker, Arc::new(SystemClock));
        let mut driver: Driver = StreamDriver::new(tracker, config.tracker.capture_bridge());
        driver.set_listener(Box::new(|detection: &Detection| {
            tracing::trace!(
                x = detection.bbox.x,
                y = detection.bbox.y,
                score = detection.score,
                "raw detection"
            );
        }));

        let paths = config.model_paths();
        for missing in paths.missing() {
            tracing::error!(path = %missing.display(), "model file missing");
        }
        let loader = OnnxModels::new(paths, config.embedding_profile);
        let camera = V4l2Camera {
            device: config.camera_device.clone(),
            width: config.width,
            height: config.height,
            frame_rate: config.frame_rate,
        };

        let (width, height) = driver
            .initialize(std::future::ready(loader), &camera)
            .await?;
        driver.start()?;
        tracing::info!(
            device = %config.camera_device,
            width,
            height,
            profile = ?config.embedding_profile,
            "engine initialized"
        );

        Ok(Self {
            driver,
            registry: FaceRegistry::new(store),
            pending: None,
            latest: FrameOutcome::default(),
            camera_device: config.camera_device.clone(),
            profile: config.embedding_profile,
            list_limit: config.list_limit,
        })
    }

    async fn tick(&mut self) {
        match self.driver.tick().await {
            Some(outcome) => self.latest = outcome,
            // A failed tick leaves no face to draw.
            None if self.driver.state() == DriverState::ErrorRecovering => {
                self.latest = FrameOutcome::default();
            }
            None => {}
        }
    }

    async fn handle(&mut self, request: EngineRequest) -> ControlFlow<()> {
        match request {
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineRequest::Recognition { reply } => {
                let _ = reply.send(self.driver.tracker().recognition().cloned());
            }
            EngineRequest::Overlay { reply } => {
                let _ = reply.send(self.latest.overlay.clone());
            }
            EngineRequest::Claim { pointer, reply } => {
                let _ = reply.send(self.claim(&pointer));
            }
            EngineRequest::Enroll { form, reply } => {
                let _ = reply.send(self.enroll(&form).await);
            }
            EngineRequest::EnrollImage { form, image, reply } => {
                let _ = reply.send(self.enroll_image(&form, &image).await);
            }
            EngineRequest::ListFaces { reply } => {
                let result = self.registry.list(self.list_limit).await.map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::RemoveFace { id, reply } => {
                let _ = reply.send(self.remove(&id).await);
            }
            EngineRequest::Shutdown { reply } => {
                self.driver.teardown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn status(&self) -> EngineStatus {
        let (frame_width, frame_height) = self.driver.frame_size();
        EngineStatus {
            state: self.driver.state(),
            camera_device: self.camera_device.clone(),
            frame_width,
            frame_height,
            embedding_profile: self.profile,
            gallery_size: self.driver.tracker().gallery_size(),
            pending_capture: self.pending.is_some(),
        }
    }

    fn claim(&mut self, pointer: &PointerEvent) -> Result<Option<ClaimSummary>, EngineError> {
        let Some(capture) = self.driver.claim(pointer)? else {
            return Ok(None);
        };
        let summary = ClaimSummary::from(&capture);
        tracing::info!(bytes = summary.image_bytes, "unknown face claimed");
        self.pending = Some(capture);
        Ok(Some(summary))
    }

    async fn enroll(&mut self, form: &EnrollForm) -> Result<String, EngineError> {
        let capture = self.pending.as_ref().ok_or(EngineError::NoPendingCapture)?;
        let id = self.registry.enroll_capture(capture, form).await?;
        self.pending = None;
        self.driver.tracker_mut().invalidate_gallery();
        Ok(id)
    }

    async fn enroll_image(&mut self, form: &EnrollForm, image: &[u8]) -> Result<String, EngineError> {
        let analyzer = self.driver.analyzer_mut().ok_or(EngineError::ModelsNotLoaded)?;
        let id = self.registry.enroll_image(analyzer, image, form).await?;
        self.driver.tracker_mut().invalidate_gallery();
        Ok(id)
    }

    async fn remove(&mut self, id: &str) -> Result<bool, EngineError> {
        match self.registry.remove(id).await {
            Ok(()) => {
                self.driver.tracker_mut().invalidate_gallery();
                Ok(true)
            }
            Err(EnrollError::Store(StoreError::NotFound { .. })) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
