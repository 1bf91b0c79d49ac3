//! facetrack-core: single-face tracking and recognition.
//!
//! A [`StreamDriver`] pulls frames from a [`FrameSource`], runs a
//! [`FaceAnalyzer`] on each, smooths the face box, matches the embedding
//! against a periodically refreshed gallery, and lays out the overlay.
//! Clicking an unknown face yields a [`PendingCapture`] that a
//! [`FaceRegistry`] turns into an enrolled record.

pub mod alignment;
pub mod analyzer;
pub mod attributes;
pub mod capture;
pub mod clock;
pub mod detector;
pub mod driver;
pub mod frame;
pub mod gallery;
pub mod matcher;
pub mod overlay;
pub mod pipeline;
pub mod recognizer;
pub mod registry;
pub mod settings;
pub mod smoother;
pub mod source;
pub mod store;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, ModelLoader, ModelPaths, OnnxAnalyzer, OnnxModels};
pub use capture::{CaptureBridge, CaptureError, PointerEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use driver::{DriverError, DriverState, StopHandle, StreamDriver};
pub use frame::{Frame, FrameError};
pub use gallery::{GalleryCache, GallerySettings, GallerySnapshot};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use overlay::{OverlayInstructions, TextMeasure};
pub use pipeline::{FrameOutcome, TrackedFace, Tracker};
pub use recognizer::EmbeddingProfile;
pub use registry::{EnrollError, EnrollForm, EnrolledFace, FaceRecord, FaceRegistry};
pub use settings::TrackerSettings;
pub use smoother::{BoxSmoother, SmootherSettings};
pub use source::{CameraProvider, FrameSource, SourceError};
pub use store::{MemoryStore, ObjectStore, StoreError, StoredObject, FACE_KIND};
pub use types::{
    BoundingBox, Detection, Embedding, EnrolledIdentity, Expressions, PendingCapture,
    RecognitionResult, UNKNOWN_LABEL,
};
