//! Enrollment side of the pipeline: turning claimed or uploaded faces into
//! stored records, and listing or removing them again.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::frame::{Frame, FrameError};
use crate::store::{ObjectStore, StoreError, FACE_KIND};
use crate::types::{Embedding, PendingCapture};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest image accepted for enrollment.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
/// Oldest age accepted on the enrollment form.
pub const MAX_AGE: u32 = 120;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("age {0} is outside 0..=120")]
    InvalidAge(u32),
    #[error("image is {0} bytes; the limit is 5 MiB")]
    ImageTooLarge(usize),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("image: {0}")]
    Image(#[from] FrameError),
    #[error("analyzer: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Fields the user fills in when enrolling a face.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrollForm {
    pub name: String,
    pub age: Option<u32>,
    pub gender: Option<String>,
}

impl EnrollForm {
    fn validate(&self) -> Result<String, EnrollError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(EnrollError::EmptyName);
        }
        if let Some(age) = self.age.filter(|a| *a > MAX_AGE) {
            return Err(EnrollError::InvalidAge(age));
        }
        Ok(name.to_string())
    }
}

/// Persisted shape of an enrolled face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceRecord {
    pub name: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<String>,
    /// Snapshot as a `data:` URL.
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub descriptor: Option<Vec<f32>>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl FaceRecord {
    pub fn embedding(&self) -> Option<Embedding> {
        self.descriptor.clone().map(Embedding::new)
    }
}

/// A stored face together with its store id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrolledFace {
    pub id: String,
    #[serde(flatten)]
    pub record: FaceRecord,
}

/// Encode raw image bytes as a `data:` URL, sniffing the MIME type.
pub fn image_data_url(bytes: &[u8]) -> String {
    let mime = image::guess_format(bytes)
        .map(|f| f.to_mime_type())
        .unwrap_or("application/octet-stream");
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

pub struct FaceRegistry<S> {
    store: S,
}

impl<S: ObjectStore> FaceRegistry<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enroll a claimed face, reusing its already computed embedding.
    ///
    /// Form age/gender take precedence; the captured estimates fill gaps.
    pub async fn enroll_capture(
        &self,
        capture: &PendingCapture,
        form: &EnrollForm,
    ) -> Result<String, EnrollError> {
        let name = form.validate()?;
        let record = FaceRecord {
            name,
            age: form.age.or(capture.age),
            gender: form.gender.clone().or_else(|| capture.gender.clone()),
            image_url: Some(image_data_url(&capture.image)),
            descriptor: Some(capture.embedding.values.clone()),
            created_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        self.create(record).await
    }

    /// Enroll from an uploaded still image, running the analyzer on it.
    pub async fn enroll_image<A: FaceAnalyzer>(
        &self,
        analyzer: &mut A,
        image: &[u8],
        form: &EnrollForm,
    ) -> Result<String, EnrollError> {
        let name = form.validate()?;
        if image.len() > MAX_IMAGE_BYTES {
            return Err(EnrollError::ImageTooLarge(image.len()));
        }

        let frame = Frame::from_image_bytes(image)?;
        let detection = analyzer
            .detect_one(&frame)?
            .ok_or(EnrollError::NoFaceDetected)?;

        let record = FaceRecord {
            name,
            age: form.age.or_else(|| detection.rounded_age()),
            gender: form.gender.clone().or_else(|| detection.gender.clone()),
            image_url: Some(image_data_url(image)),
            descriptor: Some(detection.embedding.values),
            created_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        self.create(record).await
    }

    /// Newest-first listing. Records that do not parse are skipped.
    pub async fn list(&self, limit: usize) -> Result<Vec<EnrolledFace>, EnrollError> {
        let objects = self.store.list(FACE_KIND, limit, true).await?;
        let faces = objects
            .into_iter()
            .filter_map(|obj| match serde_json::from_value::<FaceRecord>(obj.record) {
                Ok(record) => Some(EnrolledFace { id: obj.id, record }),
                Err(e) => {
                    tracing::debug!(id = %obj.id, error = %e, "skipping unreadable face record");
                    None
                }
            })
            .collect();
        Ok(faces)
    }

    pub async fn remove(&self, id: &str) -> Result<(), EnrollError> {
        self.store.delete(FACE_KIND, id).await?;
        tracing::info!(id, "face removed");
        Ok(())
    }

    async fn create(&self, record: FaceRecord) -> Result<String, EnrollError> {
        let name = record.name.clone();
        let value = serde_json::to_value(&record).map_err(StoreError::from)?;
        let id = self.store.create(FACE_KIND, value).await?;
        tracing::info!(id = %id, name = %name, "face enrolled");
        Ok(id)
    }
}
