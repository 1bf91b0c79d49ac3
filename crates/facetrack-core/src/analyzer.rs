//! Face model runtime seam.
//!
//! `FaceAnalyzer` is what the driver and the registry call; `ModelLoader`
//! produces one, loading every model it needs up front. The ONNX
//! implementation chains detection, alignment, embedding and attribute
//! estimation for the highest-scoring face.

use crate::attributes::{AttributeError, ExpressionClassifier, GenderAgeEstimator};
use crate::detector::{DetectorError, FaceDetector};
use crate::frame::Frame;
use crate::recognizer::{EmbeddingProfile, FaceRecognizer, RecognizerError};
use crate::types::Detection;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("attributes: {0}")]
    Attributes(#[from] AttributeError),
    /// Failure reported by an analyzer outside the ONNX stack.
    #[error("{0}")]
    Other(String),
}

/// Runs the face models over one frame.
pub trait FaceAnalyzer {
    /// The single most confident face in the frame with its embedding and
    /// attributes, or `None` when there is no face.
    fn detect_one(&mut self, frame: &Frame) -> Result<Option<Detection>, AnalyzerError>;

    /// Length of the embeddings this analyzer produces.
    fn embedding_dim(&self) -> usize;
}

impl<A: FaceAnalyzer + ?Sized> FaceAnalyzer for Box<A> {
    fn detect_one(&mut self, frame: &Frame) -> Result<Option<Detection>, AnalyzerError> {
        (**self).detect_one(frame)
    }

    fn embedding_dim(&self) -> usize {
        (**self).embedding_dim()
    }
}

/// Produces a ready analyzer. Loading is all-or-nothing.
pub trait ModelLoader {
    type Analyzer: FaceAnalyzer;

    fn load(&self) -> Result<Self::Analyzer, AnalyzerError>;
}

/// Locations of the four ONNX models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    pub gender_age: PathBuf,
    pub expression: PathBuf,
}

impl ModelPaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path, profile: EmbeddingProfile) -> Self {
        Self {
            detector: dir.join("det_10g.onnx"),
            recognizer: dir.join(profile.model_file()),
            gender_age: dir.join("genderage.onnx"),
            expression: dir.join("emotion-ferplus-8.onnx"),
        }
    }

    pub fn missing(&self) -> Vec<&Path> {
        [&self.detector, &self.recognizer, &self.gender_age, &self.expression]
            .into_iter()
            .map(PathBuf::as_path)
            .filter(|p| !p.exists())
            .collect()
    }
}

/// Loader for the ONNX model set.
#[derive(Debug, Clone)]
pub struct OnnxModels {
    pub paths: ModelPaths,
    pub profile: EmbeddingProfile,
}

impl OnnxModels {
    pub fn new(paths: ModelPaths, profile: EmbeddingProfile) -> Self {
        Self { paths, profile }
    }
}

impl ModelLoader for OnnxModels {
    type Analyzer = OnnxAnalyzer;

    fn load(&self) -> Result<OnnxAnalyzer, AnalyzerError> {
        let detector = FaceDetector::load(&self.paths.detector)?;
        let recognizer = FaceRecognizer::load(&self.paths.recognizer, self.profile)?;
        let gender_age = GenderAgeEstimator::load(&self.paths.gender_age)?;
        let expression = ExpressionClassifier::load(&self.paths.expression)?;
        tracing::info!(profile = ?self.profile, dim = self.profile.dim(), "face models loaded");
        Ok(OnnxAnalyzer {
            detector,
            recognizer,
            gender_age,
            expression,
        })
    }
}

pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    gender_age: GenderAgeEstimator,
    expression: ExpressionClassifier,
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect_one(&mut self, frame: &Frame) -> Result<Option<Detection>, AnalyzerError> {
        let Some(face) = self.detector.detect(frame)?.into_iter().next() else {
            return Ok(None);
        };

        let embedding = self.recognizer.extract(frame, face.landmarks.as_ref())?;
        let (age, gender) = self.gender_age.estimate(frame, &face.bbox)?;
        let expressions = self.expression.classify(frame, &face.bbox)?;

        Ok(Some(Detection {
            bbox: face.bbox,
            score: face.score,
            landmarks: face.landmarks,
            embedding,
            age: Some(age),
            gender: Some(gender),
            expressions,
            source_size: (frame.width, frame.height),
        }))
    }

    fn embedding_dim(&self) -> usize {
        self.recognizer.profile().dim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_paths_follow_profile() {
        let paths = ModelPaths::in_dir(Path::new("/opt/models"), EmbeddingProfile::Arcface);
        assert_eq!(paths.recognizer, Path::new("/opt/models/w600k_r50.onnx"));
        assert_eq!(paths.detector, Path::new("/opt/models/det_10g.onnx"));
    }

    #[test]
    fn test_load_fails_on_missing_models() {
        let paths = ModelPaths::in_dir(Path::new("/nonexistent/facetrack"), EmbeddingProfile::Sface);
        assert_eq!(paths.missing().len(), 4);
        let result = OnnxModels::new(paths, EmbeddingProfile::Sface).load();
        assert!(matches!(
            result,
            Err(AnalyzerError::Detector(DetectorError::ModelNotFound(_)))
        ));
    }
}
