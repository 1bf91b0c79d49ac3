//! Face embedding extraction via ONNX Runtime.
//!
//! Faces are aligned to the canonical 112x112 landmark layout, normalized per
//! the model profile, embedded and L2-normalized.

use crate::alignment;
use crate::frame::Frame;
use crate::types::Embedding;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const INPUT_SIZE: usize = 112;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognizer model not found: {0}")]
    ModelNotFound(String),
    #[error("embedding has {actual} values, expected {expected}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("recognizer output: {0}")]
    BadOutput(String),
    #[error("face has no landmarks; alignment needs all five")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Which embedding network is in use. The gallery dimension follows from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProfile {
    /// OpenCV SFace, 128-d.
    #[default]
    Sface,
    /// InsightFace ArcFace w600k_r50, 512-d.
    Arcface,
}

impl EmbeddingProfile {
    pub fn dim(self) -> usize {
        match self {
            Self::Sface => 128,
            Self::Arcface => 512,
        }
    }

    pub fn model_file(self) -> &'static str {
        match self {
            Self::Sface => "face_recognition_sface_2021dec.onnx",
            Self::Arcface => "w600k_r50.onnx",
        }
    }

    /// (mean, std) applied to raw pixel values.
    fn normalization(self) -> (f32, f32) {
        match self {
            Self::Sface => (0.0, 1.0),
            Self::Arcface => (127.5, 127.5),
        }
    }
}

impl FromStr for EmbeddingProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sface" => Ok(Self::Sface),
            "arcface" => Ok(Self::Arcface),
            other => Err(format!("unknown embedding profile '{other}' (expected sface or arcface)")),
        }
    }
}

pub struct FaceRecognizer {
    session: Session,
    profile: EmbeddingProfile,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path, profile: EmbeddingProfile) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            ?profile,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded recognition model"
        );
        Ok(Self { session, profile })
    }

    pub fn profile(&self) -> EmbeddingProfile {
        self.profile
    }

    pub fn extract(
        &mut self,
        frame: &Frame,
        landmarks: Option<&[(f32, f32); 5]>,
    ) -> Result<Embedding, RecognizerError> {
        let landmarks = landmarks.ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(frame, landmarks, INPUT_SIZE);
        let input = preprocess(&aligned, self.profile);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::BadOutput(e.to_string()))?;

        let expected = self.profile.dim();
        if raw.len() != expected {
            return Err(RecognizerError::WrongDimension {
                expected,
                actual: raw.len(),
            });
        }
        Ok(Embedding::new(l2_normalize(raw)))
    }
}

fn preprocess(aligned: &[u8], profile: EmbeddingProfile) -> Array4<f32> {
    let (mean, std) = profile.normalization();
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for (i, &px) in aligned.iter().take(INPUT_SIZE * INPUT_SIZE).enumerate() {
        let v = (px as f32 - mean) / std;
        let (y, x) = (i / INPUT_SIZE, i % INPUT_SIZE);
        for c in 0..3 {
            tensor[[0, c, y, x]] = v;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_dimensions() {
        assert_eq!(EmbeddingProfile::default().dim(), 128);
        assert_eq!(EmbeddingProfile::Arcface.dim(), 512);
        assert_eq!("ArcFace".parse::<EmbeddingProfile>(), Ok(EmbeddingProfile::Arcface));
        assert!("facenet".parse::<EmbeddingProfile>().is_err());
    }

    #[test]
    fn test_preprocess_normalizes_per_profile() {
        let aligned = vec![200u8; INPUT_SIZE * INPUT_SIZE];
        let sface = preprocess(&aligned, EmbeddingProfile::Sface);
        assert_eq!(sface.shape(), &[1, 3, INPUT_SIZE, INPUT_SIZE]);
        assert_eq!(sface[[0, 2, 5, 5]], 200.0);

        let arcface = preprocess(&aligned, EmbeddingProfile::Arcface);
        let expected = (200.0 - 127.5) / 127.5;
        assert!((arcface[[0, 0, 111, 111]] - expected).abs() < 1e-6);
        assert_eq!(arcface[[0, 0, 7, 9]], arcface[[0, 1, 7, 9]]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
