//! Age, gender and expression estimation.
//!
//! `GenderAgeEstimator` runs InsightFace's `genderage.onnx`;
//! `ExpressionClassifier` runs the FER+ emotion model.

use crate::alignment;
use crate::frame::Frame;
use crate::types::{BoundingBox, Expressions};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const GENDER_AGE_INPUT: usize = 96;
const GENDER_AGE_CROP_SCALE: f32 = 1.5;
const EXPRESSION_INPUT: usize = 64;
const EXPRESSION_CROP_SCALE: f32 = 1.1;

/// FER+ output order.
const EXPRESSION_LABELS: [&str; 8] = [
    "neutral",
    "happy",
    "surprised",
    "sad",
    "angry",
    "disgusted",
    "fearful",
    "contempt",
];

#[derive(Error, Debug)]
pub enum AttributeError {
    #[error("attribute model not found: {0}")]
    ModelNotFound(String),
    #[error("attribute output: {0}")]
    BadOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

fn open(model_path: &Path, what: &str) -> Result<Session, AttributeError> {
    if !model_path.exists() {
        return Err(AttributeError::ModelNotFound(model_path.display().to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(1)?
        .commit_from_file(model_path)?;
    tracing::info!(path = %model_path.display(), model = what, "loaded attribute model");
    Ok(session)
}

fn grayscale_tensor(pixels: &[u8], size: usize, channels: usize) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, channels, size, size));
    for (i, &px) in pixels.iter().take(size * size).enumerate() {
        for c in 0..channels {
            tensor[[0, c, i / size, i % size]] = px as f32;
        }
    }
    tensor
}

pub struct GenderAgeEstimator {
    session: Session,
}

impl GenderAgeEstimator {
    pub fn load(model_path: &Path) -> Result<Self, AttributeError> {
        Ok(Self {
            session: open(model_path, "genderage")?,
        })
    }

    /// Returns (age in years, "male" | "female").
    pub fn estimate(&mut self, frame: &Frame, bbox: &BoundingBox) -> Result<(f32, String), AttributeError> {
        let crop = alignment::crop_square(frame, bbox, GENDER_AGE_CROP_SCALE, GENDER_AGE_INPUT);
        let input = grayscale_tensor(&crop, GENDER_AGE_INPUT, 3);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::BadOutput(e.to_string()))?;
        decode_gender_age(raw)
    }
}

/// `[female, male, age / 100]`.
fn decode_gender_age(raw: &[f32]) -> Result<(f32, String), AttributeError> {
    let [female, male, age] = raw.get(..3).and_then(|s| <[f32; 3]>::try_from(s).ok()).ok_or_else(|| {
        AttributeError::BadOutput(format!("gender/age output has {} values", raw.len()))
    })?;
    let gender = if male > female { "male" } else { "female" };
    Ok(((age * 100.0).max(0.0), gender.to_string()))
}

pub struct ExpressionClassifier {
    session: Session,
}

impl ExpressionClassifier {
    pub fn load(model_path: &Path) -> Result<Self, AttributeError> {
        Ok(Self {
            session: open(model_path, "expression")?,
        })
    }

    pub fn classify(&mut self, frame: &Frame, bbox: &BoundingBox) -> Result<Expressions, AttributeError> {
        let crop = alignment::crop_square(frame, bbox, EXPRESSION_CROP_SCALE, EXPRESSION_INPUT);
        let input = grayscale_tensor(&crop, EXPRESSION_INPUT, 1);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::BadOutput(e.to_string()))?;
        decode_expressions(raw)
    }
}

fn decode_expressions(logits: &[f32]) -> Result<Expressions, AttributeError> {
    if logits.len() != EXPRESSION_LABELS.len() {
        return Err(AttributeError::BadOutput(format!(
            "expression output has {} values, expected {}",
            logits.len(),
            EXPRESSION_LABELS.len()
        )));
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f32 = exp.iter().sum();
    Ok(EXPRESSION_LABELS
        .iter()
        .zip(exp)
        .map(|(label, e)| (label.to_string(), e / total))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_gender_age() {
        let (age, gender) = decode_gender_age(&[0.2, 0.9, 0.314]).unwrap();
        assert!((age - 31.4).abs() < 1e-4);
        assert_eq!(gender, "male");

        let (_, gender) = decode_gender_age(&[0.7, 0.1, 0.5]).unwrap();
        assert_eq!(gender, "female");
        assert!(decode_gender_age(&[0.1, 0.2]).is_err());
    }

    #[test]
    fn test_expressions_softmax_in_label_order() {
        let expressions = decode_expressions(&[0.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let total: f32 = expressions.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert_eq!(expressions.dominant(), Some("happy"));
        assert_eq!(expressions.iter().next().map(|(n, _)| n), Some("neutral"));
        assert!(decode_expressions(&[1.0; 7]).is_err());
    }

    #[test]
    fn test_grayscale_tensor_layout() {
        let t = grayscale_tensor(&[7u8; 16], 4, 3);
        assert_eq!(t.shape(), &[1, 3, 4, 4]);
        assert_eq!(t[[0, 2, 3, 3]], 7.0);
    }
}
