//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by greedy NMS. The frame
//! is letterboxed into the square network input; boxes and landmarks are
//! mapped back to frame pixels before they leave this module.

use crate::alignment;
use crate::frame::Frame;
use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("detector output: {0}")]
    BadOutput(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One face as the detector sees it, in frame coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub score: f32,
    pub landmarks: Option<[(f32, f32); 5]>,
}

#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    frame_w: f32,
    frame_h: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((INPUT_SIZE as f32 - new_w) / 2.0).floor(),
            pad_y: ((INPUT_SIZE as f32 - new_h) / 2.0).floor(),
            frame_w: width as f32,
            frame_h: height as f32,
        }
    }

    fn scaled_size(&self, width: u32, height: u32) -> (usize, usize) {
        (
            (width as f32 * self.scale).round() as usize,
            (height as f32 * self.scale).round() as usize,
        )
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    /// Like `to_frame`, but never outside the frame.
    fn to_frame_clamped(&self, x: f32, y: f32) -> (f32, f32) {
        let (x, y) = self.to_frame(x, y);
        (x.clamp(0.0, self.frame_w), y.clamp(0.0, self.frame_h))
    }
}

/// Positions of the (score, bbox, kps) outputs for one stride.
type StrideOutputs = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::BadOutput(format!(
                "expected 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let outputs = map_outputs(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "loaded SCRFD model");

        Ok(Self { session, outputs })
    }

    /// All faces above the score threshold, highest score first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError> {
        let letterbox = Letterbox::fit(frame.width, frame.height);
        let input = preprocess(frame, &letterbox);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut faces = Vec::new();
        for (slot, &stride) in STRIDES.iter().enumerate() {
            let (score_at, bbox_at, kps_at) = self.outputs[slot];
            let (_, scores) = outputs[score_at]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::BadOutput(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_at]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::BadOutput(format!("boxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_at]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::BadOutput(format!("landmarks stride {stride}: {e}")))?;
            faces.extend(decode_stride(scores, boxes, kps, stride, &letterbox));
        }

        let faces = nms(faces, NMS_THRESHOLD);
        tracing::trace!(count = faces.len(), "detector pass");
        Ok(faces)
    }
}

fn preprocess(frame: &Frame, letterbox: &Letterbox) -> Array4<f32> {
    let (new_w, new_h) = letterbox.scaled_size(frame.width, frame.height);
    let resized = alignment::resize(frame, new_w, new_h);
    let (px, py) = (letterbox.pad_x as usize, letterbox.pad_y as usize);

    // Padding is left at zero, which is what MEAN normalizes to.
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for y in 0..new_h.min(INPUT_SIZE - py) {
        for x in 0..new_w.min(INPUT_SIZE - px) {
            let v = (resized[y * new_w + x] as f32 - MEAN) / STD;
            for c in 0..3 {
                tensor[[0, c, py + y, px + x]] = v;
            }
        }
    }
    tensor
}

/// Output names are either `score_8`, `bbox_16`, ... or opaque; opaque
/// exports use the positional layout [scores x3, boxes x3, kps x3].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named.as_deref() {
        Some(&[a, b, c]) => [a, b, c],
        _ => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<DetectedFace> {
    let grid = INPUT_SIZE / stride;
    let step = stride as f32;
    let mut faces = Vec::new();

    for (idx, &score) in scores.iter().enumerate().take(grid * grid * ANCHORS_PER_CELL) {
        if score <= SCORE_THRESHOLD {
            continue;
        }
        let Some(d) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * step;
        let ay = (cell / grid) as f32 * step;

        let (x1, y1) = letterbox.to_frame_clamped(ax - d[0] * step, ay - d[1] * step);
        let (x2, y2) = letterbox.to_frame_clamped(ax + d[2] * step, ay + d[3] * step);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.to_frame(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step))
        });

        faces.push(DetectedFace {
            bbox: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
            score,
            landmarks,
        });
    }
    faces
}

/// Greedy non-maximum suppression; the result is sorted by score, descending.
fn nms(mut faces: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    faces.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<DetectedFace> = Vec::with_capacity(faces.len());
    for face in faces {
        if kept.iter().all(|k| k.bbox.iou(&face.bbox) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, score: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox::new(x, y, w, h),
            score,
            landmarks: None,
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let kept = nms(
            vec![
                face(5.0, 5.0, 100.0, 100.0, 0.8),
                face(0.0, 0.0, 100.0, 100.0, 0.9),
                face(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|f| f.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let lb = Letterbox::fit(320, 240);
        assert_eq!(lb.scaled_size(320, 240), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 80.0));
        let (x, y) = lb.to_frame(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_map_outputs_by_name() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(map_outputs(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i| format!("{}", 400 + i)).collect();
        assert_eq!(map_outputs(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_single_anchor() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
            frame_w: 640.0,
            frame_h: 640.0,
        };
        let grid = INPUT_SIZE / 32;
        let cells = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.0; cells];
        // Anchor index 2 is cell 1: column 1, row 0.
        scores[2] = 0.95;
        let mut boxes = vec![0.0; cells * 4];
        boxes[8..12].copy_from_slice(&[0.5, 0.0, 1.0, 2.0]);
        let kps = vec![0.0; cells * 10];

        let faces = decode_stride(&scores, &boxes, &kps, 32, &lb);
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox, BoundingBox::new(16.0, 0.0, 48.0, 64.0));
        assert_eq!(faces[0].landmarks.unwrap()[0], (32.0, 0.0));
    }

    #[test]
    fn test_decode_clamps_edge_face_to_frame() {
        let lb = Letterbox::fit(320, 240);
        let grid = INPUT_SIZE / 32;
        let cells = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.0; cells];
        // Column 0, row 3: just inside the top-left corner of the picture.
        let anchor = 3 * grid * ANCHORS_PER_CELL;
        scores[anchor] = 0.9;
        let mut boxes = vec![0.0; cells * 4];
        boxes[anchor * 4..anchor * 4 + 4].copy_from_slice(&[1.0, 2.0, 30.0, 30.0]);
        let kps = vec![0.0; cells * 10];

        let faces = decode_stride(&scores, &boxes, &kps, 32, &lb);
        assert_eq!(faces.len(), 1);
        let bbox = faces[0].bbox;
        assert_eq!((bbox.x, bbox.y), (0.0, 0.0));
        assert_eq!(bbox.x + bbox.width, 320.0);
        assert_eq!(bbox.y + bbox.height, 240.0);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = Frame::new(vec![255u8; 320 * 240], 320, 240, 0).unwrap();
        let lb = Letterbox::fit(320, 240);
        let t = preprocess(&frame, &lb);
        assert_eq!(t.shape(), &[1, 3, INPUT_SIZE, INPUT_SIZE]);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        let inside = t[[0, 1, 320, 320]];
        assert!((inside - (255.0 - MEAN) / STD).abs() < 1e-6);
    }
}
