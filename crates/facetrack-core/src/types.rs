use serde::{Deserialize, Serialize};

/// Label reported when a face matches no enrolled identity.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Length of the face descriptors the gallery expects unless configured otherwise.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

/// Axis-aligned face box in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Grow the box by `padding` pixels on every side.
    pub fn expand(&self, padding: f32) -> Self {
        Self {
            x: self.x - padding,
            y: self.y - padding,
            width: self.width + padding * 2.0,
            height: self.height + padding * 2.0,
        }
    }

    /// Inclusive point containment.
    pub fn contains(&self, px: f32, py: f32) -> bool {
        px >= self.x && px <= self.right() && py >= self.y && py <= self.bottom()
    }

    /// Scale every coordinate independently along each axis.
    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
        }
    }

    /// Move each coordinate the fraction `t` of the way toward `target`.
    pub fn lerp(&self, target: &BoundingBox, t: f32) -> Self {
        let lerp = |from: f32, to: f32| from + (to - from) * t;
        Self {
            x: lerp(self.x, target.x),
            y: lerp(self.y, target.y),
            width: lerp(self.width, target.width),
            height: lerp(self.height, target.height),
        }
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter_w = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
        let inter_h = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.width * self.height + other.width * other.height - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face descriptor produced by the embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when the vector has exactly `dim` finite components.
    pub fn is_well_formed(&self, dim: usize) -> bool {
        self.values.len() == dim && self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean (L2) distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled person as the matcher sees them.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledIdentity {
    pub name: String,
    pub embedding: Embedding,
}

/// Expression scores in the order the expression model reports them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expressions(Vec<(String, f32)>);

impl Expressions {
    pub fn new(scores: Vec<(String, f32)>) -> Self {
        Self(scores)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(name, score)| (name.as_str(), *score))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Highest-scoring expression. On a tie the entry listed first wins.
    pub fn dominant(&self) -> Option<&str> {
        let mut best: Option<(&str, f32)> = None;
        for (name, score) in self.iter() {
            if score.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((name, score));
            }
        }
        best.map(|(name, _)| name)
    }
}

impl FromIterator<(String, f32)> for Expressions {
    fn from_iter<I: IntoIterator<Item = (String, f32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Everything the face analyzer reports for the single face in a frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Detector confidence for the box.
    pub score: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
    pub embedding: Embedding,
    pub age: Option<f32>,
    pub gender: Option<String>,
    pub expressions: Expressions,
    /// Dimensions of the image the detector worked on.
    pub source_size: (u32, u32),
}

impl Detection {
    /// Map box and landmarks from the detector's input size onto a `width` x `height` frame.
    pub fn resized(mut self, width: u32, height: u32) -> Self {
        let (src_w, src_h) = self.source_size;
        if src_w == 0 || src_h == 0 || (src_w, src_h) == (width, height) {
            self.source_size = (width, height);
            return self;
        }
        let sx = width as f32 / src_w as f32;
        let sy = height as f32 / src_h as f32;
        self.bbox = self.bbox.scale(sx, sy);
        if let Some(landmarks) = self.landmarks.as_mut() {
            for point in landmarks.iter_mut() {
                *point = (point.0 * sx, point.1 * sy);
            }
        }
        self.source_size = (width, height);
        self
    }

    pub fn rounded_age(&self) -> Option<u32> {
        self.age
            .filter(|a| a.is_finite())
            .map(|a| a.round().max(0.0) as u32)
    }

    pub fn dominant_expression(&self) -> Option<String> {
        self.expressions.dominant().map(str::to_string)
    }
}

/// Recognition state published for the current frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub label: String,
    /// Distance-derived confidence in [0, 1].
    pub confidence: f32,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub expression: Option<String>,
}

impl RecognitionResult {
    pub fn is_unknown(&self) -> bool {
        self.label == UNKNOWN_LABEL
    }
}

/// Snapshot of an unknown face, ready to hand to enrollment.
#[derive(Debug, Clone)]
pub struct PendingCapture {
    /// JPEG-encoded full frame.
    pub image: Vec<u8>,
    pub embedding: Embedding,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub expression: Option<String>,
}
