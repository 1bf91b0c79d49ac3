//! Per-frame tracking: smoothing, matching and overlay layout for one
//! analyzer result.

use crate::clock::Clock;
use crate::gallery::{GalleryCache, GallerySnapshot};
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::overlay::{self, FixedAdvance, LabelInfo, OverlayInstructions, TextMeasure};
use crate::settings::TrackerSettings;
use crate::smoother::BoxSmoother;
use crate::store::ObjectStore;
use crate::types::{BoundingBox, Detection, RecognitionResult, UNKNOWN_LABEL};
use std::sync::Arc;

/// The last face seen, in frame coordinates, with what it was recognised as.
#[derive(Debug, Clone)]
pub struct TrackedFace {
    pub detection: Detection,
    pub recognition: RecognitionResult,
}

/// What one frame produced.
#[derive(Debug, Clone, Default)]
pub struct FrameOutcome {
    pub recognition: Option<RecognitionResult>,
    pub overlay: Option<OverlayInstructions>,
    /// Stable box from the smoother, possibly bridged over a dropout.
    pub smoothed: Option<BoundingBox>,
}

pub struct Tracker<S, M = EuclideanMatcher> {
    smoother: BoxSmoother,
    gallery: GalleryCache<S>,
    matcher: M,
    threshold: f32,
    measure: Box<dyn TextMeasure>,
    last_face: Option<TrackedFace>,
    recognition: Option<RecognitionResult>,
}

impl<S: ObjectStore> Tracker<S, EuclideanMatcher> {
    pub fn new(store: S, settings: &TrackerSettings, clock: Arc<dyn Clock>) -> Self {
        Self::with_matcher(store, settings, clock, EuclideanMatcher)
    }
}

impl<S: ObjectStore, M: Matcher> Tracker<S, M> {
    pub fn with_matcher(store: S, settings: &TrackerSettings, clock: Arc<dyn Clock>, matcher: M) -> Self {
        Self {
            smoother: BoxSmoother::new(settings.smoother, clock.clone()),
            gallery: GalleryCache::new(store, settings.gallery, clock),
            matcher,
            threshold: settings.match_threshold,
            measure: Box::new(FixedAdvance::default()),
            last_face: None,
            recognition: None,
        }
    }

    /// Use the renderer's font metrics for label sizing.
    pub fn with_text_measure(mut self, measure: Box<dyn TextMeasure>) -> Self {
        self.measure = measure;
        self
    }

    /// Run one frame's worth of tracking. `detection` is the analyzer's result
    /// for a `frame_width` x `frame_height` frame.
    pub async fn process_frame(
        &mut self,
        frame_width: u32,
        frame_height: u32,
        detection: Option<Detection>,
    ) -> FrameOutcome {
        let Some(detection) = detection else {
            let smoothed = self.smoother.smooth(None);
            self.recognition = None;
            self.last_face = None;
            return FrameOutcome {
                recognition: None,
                overlay: smoothed
                    .map(|b| overlay::layout(&b, &LabelInfo::unknown(), self.measure.as_ref())),
                smoothed,
            };
        };

        let detection = detection.resized(frame_width, frame_height);
        let smoothed = self.smoother.smooth(Some(detection.bbox));
        let snapshot = self.gallery.current().await;
        let (label, confidence) = self.identify(&detection, snapshot.as_deref());

        let recognition = RecognitionResult {
            label,
            confidence,
            age: detection.rounded_age(),
            gender: detection.gender.clone(),
            expression: detection.dominant_expression(),
        };
        tracing::trace!(label = %recognition.label, confidence, "frame recognised");

        let overlay = smoothed.map(|b| {
            let info = LabelInfo {
                name: (!recognition.is_unknown()).then(|| recognition.label.clone()),
                confidence: recognition.confidence,
                age: recognition.age,
                gender: recognition.gender.clone(),
            };
            overlay::layout(&b, &info, self.measure.as_ref())
        });

        self.recognition = Some(recognition.clone());
        self.last_face = Some(TrackedFace {
            detection,
            recognition: recognition.clone(),
        });

        FrameOutcome {
            recognition: Some(recognition),
            overlay,
            smoothed,
        }
    }

    fn identify(&self, detection: &Detection, snapshot: Option<&GallerySnapshot>) -> (String, f32) {
        let result = snapshot
            .and_then(|s| self.matcher.compare(&detection.embedding, s.identities(), self.threshold));
        match result {
            Some(m) => {
                let confidence = m.confidence();
                (m.label, confidence)
            }
            // Nothing to compare against.
            None => (UNKNOWN_LABEL.to_string(), 1.0),
        }
    }

    /// Recognition published by the most recent frame.
    pub fn recognition(&self) -> Option<&RecognitionResult> {
        self.recognition.as_ref()
    }

    pub fn last_face(&self) -> Option<&TrackedFace> {
        self.last_face.as_ref()
    }

    /// Forget the current face after a tick that produced no usable detection.
    pub fn clear_detection(&mut self) {
        self.recognition = None;
        self.last_face = None;
    }

    /// Make the next frame re-read the gallery.
    pub fn invalidate_gallery(&mut self) {
        self.gallery.invalidate();
    }

    pub fn gallery_size(&self) -> usize {
        self.gallery.peek().map_or(0, |s| s.len())
    }
}
