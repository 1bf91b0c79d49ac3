use crate::types::{Embedding, EnrolledIdentity, UNKNOWN_LABEL};

/// Euclidean distance below which a probe is accepted as an enrolled identity.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Enrolled name, or [`UNKNOWN_LABEL`] when nothing is close enough.
    pub label: String,
    /// Distance to the closest gallery entry.
    pub distance: f32,
    /// Gallery position of the closest entry.
    pub index: usize,
}

impl MatchResult {
    pub fn matched(&self) -> bool {
        self.label != UNKNOWN_LABEL
    }

    /// `1 - distance`, clamped into [0, 1].
    pub fn confidence(&self) -> f32 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    /// Returns `None` only when the gallery holds no comparable entry.
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[EnrolledIdentity],
        threshold: f32,
    ) -> Option<MatchResult>;
}

/// Nearest neighbour by Euclidean distance.
///
/// The first minimum in gallery order wins ties, so results are stable for a
/// given snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[EnrolledIdentity],
        threshold: f32,
    ) -> Option<MatchResult> {
        let mut best: Option<(usize, f32)> = None;

        for (i, identity) in gallery.iter().enumerate() {
            if identity.embedding.len() != probe.len() {
                tracing::trace!(
                    name = %identity.name,
                    expected = probe.len(),
                    actual = identity.embedding.len(),
                    "skipping gallery entry with mismatched dimension"
                );
                continue;
            }
            let distance = probe.euclidean_distance(&identity.embedding);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        let (index, distance) = best?;
        let label = if distance < threshold {
            gallery[index].name.clone()
        } else {
            UNKNOWN_LABEL.to_string()
        };

        Some(MatchResult {
            label,
            distance,
            index,
        })
    }
}
