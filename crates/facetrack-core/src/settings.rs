//! Tracker tuning, deserializable from the daemon's `[tracker]` table.

use crate::capture::CaptureBridge;
use crate::gallery::GallerySettings;
use crate::matcher::DEFAULT_MATCH_THRESHOLD;
use crate::smoother::SmootherSettings;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub smoother: SmootherSettings,
    pub gallery: GallerySettings,
    /// Euclidean distance below which a face counts as recognised.
    pub match_threshold: f32,
    /// Extra pixels around the face box that still count as a hit when claiming.
    pub hit_padding: f32,
    pub jpeg_quality: u8,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            smoother: SmootherSettings::default(),
            gallery: GallerySettings::default(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            hit_padding: 10.0,
            jpeg_quality: 90,
        }
    }
}

impl TrackerSettings {
    pub fn capture_bridge(&self) -> CaptureBridge {
        CaptureBridge::new(self.hit_padding, self.jpeg_quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_table_keeps_defaults() {
        let settings: TrackerSettings = serde_json::from_str(
            r#"{ "match_threshold": 0.5, "smoother": { "max_misses": 8 } }"#,
        )
        .unwrap();
        assert_eq!(settings.match_threshold, 0.5);
        assert_eq!(settings.smoother.max_misses, 8);
        assert_eq!(settings.smoother.blend, 0.3);
        assert_eq!(settings.gallery.refresh_interval_ms, 1000);
        assert_eq!(settings.hit_padding, 10.0);
    }
}
