use anyhow::{Context, Result};
use facetrack_core::{EmbeddingProfile, ModelPaths, TrackerSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration.
///
/// Built from defaults, then the optional TOML file, then `FACETRACK_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub width: u32,
    pub height: u32,
    /// Ticks per second; also requested from the camera.
    pub frame_rate: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub embedding_profile: EmbeddingProfile,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum faces returned by `ListFaces`.
    pub list_limit: usize,
    pub tracker: TrackerSettings,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            frame_rate: 30,
            model_dir: data_dir.join("models"),
            embedding_profile: EmbeddingProfile::default(),
            db_path: data_dir.join("faces.db"),
            list_limit: 100,
            tracker: TrackerSettings::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = match config_file() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) if std::env::var_os("FACETRACK_CONFIG").is_some() => {
                anyhow::bail!("config file {} does not exist", path.display())
            }
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.finish();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::info!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACETRACK_*` overrides read through `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(device) = var("FACETRACK_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        env_parse(&var, "FACETRACK_WIDTH", &mut self.width);
        env_parse(&var, "FACETRACK_HEIGHT", &mut self.height);
        env_parse(&var, "FACETRACK_FRAME_RATE", &mut self.frame_rate);
        env_parse(&var, "FACETRACK_MATCH_THRESHOLD", &mut self.tracker.match_threshold);
        env_parse(&var, "FACETRACK_LIST_LIMIT", &mut self.list_limit);
        if let Some(dir) = var("FACETRACK_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("FACETRACK_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(profile) = var("FACETRACK_EMBEDDING_MODEL") {
            self.embedding_profile = profile
                .parse()
                .map_err(anyhow::Error::msg)
                .context("FACETRACK_EMBEDDING_MODEL")?;
        }
        Ok(())
    }

    /// Derive settings that follow from others.
    fn finish(&mut self) {
        self.tracker.gallery.embedding_dim = self.embedding_profile.dim();
        self.frame_rate = self.frame_rate.max(1);
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir, self.embedding_profile)
    }

    pub fn tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.frame_rate))
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facetrack")
}

fn config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("FACETRACK_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
        .ok()?;
    Some(config_home.join("facetrack/facetrack.toml"))
}

/// Parse `key` into `slot`, leaving it untouched when unset or malformed.
fn env_parse<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_toml_overrides_only_given_keys() {
        let config = Config::from_toml(
            r#"
            camera_device = "/dev/video4"
            embedding_profile = "arcface"

            [tracker]
            match_threshold = 0.5

            [tracker.smoother]
            max_misses = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.embedding_profile, EmbeddingProfile::Arcface);
        assert_eq!(config.tracker.match_threshold, 0.5);
        assert_eq!(config.tracker.smoother.max_misses, 8);
        assert_eq!(config.width, 640);
        assert_eq!(config.tracker.gallery.refresh_interval_ms, 1000);
    }

    #[test]
    fn test_unknown_profile_is_an_error() {
        assert!(Config::from_toml(r#"embedding_profile = "facenet""#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(vars(&[
                ("FACETRACK_CAMERA_DEVICE", "/dev/video9"),
                ("FACETRACK_FRAME_RATE", "15"),
                ("FACETRACK_MATCH_THRESHOLD", "0.45"),
                ("FACETRACK_DB_PATH", "/var/lib/facetrack/faces.db"),
                ("FACETRACK_WIDTH", "wide"),
            ]))
            .unwrap();
        assert_eq!(config.camera_device, "/dev/video9");
        assert_eq!(config.frame_rate, 15);
        assert_eq!(config.tracker.match_threshold, 0.45);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facetrack/faces.db"));
        assert_eq!(config.width, 640);
    }

    #[test]
    fn test_bad_profile_env_is_an_error() {
        let mut config = Config::default();
        assert!(config
            .apply_env(vars(&[("FACETRACK_EMBEDDING_MODEL", "nope")]))
            .is_err());
    }

    #[test]
    fn test_profile_sets_gallery_dimension() {
        let mut config = Config::default();
        config
            .apply_env(vars(&[("FACETRACK_EMBEDDING_MODEL", "arcface")]))
            .unwrap();
        config.finish();
        assert_eq!(config.tracker.gallery.embedding_dim, 512);
        assert!(config.model_paths().recognizer.ends_with("w600k_r50.onnx"));
    }

    #[test]
    fn test_zero_frame_rate_clamped() {
        let mut config = Config::default();
        config.frame_rate = 0;
        config.finish();
        assert_eq!(config.tick_period(), std::time::Duration::from_secs(1));
    }
}
