use crate::detector::{DetectOptions, DEFAULT_MAX_FACES, DEFAULT_UPSAMPLE};
use crate::matcher::DEFAULT_TOLERANCE;
use crate::selector::DEFAULT_PIPELINE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine settings. Every field has a default, so an empty TOML table is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Configured pipeline name, e.g. `all_models` or `insightface`.
    pub model: String,
    /// Maximum embedding distance for a match.
    pub tolerance: f32,
    /// Cap on faces per detector and per image.
    pub max_faces: usize,
    /// Extra search resolution for scale-sensitive detectors, 1–4.
    pub upsample: u32,
    /// Directory holding the model files.
    pub model_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_PIPELINE.to_string(),
            tolerance: DEFAULT_TOLERANCE,
            max_faces: DEFAULT_MAX_FACES,
            upsample: DEFAULT_UPSAMPLE,
            model_dir: default_model_dir(),
        }
    }
}

impl EngineConfig {
    pub fn detect_options(&self) -> DetectOptions {
        DetectOptions::new(self.upsample, self.max_faces)
    }
}

/// `$XDG_DATA_HOME/facematch/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facematch")
        .join("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.model, "all_models");
        assert_eq!(config.tolerance, 0.55);
        assert_eq!(config.max_faces, 30);
        assert_eq!(config.upsample, 2);
        assert!(config.model_dir.ends_with("facematch/models"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"model": "hog", "upsample": 9}"#).unwrap();
        assert_eq!(config.model, "hog");
        assert_eq!(config.tolerance, 0.55);
        assert_eq!(config.detect_options().upsample, 4);
    }
}
