use facematch_core::EngineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// CLI configuration: engine settings plus the per-photo worker timeout.
///
/// Loaded from an optional TOML file, then overridden by `FACEMATCH_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(flatten)]
    pub engine: EngineConfig,
    /// Seconds one photo may spend in the engine before it is marked failed.
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Load from `path`, else from `$FACEMATCH_CONFIG`, else defaults; then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var("FACEMATCH_CONFIG").ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `FACEMATCH_*` overrides read through `lookup`. Unparseable
    /// values are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("FACEMATCH_MODEL") {
            self.engine.model = model;
        }
        if let Some(dir) = lookup("FACEMATCH_MODEL_DIR") {
            self.engine.model_dir = PathBuf::from(dir);
        }
        override_parsed(&lookup, "FACEMATCH_TOLERANCE", &mut self.engine.tolerance);
        override_parsed(&lookup, "FACEMATCH_MAX_FACES", &mut self.engine.max_faces);
        override_parsed(&lookup, "FACEMATCH_UPSAMPLE", &mut self.engine.upsample);
        override_parsed(&lookup, "FACEMATCH_TIMEOUT_SECS", &mut self.timeout_secs);
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let Some(raw) = lookup(key) else {
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

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.model, "all_models");
        assert_eq!(config.engine.max_faces, 30);
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_from_file_merges_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facematch.toml");
        std::fs::write(
            &path,
            "model = \"insightface\"\ntolerance = 0.4\nmodel_dir = \"/srv/models\"\ntimeout_secs = 15\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.engine.model, "insightface");
        assert_eq!(config.engine.tolerance, 0.4);
        assert_eq!(config.engine.model_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.engine.upsample, 2);
        assert_eq!(config.timeout_secs, 15);
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = Config::from_file(Path::new("/nonexistent/facematch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_bad_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facematch.toml");
        std::fs::write(&path, "max_faces = \"lots\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FACEMATCH_MODEL", "dlib_best"),
            ("FACEMATCH_TOLERANCE", "0.6"),
            ("FACEMATCH_UPSAMPLE", "3"),
            ("FACEMATCH_MAX_FACES", "many"),
            ("FACEMATCH_TIMEOUT_SECS", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.engine.model, "dlib_best");
        assert_eq!(config.engine.tolerance, 0.6);
        assert_eq!(config.engine.upsample, 3);
        // Unparseable value leaves the default in place.
        assert_eq!(config.engine.max_faces, 30);
        assert_eq!(config.timeout_secs, 5);
    }
}
