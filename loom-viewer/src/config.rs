//! Viewer configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use loom_core::Result;
use loom_tiles::PngCompression;

/// Environment variable naming the dataset root.
pub const DATASET_PATH_VAR: &str = "LOOM_PATH";
/// Environment variable overriding the lock timeout, in seconds.
pub const LOCK_TIMEOUT_VAR: &str = "LOOM_LOCK_TIMEOUT";

/// Settings shared by the registry, the expansion caches and the tile engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Directory holding one sub-directory per project.
    pub dataset_path: PathBuf,
    /// How long to wait for a per-file lock.
    pub lock_timeout_secs: f64,
    /// Rows read per step when computing row extrema.
    pub extrema_chunk_rows: usize,
    /// Rows or columns read per step when expanding an axis.
    pub expansion_chunk: usize,
    pub png_compression: PngCompression,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            dataset_path: default_dataset_path(),
            lock_timeout_secs: 10.0,
            extrema_chunk_rows: 64,
            expansion_chunk: 64,
            png_compression: PngCompression::Default,
        }
    }
}

fn default_dataset_path() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join("loom-datasets")
}

impl ViewerConfig {
    /// Defaults, overridden by `LOOM_PATH` and `LOOM_LOCK_TIMEOUT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup(DATASET_PATH_VAR).filter(|p| !p.is_empty()) {
            config.dataset_path = PathBuf::from(path);
        }
        if let Some(secs) = lookup(LOCK_TIMEOUT_VAR)
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|s| s.is_finite() && *s >= 0.0)
        {
            config.lock_timeout_secs = secs;
        }
        config
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.lock_timeout_secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ViewerConfig::default();
        assert!(c.dataset_path.ends_with("loom-datasets"));
        assert_eq!(c.lock_timeout(), Duration::from_secs(10));
        assert_eq!(c.extrema_chunk_rows, 64);
        assert_eq!(c.expansion_chunk, 64);
    }

    #[test]
    fn environment_overrides() {
        let c = ViewerConfig::from_lookup(|key| match key {
            DATASET_PATH_VAR => Some("/data/looms".to_string()),
            LOCK_TIMEOUT_VAR => Some("2.5".to_string()),
            _ => None,
        });
        assert_eq!(c.dataset_path, PathBuf::from("/data/looms"));
        assert_eq!(c.lock_timeout(), Duration::from_millis(2500));

        let c = ViewerConfig::from_lookup(|key| match key {
            LOCK_TIMEOUT_VAR => Some("soon".to_string()),
            _ => None,
        });
        assert_eq!(c.lock_timeout_secs, 10.0);
    }

    #[test]
    fn json_with_partial_fields() {
        let c = ViewerConfig::from_json(
            r#"{"dataset_path": "/srv/loom", "png_compression": "fast", "expansion_chunk": 128}"#,
        )
        .unwrap();
        assert_eq!(c.dataset_path, PathBuf::from("/srv/loom"));
        assert_eq!(c.png_compression, PngCompression::Fast);
        assert_eq!(c.expansion_chunk, 128);
        assert_eq!(c.extrema_chunk_rows, 64);
        assert!(ViewerConfig::from_json("{\"lock_timeout_secs\": \"x\"}").is_err());
    }
}
