//! Per-store configuration and the `store.json` manifest.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::fsutil::write_atomic;

pub const MANIFEST_FILE: &str = "store.json";
pub const FORMAT_VERSION: u32 = 1;

/// Index parameters. Everything but `threads` is fixed at creation and
/// persisted in the manifest; `threads` is a runtime choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub dim: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    #[serde(skip, default = "default_threads")]
    pub threads: usize,
}

impl StoreConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            m: 16,
            ef_construction: 100,
            ef_search: 50,
            threads: default_threads(),
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }
}

/// Query threads: half the cores, between 1 and 4.
pub fn default_threads() -> usize {
    let available = std::thread::available_parallelism()
        .map(|v| v.get())
        .unwrap_or(2);
    (available / 2).clamp(1, 4)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreManifest {
    pub format_version: u32,
    #[serde(flatten)]
    pub config: StoreConfig,
}

impl StoreManifest {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            config,
        }
    }

    pub fn exists(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE).is_file()
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = fs::read(&path).map_err(|e| {
            StoreError::Corrupt(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        let manifest: StoreManifest = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("invalid manifest {}: {e}", path.display())))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported store format version {}",
                manifest.format_version
            )));
        }
        if manifest.config.dim == 0 {
            return Err(StoreError::Corrupt("manifest dimension is zero".into()));
        }
        Ok(manifest)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| StoreError::Corrupt(format!("cannot encode manifest: {e}")))?;
        write_atomic(&dir.join(MANIFEST_FILE), &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::new(128);
        assert_eq!(config.m, 16);
        assert_eq!(config.ef_construction, 100);
        assert_eq!(config.ef_search, 50);
        assert!((1..=4).contains(&config.threads));
        assert_eq!(config.with_threads(0).threads, 1);
    }

    #[test]
    fn test_manifest_roundtrip_skips_threads() {
        let dir = tempdir().unwrap();
        let manifest = StoreManifest::new(StoreConfig::new(3).with_threads(3));
        manifest.save(dir.path()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(raw["dim"], 3);
        assert_eq!(raw["format_version"], 1);
        assert!(raw.get("threads").is_none());

        let loaded = StoreManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.config.dim, 3);
        assert_eq!(loaded.config.threads, default_threads());
    }

    #[test]
    fn test_missing_manifest_is_corrupt() {
        let dir = tempdir().unwrap();
        assert!(!StoreManifest::exists(dir.path()));
        assert!(matches!(
            StoreManifest::load(dir.path()),
            Err(StoreError::Corrupt(_))
        ));
    }
}
