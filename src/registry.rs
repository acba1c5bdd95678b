//! Named stores under one data directory
//!
//! Every subdirectory holding a `store.json` manifest is a database, named
//! after the directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::StoreManifest;
use crate::error::Result;
use crate::importer::STAGING_SUFFIX;
use crate::store::Store;

/// Granularity of the background loop's cancellation checks
const CANCEL_POLL: Duration = Duration::from_millis(100);

pub struct Databases {
    data_dir: PathBuf,
    stores: HashMap<String, Arc<Store>>,
}

impl Databases {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            stores: HashMap::new(),
        }
    }

    /// Open every store under `data_dir`.
    ///
    /// A store that fails to open is logged and left out; the rest still
    /// serve.
    pub fn scan(data_dir: impl AsRef<Path>, threads: usize) -> Result<Self> {
        let mut databases = Self::new(data_dir);
        let mut dirs: Vec<PathBuf> = fs::read_dir(&databases.data_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir() && StoreManifest::exists(path))
            .filter(|path| {
                let staging = path.to_string_lossy().ends_with(STAGING_SUFFIX);
                if staging {
                    tracing::warn!("skipping unfinished import {}", path.display());
                }
                !staging
            })
            .collect();
        dirs.sort();

        for dir in dirs {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                tracing::warn!("skipping store with non UTF-8 name: {}", dir.display());
                continue;
            };
            match Store::open_with_threads(&dir, threads) {
                Ok(store) => {
                    databases.stores.insert(name, Arc::new(store));
                }
                Err(err) => {
                    tracing::error!("failed to open database '{}': {}", name, err);
                }
            }
        }

        tracing::info!(
            "loaded {} database(s) from {}",
            databases.stores.len(),
            databases.data_dir.display()
        );
        Ok(databases)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn get(&self, name: &str) -> Option<Arc<Store>> {
        self.stores.get(name).cloned()
    }

    pub fn insert(&mut self, name: impl Into<String>, store: Store) {
        self.stores.insert(name.into(), Arc::new(store));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Apply pending entries in every store, compacting each journal after
    /// a successful apply. Returns the number of stores that failed.
    pub fn apply_all(&self, cancel: &AtomicBool) -> usize {
        let mut failed = 0;
        for name in self.names() {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let Some(store) = self.get(&name) else {
                continue;
            };
            if store.stats().pending == 0 {
                continue;
            }
            let result = store.apply_until(cancel).and_then(|report| {
                if !report.cancelled {
                    store.compact()?;
                }
                Ok(report)
            });
            match result {
                Ok(report) => tracing::info!(
                    "database '{}': applied {} entries, cursor {}",
                    name,
                    report.applied,
                    report.cursor
                ),
                Err(err) => {
                    failed += 1;
                    tracing::error!("database '{}': background apply failed: {}", name, err);
                }
            }
        }
        failed
    }

    /// Persist every store. Returns the number that failed.
    /// Persist every store. A store whose apply is still running is skipped
    /// rather than waited on. Returns the number of stores that failed.
    pub fn save_all(&self) -> usize {
        let mut failed = 0;
        for (name, store) in &self.stores {
            match store.try_save() {
                Ok(true) => {}
                Ok(false) => tracing::warn!("database '{}': apply in progress, save skipped", name),
                Err(err) => {
                    failed += 1;
                    tracing::error!("database '{}': save failed: {}", name, err);
                }
            }
        }
        failed
    }
}

/// Periodic background apply until `cancel` is set.
pub fn apply_loop(databases: Arc<Databases>, interval: Duration, cancel: Arc<AtomicBool>) {
    tracing::info!("background apply every {:?}", interval);
    loop {
        let started = Instant::now();
        while started.elapsed() < interval {
            if cancel.load(Ordering::SeqCst) {
                tracing::info!("background apply stopped");
                return;
            }
            std::thread::sleep(CANCEL_POLL.min(interval));
        }
        databases.apply_all(&cancel);
    }
}
