//! External key <-> internal id table
//!
//! Only active entries are held. Deactivating a key drops its row; the
//! internal id it pointed at stays tombstoned in the engine and is never
//! handed out again, so the key can later be assigned a fresh id.
//!
//! Persisted as `keymap.json`:
//!
//! ```text
//! {"applied_seq": 12, "entries": [{"key": 7, "id": 0}, {"key": 8, "id": 1}]}
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::fsutil::write_atomic;

pub const KEYMAP_FILE: &str = "keymap.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapEntry {
    pub key: u64,
    pub id: usize,
}

#[derive(Serialize, Deserialize)]
struct KeyMapFile {
    applied_seq: u64,
    entries: Vec<KeyMapEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct KeyMap {
    forward: HashMap<u64, usize>,
    reverse: HashMap<usize, u64>,
}

impl KeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn lookup(&self, key: u64) -> Option<usize> {
        self.forward.get(&key).copied()
    }

    #[inline]
    pub fn reverse(&self, id: usize) -> Option<u64> {
        self.reverse.get(&id).copied()
    }

    pub fn contains(&self, key: u64) -> bool {
        self.forward.contains_key(&key)
    }

    /// Record that `key` now lives at `id`.
    ///
    /// Fails with `DuplicateKey` if the key is active. An id that is already
    /// mapped means the engine handed out a live id twice, which is `Corrupt`.
    pub fn assign(&mut self, key: u64, id: usize) -> Result<()> {
        if self.forward.contains_key(&key) {
            return Err(StoreError::DuplicateKey(key));
        }
        if let Some(owner) = self.reverse.get(&id) {
            return Err(StoreError::Corrupt(format!(
                "internal id {id} is already mapped to key {owner}"
            )));
        }
        self.forward.insert(key, id);
        self.reverse.insert(id, key);
        Ok(())
    }

    /// Release `key`, returning the internal id it held.
    pub fn deactivate(&mut self, key: u64) -> Result<usize> {
        let id = self
            .forward
            .remove(&key)
            .ok_or(StoreError::UnknownKey(key))?;
        self.reverse.remove(&id);
        Ok(id)
    }

    pub fn active_len(&self) -> usize {
        self.forward.len()
    }

    pub fn iter_active(&self) -> impl Iterator<Item = KeyMapEntry> + '_ {
        self.forward
            .iter()
            .map(|(&key, &id)| KeyMapEntry { key, id })
    }

    /// Write the table and the journal sequence it reflects.
    pub fn save(&self, path: &Path, applied_seq: u64) -> Result<()> {
        let mut entries: Vec<KeyMapEntry> = self.iter_active().collect();
        entries.sort_unstable_by_key(|e| e.key);
        let file = KeyMapFile {
            applied_seq,
            entries,
        };
        let bytes = serde_json::to_vec(&file)
            .map_err(|e| StoreError::Corrupt(format!("cannot encode key map: {e}")))?;
        write_atomic(path, &bytes)?;
        Ok(())
    }

    /// Load a table, returning it with the sequence it was saved at.
    pub fn load(path: &Path) -> Result<(Self, u64)> {
        let bytes = fs::read(path)?;
        let file: KeyMapFile = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Corrupt(format!("invalid key map {}: {e}", path.display()))
        })?;

        let mut map = KeyMap::new();
        for entry in file.entries {
            map.assign(entry.key, entry.id).map_err(|e| {
                StoreError::Corrupt(format!("key map {} is not a bijection: {e}", path.display()))
            })?;
        }
        Ok((map, file.applied_seq))
    }
}
