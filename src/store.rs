//! Store facade: KeyMap + BinLog + engine
//!
//! # Concurrency Model
//!
//! - **Mutations** (`add_item`, `remove_item`) validate against the tentative
//!   key view and append to the journal under one `parking_lot::Mutex`.
//!   They never wait for an apply.
//! - **Apply** holds `apply_lock`, forks the published snapshot (KeyMap +
//!   engine), drains the journal into the fork, persists it and publishes it
//!   with `ArcSwap::store`.
//! - **Search** loads the current snapshot and never takes a lock, so it sees
//!   either the state before an apply or after it, never a mix.
//!
//! # Durability
//!
//! Persist order is engine -> KeyMap -> cursor. Each of the first two is
//! stamped with the sequence it reflects; on open the KeyMap's stamp is the
//! effective cursor.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use annex_core::{decode_features, encode_features};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::binlog::{BinLog, LogEntry, OpKind};
use crate::config::{StoreConfig, StoreManifest};
use crate::engine::{AnnEngine, HnswEngine};
use crate::error::{Result, StoreError};
use crate::keymap::{KeyMap, KEYMAP_FILE};

/// Search input: an active key, or a raw vector
#[derive(Debug, Clone, Copy)]
pub enum Query<'a> {
    Key(u64),
    Vector(&'a [f32]),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub key: u64,
    pub distance: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Entries that changed the index
    pub applied: u64,
    /// Entries already reflected in the index (replays)
    pub skipped: u64,
    /// Cursor after this apply
    pub cursor: u64,
    /// Stopped early because cancellation was requested
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub dim: usize,
    pub active_keys: usize,
    pub engine_nodes: usize,
    pub tombstones: usize,
    pub cursor: u64,
    pub last_seq: u64,
    pub pending: u64,
}

/// Committed state readers search against
struct Snapshot<E> {
    keymap: KeyMap,
    engine: E,
    applied: u64,
}

struct Journal {
    log: BinLog,
    /// Latest journaled op per key not yet applied: (seq, active afterwards)
    tentative: HashMap<u64, (u64, bool)>,
}

pub struct Store<E: AnnEngine = HnswEngine> {
    dir: PathBuf,
    config: StoreConfig,
    journal: Mutex<Journal>,
    snapshot: ArcSwap<Snapshot<E>>,
    apply_lock: Mutex<()>,
}

impl<E: AnnEngine> Store<E> {
    /// Create an empty store in `dir`.
    ///
    /// The manifest is written last, so a directory without one is never
    /// mistaken for a complete store.
    pub fn create(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let dir = dir.as_ref();
        if StoreManifest::exists(dir) {
            return Err(StoreError::AlreadyExists(dir.to_path_buf()));
        }
        if config.dim == 0 {
            return Err(StoreError::DimensionMismatch {
                expected: 1,
                actual: 0,
            });
        }
        fs::create_dir_all(dir)?;

        let engine = E::build(&config)?;
        engine.persist(dir, 0)?;
        let keymap = KeyMap::new();
        keymap.save(&dir.join(KEYMAP_FILE), 0)?;
        let log = BinLog::create(dir)?;
        StoreManifest::new(config.clone()).save(dir)?;

        tracing::info!("created store at {} (dim {})", dir.display(), config.dim);
        Ok(Self::assemble(dir, config, keymap, engine, 0, log, HashMap::new()))
    }

    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_threads(dir, crate::config::default_threads())
    }

    /// Open a persisted store, reconciling the KeyMap, engine and cursor.
    pub fn open_with_threads(dir: impl AsRef<Path>, threads: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let config = StoreManifest::load(dir)?.config.with_threads(threads);

        let (keymap, keymap_seq) = KeyMap::load(&dir.join(KEYMAP_FILE))?;
        let (mut engine, engine_seq) = E::open(dir, &config)?;
        if engine_seq < keymap_seq {
            return Err(StoreError::Corrupt(format!(
                "engine reflects seq {engine_seq} but key map reflects seq {keymap_seq}"
            )));
        }

        let mut log = BinLog::open(dir)?;
        if keymap_seq > log.last_seq() || keymap_seq < log.base_seq() {
            return Err(StoreError::Corrupt(format!(
                "key map seq {keymap_seq} outside journal range {}..={}",
                log.base_seq(),
                log.last_seq()
            )));
        }
        if log.cursor() != keymap_seq {
            tracing::warn!(
                "{}: cursor {} disagrees with key map seq {}, resetting cursor",
                dir.display(),
                log.cursor(),
                keymap_seq
            );
            log.commit_cursor(keymap_seq)?;
        }

        // Ids the engine holds past the key map's seq have no owner; replay
        // will insert them again.
        let orphans: Vec<usize> = (0..engine.len())
            .filter(|&id| !engine.is_removed(id) && keymap.reverse(id).is_none())
            .collect();
        if !orphans.is_empty() {
            tracing::warn!(
                "{}: removing {} unmapped engine ids left by an interrupted apply",
                dir.display(),
                orphans.len()
            );
            for id in &orphans {
                engine.remove(*id)?;
            }
            engine.persist(dir, keymap_seq)?;
        }

        let mut tentative = HashMap::new();
        for entry in log.entries(keymap_seq + 1)? {
            let entry = entry?;
            tentative.insert(entry.key, (entry.seq, entry.op == OpKind::Upsert));
        }

        tracing::info!(
            "opened store at {}: {} keys, cursor {}, {} pending",
            dir.display(),
            keymap.active_len(),
            keymap_seq,
            log.pending()
        );
        Ok(Self::assemble(
            dir, config, keymap, engine, keymap_seq, log, tentative,
        ))
    }

    fn assemble(
        dir: &Path,
        config: StoreConfig,
        keymap: KeyMap,
        engine: E,
        applied: u64,
        log: BinLog,
        tentative: HashMap<u64, (u64, bool)>,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            config,
            journal: Mutex::new(Journal { log, tentative }),
            snapshot: ArcSwap::from_pointee(Snapshot {
                keymap,
                engine,
                applied,
            }),
            apply_lock: Mutex::new(()),
        }
    }

    pub fn dim(&self) -> usize {
        self.config.dim
    }

    /// Whether `key` is active once every journaled op is applied.
    fn tentatively_active(&self, journal: &Journal, key: u64) -> bool {
        match journal.tentative.get(&key) {
            Some(&(_, active)) => active,
            None => self.snapshot.load().keymap.contains(key),
        }
    }

    /// Journal an insert. Searchable after the next `apply`.
    pub fn add_item(&self, key: u64, vector: &[f32]) -> Result<u64> {
        if vector.len() != self.config.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.config.dim,
                actual: vector.len(),
            });
        }
        let payload = encode_features(vector)?;

        let mut journal = self.journal.lock();
        if self.tentatively_active(&journal, key) {
            return Err(StoreError::DuplicateKey(key));
        }
        let seq = journal.log.append(key, OpKind::Upsert, &payload)?;
        journal.tentative.insert(key, (seq, true));
        Ok(seq)
    }

    /// Journal a removal. The key stays searchable until the next `apply`.
    pub fn remove_item(&self, key: u64) -> Result<u64> {
        let mut journal = self.journal.lock();
        if !self.tentatively_active(&journal, key) {
            return Err(StoreError::UnknownKey(key));
        }
        let seq = journal.log.append(key, OpKind::Delete, &[])?;
        journal.tentative.insert(key, (seq, false));
        Ok(seq)
    }

    pub fn apply(&self) -> Result<ApplyReport> {
        self.apply_until(&AtomicBool::new(false))
    }

    /// Drain the journal into the index.
    ///
    /// `cancel` is checked before each entry; once set, the entry in hand is
    /// finished, the prefix is persisted and the report comes back with
    /// `cancelled = true`. On a failing entry the prefix before it is
    /// persisted and `ApplyFailed` names the entry.
    pub fn apply_until(&self, cancel: &AtomicBool) -> Result<ApplyReport> {
        let _apply = self.apply_lock.lock();

        let (entries, start) = {
            let journal = self.journal.lock();
            let cursor = journal.log.cursor();
            if journal.log.pending() == 0 {
                return Ok(ApplyReport {
                    cursor,
                    ..ApplyReport::default()
                });
            }
            (journal.log.entries(cursor + 1)?, cursor)
        };

        let current = self.snapshot.load_full();
        let mut keymap = current.keymap.clone();
        let mut engine = current.engine.clone();
        drop(current);

        let mut report = ApplyReport {
            cursor: start,
            ..ApplyReport::default()
        };
        let mut failure = None;

        for item in entries {
            if cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }
            let entry = match item {
                Ok(entry) => entry,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            match apply_entry(&mut engine, &mut keymap, &entry, self.config.dim) {
                Ok(true) => report.applied += 1,
                Ok(false) => report.skipped += 1,
                Err(err) => {
                    tracing::warn!(
                        "{}: apply stopped at seq {} (key {}): {}",
                        self.dir.display(),
                        entry.seq,
                        entry.key,
                        err
                    );
                    failure = Some(StoreError::ApplyFailed {
                        seq: entry.seq,
                        key: entry.key,
                        source: Box::new(err),
                    });
                    break;
                }
            }
            report.cursor = entry.seq;
        }

        if report.cursor > start {
            self.commit(keymap, engine, report.cursor)?;
            tracing::info!(
                "{}: applied {} entries ({} replayed), cursor {}",
                self.dir.display(),
                report.applied,
                report.skipped,
                report.cursor
            );
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Persist a drained fork and make it the published snapshot.
    ///
    /// Nothing is published unless all three writes succeed.
    fn commit(&self, keymap: KeyMap, engine: E, applied: u64) -> Result<()> {
        engine.persist(&self.dir, applied)?;
        keymap.save(&self.dir.join(KEYMAP_FILE), applied)?;

        let mut journal = self.journal.lock();
        journal.log.commit_cursor(applied)?;
        self.snapshot.store(Arc::new(Snapshot {
            keymap,
            engine,
            applied,
        }));
        journal.tentative.retain(|_, &mut (seq, _)| seq > applied);
        Ok(())
    }

    /// k nearest active keys to the query, ascending by distance.
    pub fn search(&self, query: Query<'_>, k: usize, epsilon: f32) -> Result<Vec<Neighbor>> {
        let snapshot = self.snapshot.load_full();

        let vector: &[f32] = match query {
            Query::Key(key) => {
                let id = snapshot
                    .keymap
                    .lookup(key)
                    .ok_or(StoreError::UnknownKey(key))?;
                snapshot.engine.vector(id).ok_or_else(|| {
                    StoreError::Corrupt(format!("key {key} maps to missing engine id {id}"))
                })?
            }
            Query::Vector(vector) => {
                if vector.len() != self.config.dim {
                    return Err(StoreError::DimensionMismatch {
                        expected: self.config.dim,
                        actual: vector.len(),
                    });
                }
                vector
            }
        };

        if k == 0 {
            return Ok(Vec::new());
        }

        let hits = snapshot.engine.query(vector, k, epsilon)?;
        Ok(hits
            .into_iter()
            .filter_map(|(id, distance)| {
                snapshot
                    .keymap
                    .reverse(id)
                    .map(|key| Neighbor { key, distance })
            })
            .collect())
    }

    /// Persist the published snapshot and cursor.
    pub fn save(&self) -> Result<()> {
        let _apply = self.apply_lock.lock();
        self.persist_snapshot()
    }

    /// Like [`Store::save`], but returns `Ok(false)` without waiting when an
    /// apply is in flight. The apply persists its own result when it ends.
    pub fn try_save(&self) -> Result<bool> {
        let Some(_apply) = self.apply_lock.try_lock() else {
            return Ok(false);
        };
        self.persist_snapshot()?;
        Ok(true)
    }

    /// Caller holds `apply_lock`.
    fn persist_snapshot(&self) -> Result<()> {
        let snapshot = self.snapshot.load_full();
        snapshot.engine.persist(&self.dir, snapshot.applied)?;
        snapshot
            .keymap
            .save(&self.dir.join(KEYMAP_FILE), snapshot.applied)?;
        self.journal.lock().log.commit_cursor(snapshot.applied)?;
        Ok(())
    }

    /// Drop applied entries from the journal.
    pub fn compact(&self) -> Result<()> {
        let _apply = self.apply_lock.lock();
        let mut journal = self.journal.lock();
        let cursor = journal.log.cursor();
        journal.log.truncate(cursor)
    }

    pub fn stats(&self) -> StoreStats {
        let snapshot = self.snapshot.load();
        let journal = self.journal.lock();
        StoreStats {
            dim: self.config.dim,
            active_keys: snapshot.keymap.active_len(),
            engine_nodes: snapshot.engine.len(),
            tombstones: snapshot.engine.tombstones(),
            cursor: journal.log.cursor(),
            last_seq: journal.log.last_seq(),
            pending: journal.log.pending(),
        }
    }

    /// Active (key, internal id) pairs of the published snapshot
    pub fn active_entries(&self) -> Vec<(u64, usize)> {
        let snapshot = self.snapshot.load();
        let mut entries: Vec<(u64, usize)> = snapshot
            .keymap
            .iter_active()
            .map(|e| (e.key, e.id))
            .collect();
        entries.sort_unstable();
        entries
    }
}

/// Apply one journal entry to a fork.
///
/// Returns `Ok(false)` when the entry is already reflected (crash replay).
/// The KeyMap is only touched after the engine side succeeded.
fn apply_entry<E: AnnEngine>(
    engine: &mut E,
    keymap: &mut KeyMap,
    entry: &LogEntry,
    dim: usize,
) -> Result<bool> {
    match entry.op {
        OpKind::Upsert => {
            let vector = decode_features(&entry.payload)?;
            if vector.len() != dim {
                return Err(StoreError::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
            match keymap.lookup(entry.key) {
                Some(old) if engine.vector(old) == Some(vector.as_slice()) => Ok(false),
                Some(old) => {
                    // No in-place update: insert the new vector, retire the old id
                    let new = engine.insert(&vector)?;
                    if let Err(err) = engine.remove(old) {
                        if let Err(undo) = engine.remove(new) {
                            tracing::error!("could not retire id {new} after failed update: {undo}");
                        }
                        return Err(err.into());
                    }
                    keymap.deactivate(entry.key)?;
                    keymap.assign(entry.key, new)?;
                    Ok(true)
                }
                None => {
                    let id = engine.insert(&vector)?;
                    keymap.assign(entry.key, id)?;
                    Ok(true)
                }
            }
        }
        OpKind::Delete => match keymap.lookup(entry.key) {
            None => Ok(false),
            Some(id) => {
                engine.remove(id)?;
                keymap.deactivate(entry.key)?;
                Ok(true)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dim: usize) -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store: Store =
            Store::create(dir.path().join("db"), StoreConfig::new(dim).with_threads(1)).unwrap();
        (dir, store)
    }

    #[test]
    fn test_add_not_searchable_until_apply() {
        let (_dir, store) = store(2);
        store.add_item(1, &[0.0, 1.0]).unwrap();

        assert!(matches!(
            store.search(Query::Key(1), 1, 0.1),
            Err(StoreError::UnknownKey(1))
        ));
        assert!(store.search(Query::Vector(&[0.0, 1.0]), 1, 0.1).unwrap().is_empty());

        let report = store.apply().unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.cursor, 1);

        let hits = store.search(Query::Key(1), 1, 0.1).unwrap();
        assert_eq!(hits, vec![Neighbor { key: 1, distance: 0.0 }]);
    }

    #[test]
    fn test_duplicate_and_unknown_keys_use_tentative_view() {
        let (_dir, store) = store(2);
        store.add_item(1, &[0.0, 1.0]).unwrap();
        assert!(matches!(
            store.add_item(1, &[1.0, 1.0]),
            Err(StoreError::DuplicateKey(1))
        ));
        store.remove_item(1).unwrap();
        assert!(matches!(store.remove_item(1), Err(StoreError::UnknownKey(1))));
        store.add_item(1, &[1.0, 1.0]).unwrap();
        assert_eq!(store.stats().pending, 3);

        store.apply().unwrap();
        let hits = store.search(Query::Key(1), 1, 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(store.active_entries(), vec![(1, 1)]);
        assert_eq!(store.stats().tombstones, 1);
    }

    #[test]
    fn test_remove_stays_searchable_until_apply() {
        let (_dir, store) = store(2);
        store.add_item(5, &[1.0, 0.0]).unwrap();
        store.apply().unwrap();

        store.remove_item(5).unwrap();
        assert_eq!(store.search(Query::Vector(&[1.0, 0.0]), 1, 0.0).unwrap()[0].key, 5);

        store.apply().unwrap();
        assert!(store.search(Query::Vector(&[1.0, 0.0]), 1, 0.0).unwrap().is_empty());
        assert!(matches!(
            store.search(Query::Key(5), 1, 0.0),
            Err(StoreError::UnknownKey(5))
        ));
    }

    #[test]
    fn test_dimension_mismatch_writes_nothing() {
        let (_dir, store) = store(3);
        assert!(matches!(
            store.add_item(1, &[1.0, 1.0]),
            Err(StoreError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert_eq!(store.stats().last_seq, 0);
        assert!(matches!(
            store.search(Query::Vector(&[1.0]), 1, 0.0),
            Err(StoreError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_non_finite_vector_rejected() {
        let (_dir, store) = store(2);
        let err = store.add_item(1, &[f32::NAN, 0.0]).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.stats().last_seq, 0);
    }

    #[test]
    fn test_replayed_upsert_and_delete_are_skipped() {
        let mut engine = HnswEngine::build(&StoreConfig::new(2).with_threads(1)).unwrap();
        let mut keymap = KeyMap::new();
        let upsert = LogEntry {
            seq: 1,
            key: 4,
            op: OpKind::Upsert,
            payload: encode_features(&[1.0, 2.0]).unwrap(),
        };
        assert!(apply_entry(&mut engine, &mut keymap, &upsert, 2).unwrap());
        assert!(!apply_entry(&mut engine, &mut keymap, &upsert, 2).unwrap());
        assert_eq!(engine.len(), 1);

        let delete = LogEntry {
            seq: 2,
            key: 4,
            op: OpKind::Delete,
            payload: Vec::new(),
        };
        assert!(apply_entry(&mut engine, &mut keymap, &delete, 2).unwrap());
        assert!(!apply_entry(&mut engine, &mut keymap, &delete, 2).unwrap());
        assert_eq!(keymap.active_len(), 0);
    }

    #[test]
    fn test_upsert_of_mapped_key_reinserts() {
        let mut engine = HnswEngine::build(&StoreConfig::new(2).with_threads(1)).unwrap();
        let mut keymap = KeyMap::new();
        let first = LogEntry {
            seq: 1,
            key: 4,
            op: OpKind::Upsert,
            payload: encode_features(&[1.0, 2.0]).unwrap(),
        };
        let second = LogEntry {
            seq: 2,
            payload: encode_features(&[3.0, 4.0]).unwrap(),
            ..first.clone()
        };
        apply_entry(&mut engine, &mut keymap, &first, 2).unwrap();
        assert!(apply_entry(&mut engine, &mut keymap, &second, 2).unwrap());

        assert_eq!(keymap.lookup(4), Some(1));
        assert!(engine.is_removed(0));
        assert_eq!(engine.vector(1), Some(&[3.0f32, 4.0][..]));
    }

    #[test]
    fn test_cancelled_apply_applies_nothing_new() {
        let (_dir, store) = store(2);
        store.add_item(1, &[0.0, 0.0]).unwrap();
        let cancel = AtomicBool::new(true);

        let report = store.apply_until(&cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.applied, 0);
        assert_eq!(report.cursor, 0);
        assert_eq!(store.stats().pending, 1);
    }

    #[test]
    fn test_compact_then_reopen() {
        let (dir, store) = store(2);
        store.add_item(1, &[0.0, 0.0]).unwrap();
        store.add_item(2, &[1.0, 0.0]).unwrap();
        store.apply().unwrap();
        store.add_item(3, &[2.0, 0.0]).unwrap();
        store.compact().unwrap();
        drop(store);

        let store: Store = Store::open_with_threads(dir.path().join("db"), 1).unwrap();
        let stats = store.stats();
        assert_eq!(stats.cursor, 2);
        assert_eq!(stats.last_seq, 3);
        assert_eq!(stats.pending, 1);
        assert!(matches!(store.add_item(3, &[0.0, 0.0]), Err(StoreError::DuplicateKey(3))));

        store.apply().unwrap();
        assert_eq!(store.search(Query::Key(3), 1, 0.0).unwrap()[0].key, 3);
    }

    #[test]
    fn test_create_twice_fails() {
        let (dir, _store) = store(2);
        assert!(matches!(
            Store::<HnswEngine>::create(dir.path().join("db"), StoreConfig::new(2)),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_try_save_skips_while_apply_runs() {
        let (_dir, store) = store(2);
        store.add_item(1, &[0.0, 1.0]).unwrap();

        let held = store.apply_lock.lock();
        assert!(!store.try_save().unwrap());
        drop(held);

        assert!(store.try_save().unwrap());
    }
}
