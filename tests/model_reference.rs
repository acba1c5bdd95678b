use std::collections::{BTreeMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use annex_db::{Query, Store, StoreConfig, StoreError};

const DIM: usize = 4;
const KEY_SPACE: u64 = 24;

/// What the store should look like: committed state plus journaled ops
#[derive(Default)]
struct ReferenceModel {
    committed: BTreeMap<u64, Vec<f32>>,
    tentative: BTreeMap<u64, Option<Vec<f32>>>,
}

impl ReferenceModel {
    fn is_active(&self, key: u64) -> bool {
        match self.tentative.get(&key) {
            Some(state) => state.is_some(),
            None => self.committed.contains_key(&key),
        }
    }

    fn apply(&mut self) {
        for (key, state) in std::mem::take(&mut self.tentative) {
            match state {
                Some(vector) => {
                    self.committed.insert(key, vector);
                }
                None => {
                    self.committed.remove(&key);
                }
            }
        }
    }

    fn nearest(&self, query: &[f32]) -> Vec<(u64, f32)> {
        let mut scored: Vec<(u64, f32)> = self
            .committed
            .iter()
            .map(|(&key, v)| {
                let d: f32 = v.iter().zip(query).map(|(a, b)| (a - b) * (a - b)).sum();
                (key, d.sqrt())
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored
    }
}

fn random_vector(rng: &mut StdRng) -> Vec<f32> {
    (0..DIM).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect()
}

fn check_against_model(store: &Store, model: &ReferenceModel, rng: &mut StdRng) {
    let entries = store.active_entries();
    let keys: HashSet<u64> = entries.iter().map(|e| e.0).collect();
    let ids: HashSet<usize> = entries.iter().map(|e| e.1).collect();
    assert_eq!(keys.len(), entries.len(), "duplicate key in key map");
    assert_eq!(ids.len(), entries.len(), "internal id mapped twice");
    assert_eq!(keys, model.committed.keys().copied().collect::<HashSet<u64>>());

    for &key in model.committed.keys() {
        let hits = store.search(Query::Key(key), 1, 0.0).unwrap();
        assert_eq!(hits[0].key, key);
        assert!(hits[0].distance.abs() < 1e-6);
    }

    let query = random_vector(rng);
    let expected = model.nearest(&query);
    let hits = store
        .search(Query::Vector(&query), KEY_SPACE as usize, 0.0)
        .unwrap();
    assert_eq!(hits.len(), expected.len());
    for (hit, (key, distance)) in hits.iter().zip(&expected) {
        assert!((hit.distance - distance).abs() < 1e-4);
        if (hit.distance - distance).abs() < 1e-6 {
            assert_eq!(hit.key, *key);
        }
    }
}

#[test]
fn test_random_ops_match_reference_model() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let mut store: Store = Store::create(&path, StoreConfig::new(DIM).with_threads(1)).unwrap();
    let mut model = ReferenceModel::default();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for step in 0..400 {
        let key = rng.gen_range(0..KEY_SPACE);
        match rng.gen_range(0..10) {
            0..=4 => {
                let vector = random_vector(&mut rng);
                let result = store.add_item(key, &vector);
                if model.is_active(key) {
                    assert!(matches!(result, Err(StoreError::DuplicateKey(k)) if k == key));
                } else {
                    result.unwrap();
                    model.tentative.insert(key, Some(vector));
                }
            }
            5..=7 => {
                let result = store.remove_item(key);
                if model.is_active(key) {
                    result.unwrap();
                    model.tentative.insert(key, None);
                } else {
                    assert!(matches!(result, Err(StoreError::UnknownKey(k)) if k == key));
                }
            }
            8 => {
                store.apply().unwrap();
                model.apply();
                check_against_model(&store, &model, &mut rng);
            }
            _ => {
                if step % 3 == 0 {
                    store.compact().unwrap();
                }
                // Reopen keeps both the committed state and the journal
                drop(store);
                store = Store::open_with_threads(&path, 1).unwrap();
            }
        }
    }

    store.apply().unwrap();
    model.apply();
    check_against_model(&store, &model, &mut rng);
    assert_eq!(store.stats().pending, 0);
}
