//! Engine adapter
//!
//! The store only ever talks to an ANN engine through [`AnnEngine`]. The
//! contract is narrow: ids are assigned by the engine on insert,
//! removal is a tombstone, and nothing touches disk except `persist`.
//!
//! [`HnswEngine`] is the production implementation over the annex-core graph.

use std::path::Path;
use std::sync::Arc;

use annex_core::hnsw::{Hnsw, HnswError};
use annex_core::l2_distance_squared;
use rayon::prelude::*;
use rayon::ThreadPool;
use thiserror::Error;

use crate::config::StoreConfig;
use crate::fsutil::{commit_tmp, sync_dir, tmp_path};

pub const VECTORS_FILE: &str = "vectors.vec";
pub const GRAPH_FILE: &str = "graph.idx";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("graph error: {0}")]
    Graph(#[from] HnswError),

    #[error("engine io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine dimension {found} does not match store dimension {expected}")]
    Dimension { expected: usize, found: usize },

    #[error("query pool: {0}")]
    Pool(String),

    #[error("{0}")]
    Other(String),
}

pub trait AnnEngine: Clone + Send + Sync + 'static {
    /// Fresh, empty index.
    fn build(config: &StoreConfig) -> Result<Self, EngineError>;

    /// Load a persisted index, returning it with the journal sequence it
    /// was persisted at.
    fn open(dir: &Path, config: &StoreConfig) -> Result<(Self, u64), EngineError>;

    /// Add a vector; returns the internal id it was given.
    fn insert(&mut self, vector: &[f32]) -> Result<usize, EngineError>;

    /// Tombstone an id. Removing an already removed id is a no-op.
    fn remove(&mut self, id: usize) -> Result<(), EngineError>;

    fn is_removed(&self, id: usize) -> bool;

    fn vector(&self, id: usize) -> Option<&[f32]>;

    /// k nearest live ids by L2 distance, ascending.
    ///
    /// `epsilon` loosens the search: larger values explore more of the index.
    fn query(
        &self,
        vector: &[f32],
        k: usize,
        epsilon: f32,
    ) -> Result<Vec<(usize, f32)>, EngineError>;

    /// Write the index to `dir`, stamped with `applied_seq`.
    fn persist(&self, dir: &Path, applied_seq: u64) -> Result<(), EngineError>;

    /// Ids ever assigned, removed ones included
    fn len(&self) -> usize;

    fn tombstones(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct HnswEngine {
    graph: Hnsw,
    ef_search: usize,
    pool: Arc<ThreadPool>,
}

fn build_pool(threads: usize) -> Result<Arc<ThreadPool>, EngineError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|idx| format!("annex-query-{idx}"))
        .build()
        .map(Arc::new)
        .map_err(|e| EngineError::Pool(e.to_string()))
}

impl HnswEngine {
    /// Beam width for a query: `max(k, ef_search)` widened by `epsilon`.
    fn beam_width(&self, k: usize, epsilon: f32) -> usize {
        let epsilon = if epsilon.is_finite() {
            epsilon.max(0.0)
        } else {
            0.0
        };
        let base = k.max(self.ef_search);
        // f32 epsilons carry representation error (0.1f32 > 0.1); absorb it
        // before rounding up.
        let widened = (base as f64 * (1.0 + epsilon as f64) - 1e-6).ceil() as usize;
        widened.max(base)
    }

    /// Brute-force scan over live nodes, used when the beam would cover the
    /// whole index anyway.
    fn exact_scan(&self, vector: &[f32], k: usize) -> Vec<(usize, f32)> {
        let live: Vec<usize> = self.graph.live_ids().collect();
        let mut scored: Vec<(usize, f32)> = self.pool.install(|| {
            live.par_iter()
                .filter_map(|&id| {
                    self.graph
                        .vector(id)
                        .map(|v| (id, l2_distance_squared(vector, v)))
                })
                .collect()
        });
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        for hit in &mut scored {
            hit.1 = hit.1.sqrt();
        }
        scored
    }
}

impl AnnEngine for HnswEngine {
    fn build(config: &StoreConfig) -> Result<Self, EngineError> {
        Ok(Self {
            graph: Hnsw::new(config.dim, config.m, config.ef_construction),
            ef_search: config.ef_search,
            pool: build_pool(config.threads)?,
        })
    }

    fn open(dir: &Path, config: &StoreConfig) -> Result<(Self, u64), EngineError> {
        let (graph, applied_seq) = Hnsw::load(dir.join(GRAPH_FILE), dir.join(VECTORS_FILE))?;
        if graph.dim != config.dim {
            return Err(EngineError::Dimension {
                expected: config.dim,
                found: graph.dim,
            });
        }
        let stats = graph.stats();
        tracing::info!(
            "loaded graph from {}: {} nodes ({} removed), {} layers, seq {}",
            dir.display(),
            stats.num_nodes,
            stats.tombstones,
            stats.max_layer + 1,
            applied_seq
        );
        Ok((
            Self {
                graph,
                ef_search: config.ef_search,
                pool: build_pool(config.threads)?,
            },
            applied_seq,
        ))
    }

    fn insert(&mut self, vector: &[f32]) -> Result<usize, EngineError> {
        Ok(self.graph.insert(vector)?)
    }

    fn remove(&mut self, id: usize) -> Result<(), EngineError> {
        self.graph.remove(id)?;
        Ok(())
    }

    fn is_removed(&self, id: usize) -> bool {
        self.graph.is_deleted(id)
    }

    fn vector(&self, id: usize) -> Option<&[f32]> {
        self.graph.vector(id)
    }

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        epsilon: f32,
    ) -> Result<Vec<(usize, f32)>, EngineError> {
        if vector.len() != self.graph.dim {
            return Err(HnswError::DimensionMismatch {
                expected: self.graph.dim,
                actual: vector.len(),
            }
            .into());
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let ef = self.beam_width(k, epsilon);
        if ef >= self.graph.live_len() {
            return Ok(self.exact_scan(vector, k));
        }
        Ok(self.graph.search(vector, k, ef))
    }

    /// Vectors first, then the graph: a crash in between leaves a vector
    /// file with extra rows, which `open` tolerates.
    fn persist(&self, dir: &Path, applied_seq: u64) -> Result<(), EngineError> {
        let vectors_path = dir.join(VECTORS_FILE);
        let vectors_tmp = tmp_path(&vectors_path);
        self.graph.write_vectors(&vectors_tmp, applied_seq)?;
        commit_tmp(&vectors_tmp, &vectors_path)?;

        let graph_path = dir.join(GRAPH_FILE);
        let graph_tmp = tmp_path(&graph_path);
        self.graph.save(&graph_tmp, applied_seq)?;
        commit_tmp(&graph_tmp, &graph_path)?;

        sync_dir(dir)?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.graph.len()
    }

    fn tombstones(&self) -> usize {
        self.graph.tombstones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(dim: usize) -> HnswEngine {
        HnswEngine::build(&StoreConfig::new(dim).with_threads(2)).unwrap()
    }

    #[test]
    fn test_insert_assigns_dense_ids() {
        let mut e = engine(2);
        assert_eq!(e.insert(&[0.0, 0.0]).unwrap(), 0);
        assert_eq!(e.insert(&[1.0, 0.0]).unwrap(), 1);
        assert_eq!(e.len(), 2);
        assert_eq!(e.vector(1), Some(&[1.0f32, 0.0][..]));
    }

    #[test]
    fn test_query_orders_by_l2() {
        let mut e = engine(3);
        e.insert(&[1.0, 0.0, 0.0]).unwrap();
        e.insert(&[0.0, 1.0, 0.0]).unwrap();

        let hits = e.query(&[0.9, 0.1, 0.0], 2, 0.1).unwrap();
        assert_eq!(hits[0].0, 0);
        assert!((hits[0].1 - 0.141_421_36).abs() < 1e-5);
        assert_eq!(hits[1].0, 1);
    }

    #[test]
    fn test_removed_ids_skipped() {
        let mut e = engine(2);
        e.insert(&[0.0, 0.0]).unwrap();
        e.insert(&[1.0, 1.0]).unwrap();
        e.remove(0).unwrap();
        e.remove(0).unwrap();

        assert!(e.is_removed(0));
        assert_eq!(e.tombstones(), 1);
        let hits = e.query(&[0.0, 0.0], 5, 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
        assert!(e.remove(9).is_err());
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let e = engine(3);
        assert!(matches!(
            e.query(&[1.0], 1, 0.0),
            Err(EngineError::Graph(HnswError::DimensionMismatch { .. }))
        ));
    }

    #[test]
    fn test_beam_width() {
        let e = engine(2);
        assert_eq!(e.beam_width(10, 0.0), 50);
        assert_eq!(e.beam_width(10, 0.1), 55);
        assert_eq!(e.beam_width(100, 0.1), 110);
        assert_eq!(e.beam_width(10, 0.3), 65);
        assert_eq!(e.beam_width(10, 0.01), 51);
        assert_eq!(e.beam_width(80, 0.5), 120);
        assert_eq!(e.beam_width(10, f32::NAN), 50);
        assert_eq!(e.beam_width(10, -3.0), 50);
    }

    #[test]
    fn test_graph_search_path_matches_exact_scan() {
        let mut e = HnswEngine::build(&StoreConfig {
            ef_search: 8,
            ..StoreConfig::new(2)
        })
        .unwrap();
        for i in 0..200 {
            let f = i as f32;
            e.insert(&[f, (f * 0.37).sin()]).unwrap();
        }
        let hits = e.query(&[120.2, 0.0], 3, 0.0).unwrap();
        assert_eq!(hits[0].0, 120);
        assert_eq!(hits, e.exact_scan(&[120.2, 0.0], 3));
    }

    #[test]
    fn test_persist_and_open() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(2);
        let mut e = HnswEngine::build(&config).unwrap();
        e.insert(&[0.0, 1.0]).unwrap();
        e.insert(&[1.0, 0.0]).unwrap();
        e.remove(0).unwrap();
        e.persist(dir.path(), 12).unwrap();

        let (opened, seq) = HnswEngine::open(dir.path(), &config).unwrap();
        assert_eq!(seq, 12);
        assert_eq!(opened.len(), 2);
        assert!(opened.is_removed(0));
        assert_eq!(opened.vector(1), Some(&[1.0f32, 0.0][..]));

        assert!(matches!(
            HnswEngine::open(dir.path(), &StoreConfig::new(3)),
            Err(EngineError::Dimension {
                expected: 3,
                found: 2
            })
        ));
    }
}
