//! HNSW Index Implementation
//!
//! The core HNSW algorithm with:
//! - Random layer assignment (exponential distribution)
//! - Diversity-preserving neighbor selection heuristic
//! - Greedy beam search with bitset visited tracking
//! - Tombstoned removal with over-fetch at query time
//!
//! # Algorithm Overview
//!
//! **Insert**: Append the vector, assign random layer L, search top-down from
//! the entry point to L, then wire connections on all layers from L down to 0.
//!
//! **Search**: Start at entry point, greedy descent to layer 0, then beam search
//! on layer 0 with ef candidates. Tombstoned nodes are walked through but
//! dropped before the top k are taken.
//!
//! The graph owns its vectors in one flat buffer so a clone is a complete,
//! independent copy that can be mutated while readers keep using the original.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::node::Node;
use super::visited::VisitedSet;
use super::HnswError;
use crate::distance::l2_distance_squared;

/// Cap on the random layer so serialized layer counts fit in a byte
const MAX_LEVEL: usize = 16;

/// Candidate for search (min-heap)
#[derive(Clone, Copy)]
struct Candidate {
    id: usize,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: smaller distance = higher priority
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Result from search (max-heap keeps the current worst on top)
#[derive(Clone, Copy)]
struct SearchResult {
    id: usize,
    distance: f32,
}

impl PartialEq for SearchResult {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SearchResult {}

impl Ord for SearchResult {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for SearchResult {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn by_distance(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    a.1.partial_cmp(&b.1)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.0.cmp(&b.0))
}

/// HNSW Index
#[derive(Clone)]
pub struct Hnsw {
    /// Adjacency, indexed by node id
    pub nodes: Vec<Node>,

    /// Row-major vector data, `dim` floats per node
    vectors: Vec<f32>,

    /// Tombstone flags, indexed by node id
    deleted: Vec<bool>,

    tombstones: usize,

    /// Entry point node id (a node on the highest layer)
    pub entry_point: Option<usize>,

    /// Maximum layer currently in the graph
    pub max_layer: usize,

    pub dim: usize,

    /// Max neighbors per layer (M)
    pub m: usize,

    /// Max neighbors for layer 0 (2*M)
    pub m0: usize,

    /// Level multiplier for random layer assignment (1/ln(M))
    pub ml: f64,

    /// Search depth during construction
    pub ef_construction: usize,

    rng: StdRng,
}

impl Hnsw {
    /// Create an empty graph
    ///
    /// # Parameters
    /// - `dim`: Vector dimensionality, fixed for the graph's lifetime
    /// - `m`: Max neighbors per layer (typically 12-48)
    /// - `ef_construction`: Search depth during build (typically 100-200)
    pub fn new(dim: usize, m: usize, ef_construction: usize) -> Self {
        Self::new_with_seed(dim, m, ef_construction, rand::random())
    }

    /// Create an empty graph with a deterministic RNG seed.
    pub fn new_with_seed(dim: usize, m: usize, ef_construction: usize, seed: u64) -> Self {
        let m = m.max(2);
        Self {
            nodes: Vec::new(),
            vectors: Vec::new(),
            deleted: Vec::new(),
            tombstones: 0,
            entry_point: None,
            max_layer: 0,
            dim,
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction: ef_construction.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reassemble a graph from persisted parts (used by deserialization)
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        dim: usize,
        nodes: Vec<Node>,
        vectors: Vec<f32>,
        deleted: Vec<bool>,
        entry_point: Option<usize>,
        max_layer: usize,
        m: usize,
        m0: usize,
        ef_construction: usize,
    ) -> Self {
        let tombstones = deleted.iter().filter(|&&d| d).count();
        Self {
            nodes,
            vectors,
            deleted,
            tombstones,
            entry_point,
            max_layer,
            dim,
            m,
            m0,
            ml: 1.0 / (m.max(2) as f64).ln(),
            ef_construction,
            rng: StdRng::seed_from_u64(rand::random()),
        }
    }

    /// Number of nodes ever inserted, tombstoned ones included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn live_len(&self) -> usize {
        self.nodes.len() - self.tombstones
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    pub fn is_deleted(&self, id: usize) -> bool {
        self.deleted.get(id).copied().unwrap_or(false)
    }

    /// Stored vector for a node id, tombstoned or not
    pub fn vector(&self, id: usize) -> Option<&[f32]> {
        if id < self.nodes.len() {
            Some(self.vec_of(id))
        } else {
            None
        }
    }

    /// Ids of nodes that have not been removed, ascending
    pub fn live_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.deleted
            .iter()
            .enumerate()
            .filter(|&(_, &deleted)| !deleted)
            .map(|(id, _)| id)
    }

    pub(crate) fn flat_vectors(&self) -> &[f32] {
        &self.vectors
    }

    pub(crate) fn deleted_flags(&self) -> &[bool] {
        &self.deleted
    }

    #[inline]
    fn vec_of(&self, id: usize) -> &[f32] {
        &self.vectors[id * self.dim..(id + 1) * self.dim]
    }

    /// Squared L2 between the query and a node
    #[inline]
    fn distance(&self, query: &[f32], node_id: usize) -> f32 {
        l2_distance_squared(query, self.vec_of(node_id))
    }

    fn random_layer(&mut self) -> usize {
        let r: f64 = self.rng.gen();
        let level = (-r.ln() * self.ml).floor();
        if level.is_finite() {
            (level as usize).min(MAX_LEVEL)
        } else {
            MAX_LEVEL
        }
    }

    /// Insert a vector and return the id assigned to it
    ///
    /// Ids are dense and sequential: the returned id is always the previous
    /// `len()`.
    pub fn insert(&mut self, vector: &[f32]) -> Result<usize, HnswError> {
        if vector.len() != self.dim {
            return Err(HnswError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }

        let id = self.nodes.len();
        self.vectors.extend_from_slice(vector);
        self.deleted.push(false);

        let node_layer = self.random_layer();
        let mut node = Node::new(node_layer);

        let Some(entry_point) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_layer = node_layer;
            self.nodes.push(node);
            return Ok(id);
        };

        let query = vector;
        let mut current_node = entry_point;

        // Phase 1: greedy descent from the top layer to node_layer + 1
        for layer in (node_layer + 1..=self.max_layer).rev() {
            let nearest = self.search_layer(query, &[current_node], 1, layer);
            if let Some((nearest_id, _)) = nearest.first() {
                current_node = *nearest_id;
            }
        }

        // Phase 2: wire the node on every layer it shares with the graph
        let start_layer = node_layer.min(self.max_layer);

        // (neighbor_id, layer, id_to_add)
        let mut reverse_edges: Vec<(usize, usize, usize)> = Vec::new();
        // (neighbor_id, layer, replacement adjacency)
        let mut prune_ops: Vec<(usize, usize, Vec<usize>)> = Vec::new();

        for layer in (0..=start_layer).rev() {
            let m_layer = if layer == 0 { self.m0 } else { self.m };

            let candidates =
                self.search_layer(query, &[current_node], self.ef_construction, layer);
            let neighbors = self.select_neighbors(&candidates, m_layer);

            for &(neighbor_id, _) in &neighbors {
                node.add_neighbor(layer, neighbor_id);
                reverse_edges.push((neighbor_id, layer, id));

                let current_neighbors = self.nodes[neighbor_id].neighbors(layer);
                if current_neighbors.len() >= m_layer {
                    let neighbor_vec = self.vec_of(neighbor_id);
                    let pool: Vec<(usize, f32)> = current_neighbors
                        .iter()
                        .copied()
                        .chain(std::iter::once(id))
                        .map(|n| (n, l2_distance_squared(neighbor_vec, self.vec_of(n))))
                        .collect();

                    let pruned = self.select_neighbors(&pool, m_layer);
                    prune_ops.push((
                        neighbor_id,
                        layer,
                        pruned.into_iter().map(|(n, _)| n).collect(),
                    ));
                }
            }

            if let Some((first_id, _)) = candidates.first() {
                current_node = *first_id;
            }
        }

        let prune_targets: HashSet<(usize, usize)> = prune_ops
            .iter()
            .map(|(neighbor_id, layer, _)| (*neighbor_id, *layer))
            .collect();

        for (neighbor_id, layer, new_id) in reverse_edges {
            if !prune_targets.contains(&(neighbor_id, layer)) {
                self.nodes[neighbor_id].add_neighbor(layer, new_id);
            }
        }

        for (neighbor_id, layer, adjacency) in prune_ops {
            self.nodes[neighbor_id].set_neighbors(layer, adjacency);
        }

        if node_layer > self.max_layer {
            self.max_layer = node_layer;
            self.entry_point = Some(id);
        }

        self.nodes.push(node);
        Ok(id)
    }

    /// Tombstone a node
    ///
    /// Returns `Ok(true)` when the node was live, `Ok(false)` when it was
    /// already removed.
    pub fn remove(&mut self, id: usize) -> Result<bool, HnswError> {
        if id >= self.nodes.len() {
            return Err(HnswError::UnknownNode {
                id,
                len: self.nodes.len(),
            });
        }
        if self.deleted[id] {
            return Ok(false);
        }
        self.deleted[id] = true;
        self.tombstones += 1;
        Ok(true)
    }

    /// Greedy beam search on a single layer, `ef` candidates wide.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<(usize, f32)> {
        let mut visited = VisitedSet::with_capacity(self.nodes.len());
        let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<SearchResult> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if visited.visit(ep) {
                let distance = self.distance(query, ep);
                candidates.push(Candidate { id: ep, distance });
                results.push(SearchResult { id: ep, distance });
            }
        }

        while let Some(current) = candidates.pop() {
            if results.len() >= ef && results.peek().is_some_and(|w| current.distance > w.distance)
            {
                break;
            }

            for &neighbor_id in self.nodes[current.id].neighbors(layer) {
                if !visited.visit(neighbor_id) {
                    continue;
                }

                let distance = self.distance(query, neighbor_id);
                let dominated =
                    results.len() >= ef && results.peek().is_some_and(|w| distance > w.distance);
                if !dominated {
                    candidates.push(Candidate {
                        id: neighbor_id,
                        distance,
                    });
                    results.push(SearchResult {
                        id: neighbor_id,
                        distance,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut found: Vec<_> = results.into_iter().map(|r| (r.id, r.distance)).collect();
        found.sort_by(by_distance);
        found
    }

    /// Diversity-preserving neighbor selection
    ///
    /// A candidate is kept only if it is closer to the base point than to any
    /// neighbor already selected; remaining slots are filled by distance.
    fn select_neighbors(&self, candidates: &[(usize, f32)], m: usize) -> Vec<(usize, f32)> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut sorted: Vec<_> = candidates.to_vec();
        sorted.sort_by(by_distance);

        let mut result: Vec<(usize, f32)> = Vec::with_capacity(m);

        for &(candidate_id, candidate_dist) in &sorted {
            if result.len() >= m {
                break;
            }

            let candidate_vec = self.vec_of(candidate_id);
            let is_diverse = result.iter().all(|&(existing_id, _)| {
                l2_distance_squared(candidate_vec, self.vec_of(existing_id)) >= candidate_dist
            });

            if is_diverse {
                result.push((candidate_id, candidate_dist));
            }
        }

        if result.len() < m {
            for &(candidate_id, candidate_dist) in &sorted {
                if result.len() >= m {
                    break;
                }
                if !result.iter().any(|(id, _)| *id == candidate_id) {
                    result.push((candidate_id, candidate_dist));
                }
            }
        }

        result
    }

    /// Search for the k nearest live nodes to a query vector
    ///
    /// # Parameters
    /// - `query`: Query vector, `dim` floats
    /// - `k`: Number of neighbors to return
    /// - `ef`: Search depth (higher = better recall, slower)
    ///
    /// # Returns
    /// `(id, distance)` pairs, L2 distance ascending
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(usize, f32)> {
        if k == 0 || self.live_len() == 0 {
            return Vec::new();
        }
        let Some(entry_point) = self.entry_point else {
            return Vec::new();
        };

        let mut current_node = entry_point;
        for layer in (1..=self.max_layer).rev() {
            let nearest = self.search_layer(query, &[current_node], 1, layer);
            if let Some((nearest_id, _)) = nearest.first() {
                current_node = *nearest_id;
            }
        }

        // Tombstones occupy beam slots, so over-fetch once any exist
        let mut beam = ef.max(k);
        if self.tombstones > 0 {
            beam = (beam * 2).max(k * 4);
        }

        self.search_layer(query, &[current_node], beam, 0)
            .into_iter()
            .filter(|(id, _)| !self.deleted[*id])
            .take(k)
            .map(|(id, dist)| (id, dist.sqrt()))
            .collect()
    }

    pub fn stats(&self) -> HnswStats {
        let mut layer_counts = vec![0usize; self.max_layer + 1];
        let mut total_edges = 0;

        for node in &self.nodes {
            for (layer, neighbors) in node.layers.iter().enumerate() {
                if let Some(count) = layer_counts.get_mut(layer) {
                    *count += 1;
                }
                total_edges += neighbors.len();
            }
        }

        HnswStats {
            num_nodes: self.nodes.len(),
            live_nodes: self.live_len(),
            tombstones: self.tombstones,
            max_layer: self.max_layer,
            layer_counts,
            total_edges,
            m: self.m,
            ef_construction: self.ef_construction,
        }
    }
}

/// Statistics about the graph
#[derive(Debug, Clone, Serialize)]
pub struct HnswStats {
    pub num_nodes: usize,
    pub live_nodes: usize,
    pub tombstones: usize,
    pub max_layer: usize,
    pub layer_counts: Vec<usize>,
    pub total_edges: usize,
    pub m: usize,
    pub ef_construction: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_vectors(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect())
            .collect()
    }

    fn build(vectors: &[Vec<f32>], m: usize, ef_construction: usize) -> Hnsw {
        let mut hnsw = Hnsw::new_with_seed(vectors[0].len(), m, ef_construction, 7);
        for v in vectors {
            hnsw.insert(v).unwrap();
        }
        hnsw
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let vectors = random_vectors(20, 8, 1);
        let mut hnsw = Hnsw::new_with_seed(8, 8, 50, 1);
        for (expected, v) in vectors.iter().enumerate() {
            assert_eq!(hnsw.insert(v).unwrap(), expected);
        }
        assert_eq!(hnsw.len(), 20);
        assert_eq!(hnsw.vector(3).unwrap(), vectors[3].as_slice());
        assert!(hnsw.vector(20).is_none());
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut hnsw = Hnsw::new(4, 8, 50);
        assert_eq!(
            hnsw.insert(&[1.0, 2.0]),
            Err(HnswError::DimensionMismatch {
                expected: 4,
                actual: 2
            })
        );
        assert!(hnsw.is_empty());
    }

    #[test]
    fn test_search_finds_exact_match() {
        let vectors = random_vectors(200, 32, 2);
        let hnsw = build(&vectors, 16, 100);

        let results = hnsw.search(&vectors[42], 5, 50);
        assert_eq!(results[0].0, 42);
        assert!(results[0].1.abs() < 1e-6);
        assert!(results.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_recall() {
        let vectors = random_vectors(600, 32, 3);
        let hnsw = build(&vectors, 16, 100);
        let queries = random_vectors(10, 32, 4);
        let k = 10;

        let mut total_recall = 0.0;
        for query in &queries {
            let mut truth: Vec<(usize, f32)> = vectors
                .iter()
                .enumerate()
                .map(|(id, v)| (id, l2_distance_squared(query, v)))
                .collect();
            truth.sort_by(by_distance);
            let truth: HashSet<usize> = truth.iter().take(k).map(|(id, _)| *id).collect();

            let found: HashSet<usize> = hnsw.search(query, k, 64).iter().map(|(id, _)| *id).collect();
            total_recall += truth.intersection(&found).count() as f64 / k as f64;
        }

        let avg = total_recall / queries.len() as f64;
        assert!(avg > 0.8, "recall should be > 80%, got {:.2}%", avg * 100.0);
    }

    #[test]
    fn test_search_empty_and_k_zero() {
        let hnsw = Hnsw::new(4, 8, 50);
        assert!(hnsw.search(&[0.0; 4], 5, 50).is_empty());

        let vectors = random_vectors(10, 4, 5);
        let hnsw = build(&vectors, 8, 50);
        assert!(hnsw.search(&vectors[0], 0, 50).is_empty());
    }

    #[test]
    fn test_search_k_greater_than_count() {
        let vectors = random_vectors(10, 16, 6);
        let hnsw = build(&vectors, 8, 50);
        assert_eq!(hnsw.search(&vectors[1], 100, 50).len(), 10);
    }

    #[test]
    fn test_removed_nodes_never_returned() {
        let vectors = random_vectors(50, 8, 8);
        let mut hnsw = build(&vectors, 8, 50);

        assert_eq!(hnsw.remove(7), Ok(true));
        assert_eq!(hnsw.remove(7), Ok(false));
        assert_eq!(
            hnsw.remove(50),
            Err(HnswError::UnknownNode { id: 50, len: 50 })
        );
        assert_eq!(hnsw.tombstones(), 1);
        assert_eq!(hnsw.live_len(), 49);

        let results = hnsw.search(&vectors[7], 49, 50);
        assert!(results.iter().all(|(id, _)| *id != 7));
        assert!(hnsw.live_ids().all(|id| id != 7));
    }

    #[test]
    fn test_all_removed_returns_nothing() {
        let vectors = random_vectors(5, 4, 9);
        let mut hnsw = build(&vectors, 8, 50);
        for id in 0..5 {
            hnsw.remove(id).unwrap();
        }
        assert!(hnsw.search(&vectors[0], 3, 50).is_empty());
    }

    #[test]
    fn test_clone_is_independent() {
        let vectors = random_vectors(10, 4, 10);
        let original = build(&vectors, 8, 50);
        let mut copy = original.clone();
        copy.insert(&[0.0; 4]).unwrap();
        copy.remove(0).unwrap();

        assert_eq!(original.len(), 10);
        assert!(!original.is_deleted(0));
        assert_eq!(copy.len(), 11);
    }

    #[test]
    fn test_stats() {
        let vectors = random_vectors(40, 8, 12);
        let mut hnsw = build(&vectors, 8, 50);
        hnsw.remove(3).unwrap();
        let stats = hnsw.stats();
        assert_eq!(stats.num_nodes, 40);
        assert_eq!(stats.live_nodes, 39);
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.layer_counts[0], 40);
        assert!(stats.total_edges > 0);
    }
}
