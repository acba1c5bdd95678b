//! HNSW (Hierarchical Navigable Small World) graph
//!
//! A multi-layer graph for approximate nearest neighbor search under L2
//! distance. Node ids are dense and append-only: the n-th inserted vector
//! gets id `n` and keeps it forever. Removal tombstones a node; it stays
//! traversable as a routing hub but never appears in results.
//!
//! ```text
//! Layer 2: ●───────────────────● (few nodes, long-range)
//!          │                   │
//! Layer 1: ●───○───●───○───────● (more nodes)
//!          │   │   │   │       │
//! Layer 0: ●─●─●─●─✕─●─●─●─●─●─● (all nodes, ✕ = tombstoned)
//! ```

mod index;
mod node;
mod serialize;
mod visited;

use thiserror::Error;

pub use index::{Hnsw, HnswStats};
pub use node::Node;
pub use visited::VisitedSet;

#[derive(Error, Debug, PartialEq)]
pub enum HnswError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Unknown node id {id} (graph has {len} nodes)")]
    UnknownNode { id: usize, len: usize },
}
