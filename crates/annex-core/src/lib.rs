//! Annex Core – vector files, distance kernels, the HNSW graph and the payload codec
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    HNSW Indexing Engine                     │
//! │      append-only node ids · tombstoned removal · L2        │
//! ├─────────────────────────────────────────────────────────────┤
//! │          VectorFile (mmap zero-copy .vec reader)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │     codec: {"features": [...]} journal payload records     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod distance;
pub mod format;
pub mod hnsw;
pub mod vectors;

pub use codec::{decode_features, encode_features, CodecError, Features};
pub use distance::{l2_distance, l2_distance_squared};
pub use format::{VecHeader, VecWriter};
pub use hnsw::Hnsw;
pub use vectors::VectorFile;
