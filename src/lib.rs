//! annex-db: a mutable key/vector store over an approximate nearest
//! neighbour index
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP API (axum)                        │
//! │        search by key / vector, features, apply, stats       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  Databases: name -> Arc<Store>
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Store                               │
//! │   add_item / remove_item ──► BinLog (journal + cursor)      │
//! │   apply ──► KeyMap (key <-> id) + AnnEngine                 │
//! │   search ──► published snapshot (ArcSwap)                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 HnswEngine (annex-core HNSW)                │
//! │          graph.idx + vectors.vec, tombstoned removal        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Mutations are durable once journaled and become searchable after the
//! next apply.

pub mod binlog;
pub mod config;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod importer;
pub mod keymap;
pub mod registry;
pub mod server;
pub mod store;

pub use binlog::{BinLog, LogEntry, OpKind};
pub use config::{StoreConfig, StoreManifest};
pub use engine::{AnnEngine, EngineError, HnswEngine};
pub use error::{Result, StoreError};
pub use importer::{importer_for, ImportOptions, ImportReport, Importer};
pub use keymap::KeyMap;
pub use registry::Databases;
pub use store::{ApplyReport, Neighbor, Query, Store, StoreStats};
