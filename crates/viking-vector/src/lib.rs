//! Vector store adapter for the Viking context engine.
//!
//! A nearest-neighbour index keyed by `(uri, source)`. The local store keeps
//! records in memory for cosine search and persists them to JSONL or SQLite;
//! the HTTP store delegates to a remote backend over a small JSON protocol.

pub mod http;
pub mod local;
pub mod types;

pub use http::{HttpVectorConfig, HttpVectorStore};
pub use local::{LocalVectorBackend, LocalVectorStore, VECTOR_STORAGE_ENV};
pub use types::{
    cosine_similarity, Modality, SearchHit, SearchOptions, VectorRecord, VectorSource, VectorStore,
};
