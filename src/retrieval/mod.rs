//! Retrieval primitives shared by the semantic cache and the tier router:
//! a small explicit vector type, the embedding service that produces it, and
//! the SQLite FTS5-backed BM25 index used for the cache fast-path.

pub mod bm25;
pub mod embeddings;
pub mod vector;

pub use bm25::Bm25Index;
pub use embeddings::EmbeddingService;
pub use vector::Vector;
