//! Response caching: exact SHA-256 match and cosine-similarity semantic match.

pub mod exact_cache;
pub mod semantic_cache;

pub use exact_cache::ExactCache;
pub use semantic_cache::SemanticCache;
