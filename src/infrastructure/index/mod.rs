//! Hybrid retrieval index: chunking, embedding, and SQLite-backed storage
//! with FTS5 + vector search fused by reciprocal rank.

pub mod chunker;
pub mod embedder;
pub mod store;

pub use chunker::{approx_tokens, Chunker};
pub use embedder::{cosine_distance, HashEmbedder};
pub use store::{content_hash, sanitize_fts_query, IndexOutcome, RetrievalIndex};
