//! Embedding provider port.

use async_trait::async_trait;

use crate::domain::errors::EngineResult;

/// Text-to-vector function used by the retrieval index.
///
/// Implementations must be deterministic and thread-safe: the same input
/// always yields the same vector, and vectors are unit-length with the
/// provider's declared dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &'static str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}
