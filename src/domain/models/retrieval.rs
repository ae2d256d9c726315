//! Retrieval index domain models.
//!
//! Documents are chunked, embedded, and stored in both a full-text and a
//! vector index; hybrid queries fuse the two result lists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dimension of all stored embeddings.
pub const EMBEDDING_DIM: usize = 384;

/// An indexed source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Source label, e.g. "learnings", "task-notes", "knowledge"
    pub source: String,
    pub title: String,
    /// Content hash used for idempotent re-indexing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub indexed_at: DateTime<Utc>,
}

/// A bounded slice of a document, the unit of retrieval.
///
/// Sequence numbers are dense and 0-based within a document. A chunk's
/// FTS row and its vector row share its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub sequence: usize,
    pub content: String,
    pub token_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_offset: Option<usize>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Chunk {
    pub fn new(
        document_id: impl Into<String>,
        sequence: usize,
        content: impl Into<String>,
        token_count: usize,
    ) -> Self {
        let document_id = document_id.into();
        Self {
            id: format!("{document_id}:chunk:{sequence}"),
            document_id,
            sequence,
            content: content.into(),
            token_count,
            start_offset: None,
            end_offset: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_offsets(mut self, start: usize, end: usize) -> Self {
        self.start_offset = Some(start);
        self.end_offset = Some(end);
        self
    }

    /// First 100 characters, for log lines.
    pub fn preview(&self) -> String {
        let mut preview: String = self.content.chars().take(100).collect();
        if preview.len() < self.content.len() {
            preview.push_str("...");
        }
        preview
    }
}

/// One fused search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub document: Document,
    /// Reciprocal-rank-fusion score
    pub score: f64,
    /// Cosine-derived similarity, absent when the embedder was unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f64>,
    /// Absolute FTS rank score, absent when the chunk had no keyword match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fts_score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_derivation() {
        let chunk = Chunk::new("doc-1", 0, "content", 2);
        assert_eq!(chunk.id, "doc-1:chunk:0");
        assert_eq!(chunk.document_id, "doc-1");
        assert_eq!(chunk.sequence, 0);
    }

    #[test]
    fn test_chunk_preview_truncates() {
        let long = Chunk::new("d", 0, "a".repeat(300), 75);
        assert_eq!(long.preview().len(), 103);

        let short = Chunk::new("d", 1, "short", 2);
        assert_eq!(short.preview(), "short");
    }
}
