//! Integration tests for the hybrid retrieval index.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use undercity::domain::models::IndexConfig;
use undercity::infrastructure::index::{HashEmbedder, IndexOutcome, RetrievalIndex};

async fn open_index() -> RetrievalIndex {
    RetrievalIndex::open_in_memory(Arc::new(HashEmbedder::default()), IndexConfig::default())
        .await
        .expect("open in-memory index")
}

#[tokio::test]
async fn test_hybrid_fusion_ranks_and_scores() {
    // Seed scenario S5.
    let index = open_index().await;
    index
        .index_document(
            "doc-ts",
            "knowledge",
            "typescript notes",
            "TypeScript Zod validation schemas",
            HashMap::new(),
        )
        .await
        .unwrap();
    index
        .index_document(
            "doc-py",
            "knowledge",
            "python notes",
            "Python pandas data processing",
            HashMap::new(),
        )
        .await
        .unwrap();

    let hits = index.search("Zod validation", 5, None).await.unwrap();
    assert!(!hits.is_empty());

    let top = &hits[0];
    assert_eq!(top.document.id, "doc-ts");
    assert!(top.vector_score.unwrap() > 0.0);
    assert!(top.fts_score.unwrap() > 0.0);

    // Rank 0 in both sub-searches under the default 0.7/0.3 weights.
    let expected = 0.7 / 60.0 + 0.3 / 60.0;
    assert!(
        (top.score - expected).abs() < 1e-9,
        "expected {expected}, got {}",
        top.score
    );

    // The unrelated chunk, if present, ranks strictly below.
    if let Some(other) = hits.iter().find(|h| h.document.id == "doc-py") {
        assert!(other.score < top.score);
        assert!(other.fts_score.is_none());
    }
}

#[tokio::test]
async fn test_degenerate_queries_return_empty() {
    let index = open_index().await;
    index
        .index_document("d", "knowledge", "t", "some indexed content here", HashMap::new())
        .await
        .unwrap();

    assert!(index.search("", 5, None).await.unwrap().is_empty());
    assert!(index.search("   ", 5, None).await.unwrap().is_empty());
    assert!(index.search("@#$%", 5, None).await.unwrap().is_empty());
    assert!(index.search("()[]{}:-*/@", 5, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reserved_characters_do_not_break_queries() {
    let index = open_index().await;
    index
        .index_document(
            "d",
            "knowledge",
            "t",
            "fix the parser in src/main.rs urgently",
            HashMap::new(),
        )
        .await
        .unwrap();

    // Every reserved character mixed into a realistic query.
    let hits = index
        .search(r#"fix "parser" (urgent): src/main.rs @now *-ish [sure] {yes} <ok>"#, 5, None)
        .await
        .unwrap();
    assert!(!hits.is_empty());
}

#[tokio::test]
async fn test_reindex_unchanged_hash_is_noop() {
    // Invariant 10: same content hash leaves row ids untouched.
    let index = open_index().await;
    let text = "First paragraph of knowledge.\n\nSecond paragraph of knowledge.";

    let outcome = index
        .index_document("doc", "knowledge", "t", text, HashMap::new())
        .await
        .unwrap();
    assert!(matches!(outcome, IndexOutcome::Indexed { .. }));
    let rowids_before = index.chunk_rowids("doc").await.unwrap();
    assert!(!rowids_before.is_empty());

    let outcome = index
        .index_document("doc", "knowledge", "t", text, HashMap::new())
        .await
        .unwrap();
    assert_eq!(outcome, IndexOutcome::Unchanged);
    assert_eq!(index.chunk_rowids("doc").await.unwrap(), rowids_before);
}

#[tokio::test]
async fn test_reindex_changed_hash_replaces_rows() {
    let index = open_index().await;
    index
        .index_document("doc", "knowledge", "t", "original content", HashMap::new())
        .await
        .unwrap();
    let before = index.chunk_rowids("doc").await.unwrap();

    index
        .index_document("doc", "knowledge", "t", "completely different content", HashMap::new())
        .await
        .unwrap();
    let after = index.chunk_rowids("doc").await.unwrap();

    assert_ne!(before, after);
    assert_eq!(index.document_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_cascades_to_chunks_and_embeddings() {
    let index = open_index().await;
    index
        .index_document(
            "doc",
            "knowledge",
            "t",
            "para one.\n\npara two.\n\npara three.",
            HashMap::new(),
        )
        .await
        .unwrap();
    assert!(index.chunk_count().await.unwrap() > 0);

    index.delete_document("doc").await.unwrap();
    assert_eq!(index.document_count().await.unwrap(), 0);
    assert_eq!(index.chunk_count().await.unwrap(), 0);

    // FTS rows are gone too: no hits for formerly-indexed words.
    assert!(index.search("para", 5, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_source_filter() {
    let index = open_index().await;
    index
        .index_document("d1", "learnings", "a", "tokio channel backpressure", HashMap::new())
        .await
        .unwrap();
    index
        .index_document("d2", "task-notes", "b", "tokio channel buffering", HashMap::new())
        .await
        .unwrap();

    let all = index.search("tokio channel", 10, None).await.unwrap();
    assert_eq!(all.len(), 2);

    let filtered = index
        .search("tokio channel", 10, Some(&["learnings".to_string()]))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].document.source, "learnings");
}

#[tokio::test]
async fn test_empty_document_stores_no_chunks() {
    let index = open_index().await;
    index
        .index_document("empty", "knowledge", "t", "   \n\n  ", HashMap::new())
        .await
        .unwrap();
    assert_eq!(index.chunk_rowids("empty").await.unwrap().len(), 0);
}
