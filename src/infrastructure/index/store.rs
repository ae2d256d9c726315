//! Hybrid retrieval index backed by SQLite.
//!
//! Chunks live in three places sharing one id: the chunk table, an FTS5
//! row over `content`, and a vector row holding the embedding as a
//! little-endian f32 blob. Queries run a vector k-nearest and a sanitised
//! keyword match in parallel and fuse the two lists with reciprocal rank
//! fusion (k=60).
//!
//! Writes are serialised by a process-wide mutex; readers are
//! unconstrained (WAL).

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{Chunk, Document, IndexConfig, SearchHit};
use crate::domain::ports::Embedder;

use super::chunker::Chunker;
use super::embedder::cosine_distance;

/// Rank constant for reciprocal rank fusion.
const RRF_K: f64 = 60.0;

/// Result of an index operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Document was inserted or replaced
    Indexed { chunks: usize },
    /// File hash unchanged; nothing touched
    Unchanged,
}

/// Hybrid vector + keyword retrieval index.
pub struct RetrievalIndex {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    config: IndexConfig,
    // Single-writer discipline; readers go straight to the pool.
    write_lock: Mutex<()>,
}

impl RetrievalIndex {
    /// Open (or create) the index database at `path`.
    pub async fn open(
        path: &Path,
        embedder: Arc<dyn Embedder>,
        config: IndexConfig,
    ) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let url = format!("sqlite:{}", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| EngineError::Database(format!("invalid database path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let index = Self::from_pool(pool, embedder, config);
        index.migrate().await?;
        Ok(index)
    }

    /// In-memory index for tests.
    pub async fn open_in_memory(
        embedder: Arc<dyn Embedder>,
        config: IndexConfig,
    ) -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| EngineError::Database(e.to_string()))?
            .foreign_keys(true);
        // A single immortal connection: the in-memory database lives and
        // dies with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let index = Self::from_pool(pool, embedder, config);
        index.migrate().await?;
        Ok(index)
    }

    fn from_pool(pool: SqlitePool, embedder: Arc<dyn Embedder>, config: IndexConfig) -> Self {
        let chunker = Chunker::new(config.chunk_target_tokens, config.chunk_min_tokens);
        Self {
            pool,
            embedder,
            chunker,
            config,
            write_lock: Mutex::new(()),
        }
    }

    async fn migrate(&self) -> EngineResult<()> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                title TEXT NOT NULL,
                file_hash TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                indexed_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                sequence INTEGER NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                start_offset INTEGER,
                end_offset INTEGER,
                metadata TEXT NOT NULL DEFAULT '{}'
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(chunk_id UNINDEXED, content)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS embeddings (
                chunk_id TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
                vector BLOB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Index a document, replacing any prior version with a different
    /// content hash. Re-indexing with an unchanged hash is a no-op.
    ///
    /// An embedder failure on any chunk fails the whole operation and
    /// leaves the previous version intact.
    pub async fn index_document(
        &self,
        id: &str,
        source: &str,
        title: &str,
        text: &str,
        metadata: HashMap<String, String>,
    ) -> EngineResult<IndexOutcome> {
        let _guard = self.write_lock.lock().await;

        let hash = content_hash(text);
        let existing: Option<(Option<String>,)> =
            sqlx::query_as("SELECT file_hash FROM documents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some((Some(existing_hash),)) = &existing {
            if *existing_hash == hash {
                debug!(document_id = id, "unchanged hash, skipping re-index");
                return Ok(IndexOutcome::Unchanged);
            }
        }

        let chunks = self.chunker.chunk(text, id);

        // Embed everything before touching the database so an embedder
        // error cannot leave a half-indexed document.
        let mut vectors = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let vector = self.embedder.embed(&chunk.content).await.map_err(|e| {
                EngineError::Index(format!("embedder failed for {}: {e}", chunk.id))
            })?;
            vectors.push(vector);
        }

        let mut tx = self.pool.begin().await?;

        // Drop the prior version. FTS rows need an explicit delete; chunk
        // and embedding rows cascade.
        sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO documents (id, source, title, file_hash, metadata, indexed_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(source)
        .bind(title)
        .bind(&hash)
        .bind(serde_json::to_string(&metadata)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for (chunk, vector) in chunks.iter().zip(&vectors) {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, sequence, content, token_count, start_offset, end_offset, metadata)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.sequence as i64)
            .bind(&chunk.content)
            .bind(chunk.token_count as i64)
            .bind(chunk.start_offset.map(|v| v as i64))
            .bind(chunk.end_offset.map(|v| v as i64))
            .bind(serde_json::to_string(&chunk.metadata)?)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, content) VALUES (?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await?;

            sqlx::query("INSERT INTO embeddings (chunk_id, vector) VALUES (?, ?)")
                .bind(&chunk.id)
                .bind(embedding_to_bytes(vector))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(document_id = id, chunks = chunks.len(), "indexed document");
        Ok(IndexOutcome::Indexed {
            chunks: chunks.len(),
        })
    }

    /// Delete a document and everything derived from it.
    pub async fn delete_document(&self, id: &str) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Hybrid search with reciprocal rank fusion.
    ///
    /// Empty, whitespace-only, and punctuation-only queries return `[]`.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        sources: Option<&[String]>,
    ) -> EngineResult<Vec<SearchHit>> {
        self.search_weighted(
            query,
            limit,
            sources,
            self.config.vector_weight,
            self.config.fts_weight,
        )
        .await
    }

    pub async fn search_weighted(
        &self,
        query: &str,
        limit: usize,
        sources: Option<&[String]>,
        vector_weight: f64,
        fts_weight: f64,
    ) -> EngineResult<Vec<SearchHit>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let sanitized = sanitize_fts_query(query);
        if sanitized.is_empty() {
            // Nothing but reserved punctuation survived sanitisation.
            return Ok(Vec::new());
        }

        let fetch = limit * 3;

        // Both sub-searches run concurrently; each fetches 3x the
        // requested limit so fusion has candidates to work with.
        let (vector_ranks, fts_ranks) = futures::join!(
            self.vector_candidates(query, fetch),
            self.fts_candidates(&sanitized, fetch)
        );

        // Embedder failure degrades to FTS-only; an FTS failure is a real
        // database error.
        let vector_ranks = match vector_ranks {
            Ok(ranks) => Some(ranks),
            Err(e) => {
                warn!(error = %e, "vector search unavailable, falling back to FTS only");
                None
            }
        };
        let fts_ranks = fts_ranks?;

        // Reciprocal rank fusion, 0-based ranks.
        let mut fused: HashMap<String, (f64, Option<f64>, Option<f64>)> = HashMap::new();
        if let Some(ranks) = &vector_ranks {
            for (rank, (chunk_id, similarity)) in ranks.iter().enumerate() {
                let entry = fused.entry(chunk_id.clone()).or_default();
                entry.0 += vector_weight / (RRF_K + rank as f64);
                entry.1 = Some(*similarity);
            }
        }
        for (rank, (chunk_id, score)) in fts_ranks.iter().enumerate() {
            let entry = fused.entry(chunk_id.clone()).or_default();
            entry.0 += fts_weight / (RRF_K + rank as f64);
            entry.2 = Some(*score);
        }

        let mut scored: Vec<(String, f64, Option<f64>, Option<f64>)> = fused
            .into_iter()
            .map(|(id, (score, vec_score, fts_score))| (id, score, vec_score, fts_score))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut hits = Vec::new();
        for (chunk_id, score, vector_score, fts_score) in scored {
            if hits.len() >= limit {
                break;
            }
            let Some((chunk, document)) = self.load_chunk(&chunk_id).await? else {
                continue;
            };
            if let Some(sources) = sources {
                if !sources.iter().any(|s| *s == document.source) {
                    continue;
                }
            }
            hits.push(SearchHit {
                chunk,
                document,
                score,
                vector_score,
                fts_score,
            });
        }
        Ok(hits)
    }

    /// Vector k-nearest: (chunk_id, similarity) best-first.
    async fn vector_candidates(
        &self,
        query: &str,
        fetch: usize,
    ) -> EngineResult<Vec<(String, f64)>> {
        let query_vector = self.embedder.embed(query).await?;

        let rows = sqlx::query("SELECT chunk_id, vector FROM embeddings")
            .fetch_all(&self.pool)
            .await?;

        let mut distances: Vec<(String, f32)> = rows
            .iter()
            .filter_map(|row| {
                let chunk_id: String = row.get("chunk_id");
                let blob: Vec<u8> = row.get("vector");
                bytes_to_embedding(&blob)
                    .ok()
                    .map(|v| (chunk_id, cosine_distance(&query_vector, &v)))
            })
            .collect();
        distances.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        distances.truncate(fetch);

        Ok(distances
            .into_iter()
            .map(|(id, distance)| (id, 1.0 / (1.0 + f64::from(distance))))
            .collect())
    }

    /// FTS match: (chunk_id, |rank|) best-first.
    async fn fts_candidates(
        &self,
        sanitized: &str,
        fetch: usize,
    ) -> EngineResult<Vec<(String, f64)>> {
        let rows = sqlx::query(
            "SELECT chunk_id, rank FROM chunks_fts WHERE chunks_fts MATCH ? ORDER BY rank LIMIT ?",
        )
        .bind(sanitized)
        .bind(fetch as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let chunk_id: String = row.get("chunk_id");
                let rank: f64 = row.get("rank");
                (chunk_id, rank.abs())
            })
            .collect())
    }

    async fn load_chunk(&self, chunk_id: &str) -> EngineResult<Option<(Chunk, Document)>> {
        let row = sqlx::query(
            r"SELECT c.id, c.document_id, c.sequence, c.content, c.token_count,
                     c.start_offset, c.end_offset, c.metadata,
                     d.source, d.title, d.file_hash, d.metadata AS doc_metadata, d.indexed_at
              FROM chunks c JOIN documents d ON c.document_id = d.id
              WHERE c.id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let chunk = Chunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            sequence: row.get::<i64, _>("sequence") as usize,
            content: row.get("content"),
            token_count: row.get::<i64, _>("token_count") as usize,
            start_offset: row
                .get::<Option<i64>, _>("start_offset")
                .map(|v| v as usize),
            end_offset: row.get::<Option<i64>, _>("end_offset").map(|v| v as usize),
            metadata: serde_json::from_str(&row.get::<String, _>("metadata")).unwrap_or_default(),
        };
        let document = Document {
            id: chunk.document_id.clone(),
            source: row.get("source"),
            title: row.get("title"),
            file_hash: row.get("file_hash"),
            metadata: serde_json::from_str(&row.get::<String, _>("doc_metadata"))
                .unwrap_or_default(),
            indexed_at: row
                .get::<String, _>("indexed_at")
                .parse()
                .unwrap_or_else(|_| Utc::now()),
        };
        Ok(Some((chunk, document)))
    }

    pub async fn document_count(&self) -> EngineResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn chunk_count(&self) -> EngineResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Rowids of a document's chunk rows, for idempotence checks.
    pub async fn chunk_rowids(&self, document_id: &str) -> EngineResult<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT rowid FROM chunks WHERE document_id = ? ORDER BY sequence")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

/// Strip FTS-reserved characters and reduce the query to a
/// whitespace-joined token list, each token quoted so the remaining text
/// can never parse as FTS syntax.
pub fn sanitize_fts_query(query: &str) -> String {
    const RESERVED: &[char] = &[
        '"', '\'', '(', ')', '[', ']', '{', '}', '<', '>', ':', '/', '@', '*', '-',
    ];

    let cleaned: String = query
        .chars()
        .map(|c| if RESERVED.contains(&c) { ' ' } else { c })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|term| term.chars().any(char::is_alphanumeric))
        .map(|term| format!("\"{term}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> EngineResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(EngineError::Index(
            "invalid embedding blob length".to_string(),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Deterministic content hash for idempotent re-indexing.
pub fn content_hash(text: &str) -> String {
    // Two FNV passes with different seeds, concatenated.
    const OFFSET_A: u64 = 0xcbf2_9ce4_8422_2325;
    const OFFSET_B: u64 = 0x6c62_272e_07bb_0142;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut a = OFFSET_A;
    let mut b = OFFSET_B;
    for byte in text.as_bytes() {
        a ^= u64::from(*byte);
        a = a.wrapping_mul(PRIME);
        b = b.wrapping_mul(PRIME);
        b ^= u64::from(*byte);
    }
    format!("{a:016x}{b:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_removes_reserved_characters() {
        let sanitized = sanitize_fts_query(r#"fix "app" (urgent): src/main.rs @v2 *-now"#);
        // Strip our own token quoting before checking for survivors.
        let inner = sanitized.replace('"', "");
        for c in ['\'', '(', ')', '[', ']', '{', '}', '<', '>', ':', '/', '@', '*', '-'] {
            assert!(!inner.contains(c), "{c} survived in {sanitized}");
        }
        assert!(inner.contains("fix"));
        assert!(inner.contains("urgent"));
        assert!(inner.contains("main.rs"));
    }

    #[test]
    fn test_sanitize_punctuation_only_is_empty() {
        assert_eq!(sanitize_fts_query("@#$%"), "");
        assert_eq!(sanitize_fts_query("()[]{}:-*/@"), "");
        assert_eq!(sanitize_fts_query("   "), "");
        assert_eq!(sanitize_fts_query(""), "");
    }

    #[test]
    fn test_sanitize_quotes_tokens() {
        assert_eq!(sanitize_fts_query("zod validation"), "\"zod\" \"validation\"");
    }

    #[test]
    fn test_embedding_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0];
        let bytes = embedding_to_bytes(&v);
        assert_eq!(bytes_to_embedding(&bytes).unwrap(), v);
        assert!(bytes_to_embedding(&bytes[..5]).is_err());
    }

    #[test]
    fn test_content_hash_changes_with_content() {
        let a = content_hash("hello");
        let b = content_hash("hello!");
        assert_ne!(a, b);
        assert_eq!(a, content_hash("hello"));
        assert_eq!(a.len(), 32);
    }
}
