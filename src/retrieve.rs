//! Semantic retrieval over a user's documents.
//!
//! Every query loads all of the user's chunk vectors, embeds the query with
//! the same provider used at ingestion, and ranks by cosine similarity.
//! There is no index; cost is linear in the number of stored chunks.

use anyhow::Context;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use tracing::debug;

use crate::auth;
use crate::config::Config;
use crate::db;
use crate::embedding::{self, blob_to_vec, cosine_similarity, Embedder};
use crate::error::Result;
use crate::models::{ChunkMetadata, RetrievedChunk};

/// A stored chunk with its vector, as loaded for ranking.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub embedding: Vec<f32>,
}

/// Load every chunk and vector belonging to `user_id`, grouped by document
/// in ingestion order.
pub async fn load_user_embeddings(pool: &SqlitePool, user_id: i64) -> Result<Vec<StoredChunk>> {
    let rows = sqlx::query(
        r#"
        SELECT c.document_id, d.filename, c.chunk_index, c.text, c.embedding
        FROM chunks c
        JOIN documents d ON d.id = c.document_id
        WHERE d.user_id = ?
        ORDER BY d.processed_at ASC, c.document_id ASC, c.chunk_index ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            StoredChunk {
                content: row.get("text"),
                metadata: ChunkMetadata {
                    document_id: row.get("document_id"),
                    filename: row.get("filename"),
                    chunk_index: row.get("chunk_index"),
                },
                embedding: blob_to_vec(&blob),
            }
        })
        .collect())
}

/// Rank stored chunks against a query vector.
///
/// Sorts by descending similarity, keeps the top `top_k`, then drops any
/// result scoring `<= min_similarity`.
pub fn rank_chunks(
    query_vec: &[f32],
    stored: Vec<StoredChunk>,
    top_k: usize,
    min_similarity: f32,
) -> Vec<RetrievedChunk> {
    let mut scored: Vec<RetrievedChunk> = stored
        .into_iter()
        .map(|chunk| RetrievedChunk {
            similarity: cosine_similarity(query_vec, &chunk.embedding),
            content: chunk.content,
            metadata: chunk.metadata,
        })
        .collect();

    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
    });
    scored.truncate(top_k);
    scored.retain(|r| r.similarity > min_similarity);
    scored
}

/// Find the `top_k` chunks of `user_id`'s documents most similar to `query`.
pub async fn semantic_search(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    user_id: i64,
    query: &str,
    top_k: usize,
    min_similarity: f32,
) -> Result<Vec<RetrievedChunk>> {
    if query.trim().is_empty() || top_k == 0 {
        return Ok(Vec::new());
    }

    let stored = load_user_embeddings(pool, user_id).await?;
    if stored.is_empty() {
        debug!(user_id, "no stored chunks, skipping query embedding");
        return Ok(Vec::new());
    }

    let candidates = stored.len();
    let query_vec = embedder.embed_query(query).await?;
    let results = rank_chunks(&query_vec, stored, top_k, min_similarity);

    debug!(
        user_id,
        candidates,
        returned = results.len(),
        "semantic search complete"
    );
    Ok(results)
}

/// `hca search "<query>" --user <username>`.
pub async fn run_search(
    config: &Config,
    query: &str,
    username: &str,
    top_k: Option<usize>,
) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let user = auth::find_user_by_username(&pool, username)
        .await?
        .with_context(|| format!("no such user: {}", username))?;
    let embedder = embedding::create_embedder(&config.embedding)?;

    let results = semantic_search(
        &pool,
        embedder.as_ref(),
        user.id,
        query,
        top_k.filter(|&k| k > 0).unwrap_or(config.retrieval.top_k),
        config.retrieval.min_similarity,
    )
    .await?;

    if results.is_empty() {
        println!("No results.");
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} (chunk {})",
            i + 1,
            r.similarity,
            r.metadata.filename,
            r.metadata.chunk_index
        );
        let preview: String = r.content.chars().take(160).collect();
        println!("   {}", preview.replace('\n', " "));
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(idx: i64, v: Vec<f32>) -> StoredChunk {
        StoredChunk {
            content: format!("chunk {}", idx),
            metadata: ChunkMetadata {
                document_id: "doc".into(),
                filename: "leaflet.pdf".into(),
                chunk_index: idx,
            },
            embedding: v,
        }
    }

    #[test]
    fn test_rank_sorted_descending() {
        let chunks = vec![
            stored(0, vec![0.5, 0.5]),
            stored(1, vec![1.0, 0.0]),
            stored(2, vec![0.9, 0.1]),
        ];
        let results = rank_chunks(&[1.0, 0.0], chunks, 10, 0.1);
        let order: Vec<i64> = results.iter().map(|r| r.metadata.chunk_index).collect();
        assert_eq!(order, vec![1, 2, 0]);
        for pair in results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[test]
    fn test_rank_drops_low_scores() {
        let chunks = vec![
            stored(0, vec![1.0, 0.0]),
            stored(1, vec![0.0, 1.0]),
            stored(2, vec![-1.0, 0.0]),
            stored(3, vec![0.1, 0.995]), // just under 0.1
        ];
        let results = rank_chunks(&[1.0, 0.0], chunks, 10, 0.1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.chunk_index, 0);
        assert!(results.iter().all(|r| r.similarity > 0.1));
    }

    #[test]
    fn test_rank_respects_top_k() {
        let chunks = (0..20).map(|i| stored(i, vec![1.0, i as f32 * 0.01])).collect();
        let results = rank_chunks(&[1.0, 0.0], chunks, 5, 0.1);
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].metadata.chunk_index, 0);
    }

    #[test]
    fn test_rank_empty() {
        assert!(rank_chunks(&[1.0], Vec::new(), 5, 0.1).is_empty());
    }
}
