//! Document ingestion pipeline.
//!
//! PDF bytes → page text → chunks → embeddings → storage. The document's
//! index row and all of its chunk rows (text plus embedding BLOB) are
//! written in one SQLite transaction, so a user's index never lists a
//! document whose vectors are missing, and vice versa.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::auth;
use crate::chunk::chunk_text;
use crate::config::Config;
use crate::db;
use crate::embedding::{self, vec_to_blob, Embedder};
use crate::error::{Error, Result};
use crate::extract::extract_pdf_text;
use crate::models::{format_ts_iso, DocumentSummary};

/// Result of ingesting one document.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub document_id: String,
    pub filename: String,
    pub chunk_count: usize,
}

/// Extract, chunk, embed and store an uploaded PDF for `user_id`.
///
/// The original bytes are kept under the storage directory, named by the
/// document id, so every upload gets its own file.
pub async fn ingest_pdf(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    config: &Config,
    user_id: i64,
    filename: &str,
    bytes: Vec<u8>,
) -> Result<IngestOutcome> {
    let filename = sanitize_filename(filename);
    info!(user_id, filename = %filename, size = bytes.len(), "processing document");

    // pdf-extract is CPU-bound and may panic on malformed input
    let (bytes, text) = tokio::task::spawn_blocking(move || {
        let text = extract_pdf_text(&bytes);
        (bytes, text)
    })
    .await
    .map_err(|e| Error::Extraction(format!("PDF extraction task failed: {}", e)))?;
    let text = text?;

    let now = Utc::now();
    let document_id = new_document_id(user_id, &filename, now);

    std::fs::create_dir_all(&config.storage.dir)?;
    let file_path = config.storage.dir.join(&document_id);
    tokio::fs::write(&file_path, &bytes).await?;

    let result = store_document(
        pool,
        embedder,
        config.chunking.chunk_size,
        user_id,
        DocumentInfo {
            id: document_id,
            filename: &filename,
            file_path: &file_path,
            processed_at: now,
        },
        &text,
    )
    .await;

    // Document ids are unique, so this only removes the file written above.
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&file_path).await {
            warn!(path = %file_path.display(), error = %e, "failed to remove stored upload");
        }
    }
    result
}

/// Chunk, embed and store already-extracted text.
pub async fn ingest_text(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    chunk_size: usize,
    user_id: i64,
    filename: &str,
    file_path: &Path,
    text: &str,
) -> Result<IngestOutcome> {
    let now = Utc::now();
    let info = DocumentInfo {
        id: new_document_id(user_id, filename, now),
        filename,
        file_path,
        processed_at: now,
    };
    store_document(pool, embedder, chunk_size, user_id, info, text).await
}

/// `user_{id}_{YYYYmmdd_HHMMSS_mmm}_{filename}`.
pub fn new_document_id(user_id: i64, filename: &str, at: DateTime<Utc>) -> String {
    format!(
        "user_{}_{}_{}",
        user_id,
        at.format("%Y%m%d_%H%M%S_%3f"),
        filename
    )
}

struct DocumentInfo<'a> {
    id: String,
    filename: &'a str,
    file_path: &'a Path,
    processed_at: DateTime<Utc>,
}

async fn store_document(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    chunk_size: usize,
    user_id: i64,
    doc: DocumentInfo<'_>,
    text: &str,
) -> Result<IngestOutcome> {
    let chunks = chunk_text(&doc.id, text, chunk_size);
    if chunks.is_empty() {
        return Err(Error::Extraction(format!(
            "no text could be extracted from {}",
            doc.filename
        )));
    }
    debug!(document_id = %doc.id, chunks = chunks.len(), "created chunks");

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder.embed_texts(&texts).await?;
    if vectors.len() != chunks.len() {
        return Err(Error::Embedding(format!(
            "expected {} embeddings, got {}",
            chunks.len(),
            vectors.len()
        )));
    }

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO documents (id, user_id, filename, file_path, processed_at, chunk_count)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&doc.id)
    .bind(user_id)
    .bind(doc.filename)
    .bind(doc.file_path.display().to_string())
    .bind(doc.processed_at.timestamp_millis())
    .bind(chunks.len() as i64)
    .execute(&mut *tx)
    .await?;

    for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, chunk_index, text, hash, dims, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(document_id = %doc.id, chunks = chunks.len(), model = embedder.model_name(), "document processed");

    Ok(IngestOutcome {
        document_id: doc.id,
        filename: doc.filename.to_string(),
        chunk_count: chunks.len(),
    })
}

/// The user's document index, oldest first.
pub async fn list_documents(pool: &SqlitePool, user_id: i64) -> Result<Vec<DocumentSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT id, filename, processed_at, chunk_count
        FROM documents
        WHERE user_id = ?
        ORDER BY processed_at ASC, id ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let processed_at: i64 = row.get("processed_at");
            DocumentSummary {
                document_id: row.get("id"),
                filename: row.get("filename"),
                processed_at: format_ts_iso(processed_at),
                chunk_count: row.get("chunk_count"),
            }
        })
        .collect())
}

/// Keep only the final path component and drop characters that are
/// awkward in file names.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "document.pdf".to_string()
    } else {
        cleaned
    }
}

/// `hca ingest <pdf> --user <username>`.
pub async fn run_ingest(config: &Config, path: &Path, username: &str) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let user = auth::find_user_by_username(&pool, username)
        .await?
        .with_context(|| format!("no such user: {}", username))?;

    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document.pdf".to_string());

    let embedder = embedding::create_embedder(&config.embedding)?;
    let outcome = ingest_pdf(&pool, embedder.as_ref(), config, user.id, &filename, bytes).await?;

    println!("ingest {}", outcome.filename);
    println!("  document id: {}", outcome.document_id);
    println!("  chunks written: {}", outcome.chunk_count);
    println!("ok");

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_format() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(
            new_document_id(7, "leaflet.pdf", at),
            "user_7_20231114_221320_123_leaflet.pdf"
        );
    }

    #[test]
    fn test_sanitize_filename_strips_paths() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\leaflet.pdf"), "leaflet.pdf");
        assert_eq!(sanitize_filename("dose chart (v2).pdf"), "dose chart _v2_.pdf");
        assert_eq!(sanitize_filename(".hidden.pdf"), "hidden.pdf");
        assert_eq!(sanitize_filename(""), "document.pdf");
        assert_eq!(sanitize_filename("../"), "document.pdf");
    }
}
