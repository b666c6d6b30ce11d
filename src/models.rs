//! Core data models used throughout the assistant.
//!
//! These types represent the users, documents, chunks, retrieval results and
//! chat records that flow through ingestion, retrieval and answering.

use serde::{Deserialize, Serialize};

/// A registered account, as stored in SQLite.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub full_name: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub created_at: String,
    pub last_login: Option<String>,
    pub is_active: bool,
}

/// Registration payload.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    pub password: String,
}

/// A chunk of a document's extracted text plus its position.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// One entry of a user's document index.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub document_id: String,
    pub filename: String,
    pub processed_at: String,
    pub chunk_count: i64,
}

/// Where a retrieved chunk came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub filename: String,
    pub chunk_index: i64,
}

/// A chunk ranked against a query.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub similarity: f32,
}

/// Source attribution attached to an answer and persisted with history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub filename: String,
    pub similarity: f32,
    pub content_preview: String,
}

/// A stored question/answer exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: i64,
    pub message: String,
    pub response: String,
    pub sources: Vec<Source>,
    pub created_at: String,
}

/// Format a unix-millisecond timestamp as RFC 3339 (UTC).
pub fn format_ts_iso(ts_millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| ts_millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_ts_iso(1_700_000_000_123), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn test_user_hides_password_hash() {
        let user = User {
            id: 1,
            username: "alice".into(),
            email: "alice@example.com".into(),
            full_name: "Alice".into(),
            hashed_password: "secret-hash".into(),
            created_at: format_ts_iso(0),
            last_login: None,
            is_active: true,
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret-hash"));
        assert!(json.contains("alice@example.com"));
    }
}
