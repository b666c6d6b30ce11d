//! Per-user chat history.
//!
//! Every answered question is stored with its answer and sources. Reads
//! return the most recent `limit` exchanges in chronological order.

use anyhow::Context;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::auth;
use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::models::{format_ts_iso, ChatMessage, Source};

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

/// Record one exchange. An empty source list is stored as NULL.
pub async fn save_message(
    pool: &SqlitePool,
    user_id: i64,
    message: &str,
    response: &str,
    sources: &[Source],
) -> Result<i64> {
    let sources_json = if sources.is_empty() {
        None
    } else {
        Some(serde_json::to_string(sources)?)
    };

    let result = sqlx::query(
        r#"
        INSERT INTO chat_messages (user_id, message, response, sources, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(message)
    .bind(response)
    .bind(sources_json)
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    debug!(user_id, message_id = id, "chat message saved");
    Ok(id)
}

/// The `limit` most recent exchanges for `user_id`, oldest first.
pub async fn get_history(pool: &SqlitePool, user_id: i64, limit: i64) -> Result<Vec<ChatMessage>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT id, message, response, sources, created_at
        FROM chat_messages
        WHERE user_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut messages: Vec<ChatMessage> = rows
        .iter()
        .map(|row| {
            let id: i64 = row.get("id");
            let created_at: i64 = row.get("created_at");
            let raw: Option<String> = row.get("sources");
            ChatMessage {
                id,
                message: row.get("message"),
                response: row.get("response"),
                sources: parse_sources(id, raw.as_deref()),
                created_at: format_ts_iso(created_at),
            }
        })
        .collect();

    messages.reverse();
    Ok(messages)
}

fn parse_sources(message_id: i64, raw: Option<&str>) -> Vec<Source> {
    match raw {
        None => Vec::new(),
        Some(s) => serde_json::from_str(s).unwrap_or_else(|e| {
            warn!(message_id, error = %e, "unreadable sources column");
            Vec::new()
        }),
    }
}

/// Delete every exchange belonging to `user_id`. Returns the number removed.
pub async fn clear_history(pool: &SqlitePool, user_id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM chat_messages WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    let deleted = result.rows_affected();
    info!(user_id, deleted, "chat history cleared");
    Ok(deleted)
}

/// `hca history show --user <username>`.
pub async fn run_history_show(config: &Config, username: &str, limit: i64) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let user = auth::find_user_by_username(&pool, username)
        .await?
        .with_context(|| format!("no such user: {}", username))?;

    let messages = get_history(&pool, user.id, limit).await?;
    if messages.is_empty() {
        println!("No chat history.");
    }
    for m in &messages {
        println!("[{}] Q: {}", m.created_at, m.message);
        println!("    A: {}", m.response);
        for s in &m.sources {
            println!("       - {} ({:.3})", s.filename, s.similarity);
        }
    }

    pool.close().await;
    Ok(())
}

/// `hca history clear --user <username>`.
pub async fn run_history_clear(config: &Config, username: &str) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let user = auth::find_user_by_username(&pool, username)
        .await?
        .with_context(|| format!("no such user: {}", username))?;

    let deleted = clear_history(&pool, user.id).await?;
    println!("Deleted {} messages", deleted);

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::register_user;
    use crate::migrate::apply_schema;
    use crate::models::NewUser;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use tempfile::TempDir;

    async fn test_pool() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(tmp.path().join("history.sqlite"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        (tmp, pool)
    }

    async fn user(pool: &SqlitePool, name: &str) -> i64 {
        let new_user = NewUser {
            username: name.into(),
            email: format!("{}@example.com", name),
            full_name: String::new(),
            password: "pw".into(),
        };
        register_user(pool, &new_user, 1_000).await.unwrap().id
    }

    fn source(filename: &str) -> Source {
        Source {
            filename: filename.into(),
            similarity: 0.75,
            content_preview: "Take with food....".into(),
        }
    }

    #[tokio::test]
    async fn test_history_is_chronological() {
        let (_tmp, pool) = test_pool().await;
        let alice = user(&pool, "alice").await;

        for q in ["M1", "M2", "M3"] {
            save_message(&pool, alice, q, "answer", &[]).await.unwrap();
        }

        let all = get_history(&pool, alice, 50).await.unwrap();
        let order: Vec<&str> = all.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(order, vec!["M1", "M2", "M3"]);

        let recent = get_history(&pool, alice, 2).await.unwrap();
        let order: Vec<&str> = recent.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(order, vec!["M2", "M3"]);
    }

    #[tokio::test]
    async fn test_sources_roundtrip() {
        let (_tmp, pool) = test_pool().await;
        let alice = user(&pool, "alice").await;

        save_message(&pool, alice, "with", "a", &[source("leaflet.pdf")])
            .await
            .unwrap();
        save_message(&pool, alice, "without", "b", &[]).await.unwrap();

        let raw: Vec<Option<String>> =
            sqlx::query_scalar("SELECT sources FROM chat_messages ORDER BY id")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert!(raw[0].is_some());
        assert!(raw[1].is_none());

        let history = get_history(&pool, alice, 10).await.unwrap();
        assert_eq!(history[0].sources, vec![source("leaflet.pdf")]);
        assert!(history[1].sources.is_empty());
    }

    #[tokio::test]
    async fn test_clear_only_affects_owner() {
        let (_tmp, pool) = test_pool().await;
        let alice = user(&pool, "alice").await;
        let bob = user(&pool, "bob").await;

        save_message(&pool, alice, "a1", "x", &[]).await.unwrap();
        save_message(&pool, alice, "a2", "x", &[]).await.unwrap();
        save_message(&pool, bob, "b1", "x", &[]).await.unwrap();

        assert_eq!(clear_history(&pool, alice).await.unwrap(), 2);
        assert!(get_history(&pool, alice, 50).await.unwrap().is_empty());
        assert_eq!(get_history(&pool, bob, 50).await.unwrap().len(), 1);

        assert_eq!(clear_history(&pool, alice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_limit_is_empty() {
        let (_tmp, pool) = test_pool().await;
        let alice = user(&pool, "alice").await;
        save_message(&pool, alice, "q", "a", &[]).await.unwrap();
        assert!(get_history(&pool, alice, 0).await.unwrap().is_empty());
    }
}
