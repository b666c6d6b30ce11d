//! Sentence-greedy text chunker.
//!
//! Splits extracted document text into [`Chunk`]s no longer than a target
//! character count. Text is cut into sentence-like segments on `". "` and
//! segments are accumulated greedily until the next one would overflow the
//! target. A single segment longer than the target becomes its own chunk.
//!
//! Each chunk receives a random UUID, its contiguous index within the
//! document, and a SHA-256 hash of its text.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

const SENTENCE_SEPARATOR: &str = ". ";

/// Split text into chunks of at most `chunk_size` characters.
/// Returns chunks with contiguous indices starting at 0; empty or
/// whitespace-only text yields no chunks.
pub fn chunk_text(document_id: &str, text: &str, chunk_size: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for segment in sentence_segments(text) {
        let segment_len = segment.chars().count();
        let would_be = if current.is_empty() {
            segment_len
        } else {
            current_len + 1 + segment_len // +1 for the joining space
        };

        if would_be > chunk_size && !current.is_empty() {
            push_chunk(&mut chunks, document_id, &current);
            current.clear();
            current_len = 0;
        }

        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(&segment);
        current_len += segment_len;
    }

    if !current.is_empty() {
        push_chunk(&mut chunks, document_id, &current);
    }

    chunks
}

/// Cut text on `". "`, giving every segment but the last its period back.
/// Segments are trimmed; empty ones are dropped.
fn sentence_segments(text: &str) -> Vec<String> {
    let pieces: Vec<&str> = text.split(SENTENCE_SEPARATOR).collect();
    let last = pieces.len().saturating_sub(1);

    pieces
        .iter()
        .enumerate()
        .filter_map(|(i, piece)| {
            let trimmed = piece.trim();
            if trimmed.is_empty() {
                return None;
            }
            if i < last {
                Some(format!("{}.", trimmed))
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn push_chunk(chunks: &mut Vec<Chunk>, document_id: &str, text: &str) {
    let index = chunks.len() as i64;
    chunks.push(make_chunk(document_id, index, text.trim()));
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
