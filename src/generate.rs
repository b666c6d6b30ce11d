//! Answer generation over retrieved context.
//!
//! [`answer_question`] retrieves the user's most relevant chunks, builds a
//! grounded prompt, and asks the configured [`Generator`] for an answer.
//! "Nothing relevant in your documents" is the [`Answer::NoRelevantContext`]
//! variant; a failing model call is an [`Error::Generation`], never answer
//! text.

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::auth;
use crate::config::{Config, GenerationConfig};
use crate::db;
use crate::embedding::{self, Embedder};
use crate::error::{Error, Result};
use crate::history;
use crate::models::{RetrievedChunk, Source};
use crate::retrieve::semantic_search;

pub const NO_CONTEXT_ANSWER: &str = "I don't have any relevant information in your uploaded \
documents to answer this question. Please upload relevant medical documents first.";

const DISCLAIMER: &str = "Important: This information is for educational purposes only. \
Always consult with healthcare professionals for medical advice, diagnosis, or treatment decisions.";

const PREVIEW_CHARS: usize = 200;

/// Outcome of answering a question.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// The model answered using the listed sources.
    Answered { answer: String, sources: Vec<Source> },
    /// No stored chunk cleared the similarity threshold; the model was not called.
    NoRelevantContext,
}

impl Answer {
    pub fn text(&self) -> &str {
        match self {
            Answer::Answered { answer, .. } => answer.as_str(),
            Answer::NoRelevantContext => NO_CONTEXT_ANSWER,
        }
    }

    pub fn sources(&self) -> &[Source] {
        match self {
            Answer::Answered { sources, .. } => sources.as_slice(),
            Answer::NoRelevantContext => &[],
        }
    }
}

/// A hosted or local text-generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    /// Generate a completion for a single-turn prompt.
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Used when `generation.provider = "disabled"`.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(Error::generation("disabled", "generation provider is disabled"))
    }
}

// ============ Gemini ============

/// Google Gemini `generateContent` over REST.
pub struct GeminiGenerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationSettings,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationSettings {
    temperature: f32,
    max_output_tokens: u32,
}

impl GeminiGenerator {
    /// Build a client using `GEMINI_API_KEY` from the environment.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| Error::Config("GEMINI_API_KEY environment variable not set".into()))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &GenerationConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }
}

#[async_trait]
impl Generator for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationSettings {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        };

        debug!(model = %self.model, prompt_len = prompt.len(), "calling generateContent");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::generation("gemini", format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Error::generation(
                "gemini",
                format!("API error {}: {}", status, body_text),
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::generation("gemini", format!("invalid response body: {}", e)))?;
        parse_gemini_response(&json)
    }
}

/// Concatenate the text parts of the first candidate.
fn parse_gemini_response(json: &serde_json::Value) -> Result<String> {
    if let Some(reason) = json
        .pointer("/promptFeedback/blockReason")
        .and_then(|r| r.as_str())
    {
        return Err(Error::generation(
            "gemini",
            format!("prompt blocked: {}", reason),
        ));
    }

    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| Error::generation("gemini", "response has no candidates"))?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();

    if text.trim().is_empty() {
        return Err(Error::generation("gemini", "response contained no text"));
    }
    Ok(text)
}

/// Create the configured [`Generator`].
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "gemini" => Ok(Arc::new(GeminiGenerator::new(config)?)),
        other => Err(Error::Config(format!("Unknown generation provider: {}", other))),
    }
}

// ============ Prompting ============

/// Build the grounded prompt: each chunk prefixed by its source filename,
/// followed by the question and fixed instructions.
pub fn build_prompt(question: &str, chunks: &[RetrievedChunk]) -> String {
    let context = chunks
        .iter()
        .map(|c| format!("Source: {}\n{}", c.metadata.filename, c.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are an expert healthcare information assistant. Answer the user's question based ONLY \
on the provided context from medical documents.

Context from medical documents:
{context}

User Question: {question}

Instructions:
1. Answer based strictly on the provided context
2. If the information is not in the context, clearly state this
3. Provide specific medical information when available
4. Include relevant dosage, administration, contraindications if mentioned
5. Always remind users to consult healthcare professionals
6. Be precise, helpful, and medically accurate

Please provide a detailed, accurate answer followed by:
\"{DISCLAIMER}\"
"
    )
}

/// Source attributions with a 200-character content preview.
pub fn make_sources(chunks: &[RetrievedChunk]) -> Vec<Source> {
    chunks
        .iter()
        .map(|c| Source {
            filename: c.metadata.filename.clone(),
            similarity: c.similarity,
            content_preview: format!(
                "{}...",
                c.content.chars().take(PREVIEW_CHARS).collect::<String>()
            ),
        })
        .collect()
}

/// Answer from already-retrieved chunks.
pub async fn generate_answer(
    generator: &dyn Generator,
    question: &str,
    chunks: &[RetrievedChunk],
) -> Result<Answer> {
    if chunks.is_empty() {
        return Ok(Answer::NoRelevantContext);
    }

    let prompt = build_prompt(question, chunks);
    let answer = generator.generate(&prompt).await?;

    Ok(Answer::Answered {
        answer,
        sources: make_sources(chunks),
    })
}

/// Retrieve context for `question` from `user_id`'s documents and answer it.
pub async fn answer_question(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    generator: &dyn Generator,
    user_id: i64,
    question: &str,
    top_k: usize,
    min_similarity: f32,
) -> Result<Answer> {
    let chunks = semantic_search(pool, embedder, user_id, question, top_k, min_similarity).await?;
    let answer = generate_answer(generator, question, &chunks).await?;

    match &answer {
        Answer::Answered { sources, .. } => {
            info!(user_id, sources = sources.len(), generator = generator.name(), "question answered")
        }
        Answer::NoRelevantContext => info!(user_id, "no relevant context for question"),
    }
    Ok(answer)
}

/// `hca ask "<question>" --user <username>`: answer and record in history.
pub async fn run_ask(
    config: &Config,
    question: &str,
    username: &str,
    top_k: Option<usize>,
) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let user = auth::find_user_by_username(&pool, username)
        .await?
        .with_context(|| format!("no such user: {}", username))?;
    let embedder = embedding::create_embedder(&config.embedding)?;
    let generator = create_generator(&config.generation)?;

    let answer = answer_question(
        &pool,
        embedder.as_ref(),
        generator.as_ref(),
        user.id,
        question,
        top_k.filter(|&k| k > 0).unwrap_or(config.retrieval.top_k),
        config.retrieval.min_similarity,
    )
    .await?;

    history::save_message(&pool, user.id, question, answer.text(), answer.sources()).await?;

    println!("{}", answer.text());
    if !answer.sources().is_empty() {
        println!();
        println!("Sources:");
        for s in answer.sources() {
            println!("  [{:.3}] {}", s.similarity, s.filename);
        }
    }

    pool.close().await;
    Ok(())
}
