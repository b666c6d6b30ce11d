//! Authenticated HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Auth | Description |
//! |--------|------|------|-------------|
//! | `POST` | `/auth/register` | - | Create an account |
//! | `POST` | `/auth/login` | - | Form login, returns a bearer token |
//! | `GET`  | `/auth/me` | bearer | The current user |
//! | `POST` | `/documents/upload` | bearer | Multipart PDF upload (field `files`) |
//! | `GET`  | `/documents/list` | bearer | The user's document index |
//! | `POST` | `/chat/ask` | bearer | Answer a question from the user's documents |
//! | `GET`  | `/chat/history` | bearer | Recent exchanges, oldest first |
//! | `DELETE` | `/chat/clear` | bearer | Delete the user's history |
//! | `GET`  | `/health` | - | Health check |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unauthorized", "message": "Could not validate credentials" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `payload_too_large` (413), `generation_failed` (502), `internal` (500).
//! 401 responses carry `WWW-Authenticate: Bearer`.

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::{FormRejection, JsonRejection, QueryRejection},
        DefaultBodyLimit, FromRequestParts, Multipart, Query, State,
    },
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Form, Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{self, TokenIssuer};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::error::Error;
use crate::extract::is_pdf;
use crate::generate::{answer_question, create_generator, Generator};
use crate::history::{self, DEFAULT_HISTORY_LIMIT};
use crate::ingest::{ingest_pdf, list_documents};
use crate::migrate::apply_schema;
use crate::models::{ChatMessage, DocumentSummary, NewUser, Source, User};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub tokens: TokenIssuer,
}

/// Starts the HTTP server on `[server].bind`.
///
/// Creates the schema if needed and loads the embedding model and generator
/// once; every request shares them through [`AppState`].
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    std::fs::create_dir_all(&config.storage.dir)?;

    let tokens = TokenIssuer::new(&config.auth.resolve_secret()?, config.auth.token_ttl_minutes);
    let embedder = create_embedder(&config.embedding)?;
    let generator = create_generator(&config.generation)?;

    info!(
        embedder = embedder.model_name(),
        generator = generator.name(),
        "providers ready"
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        embedder,
        generator,
        tokens,
    };

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// The full route table with CORS, request tracing and the upload size limit.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let max_upload = state.config.server.max_upload_bytes;

    Router::new()
        .route("/auth/register", post(handle_register))
        .route("/auth/login", post(handle_login))
        .route("/auth/me", get(handle_me))
        .route("/documents/upload", post(handle_upload))
        .route("/documents/list", get(handle_list_documents))
        .route("/chat/ask", post(handle_ask))
        .route("/chat/history", get(handle_history))
        .route("/chat/clear", delete(handle_clear))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_upload))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Converts into a JSON error response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let unauthorized = self.status == StatusCode::UNAUTHORIZED;
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if unauthorized {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

fn internal() -> AppError {
    AppError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "internal server error",
    )
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(_)
            | Error::UsernameTaken
            | Error::EmailTaken
            | Error::Extraction(_) => bad_request(err.to_string()),
            Error::InvalidCredentials | Error::InvalidToken => unauthorized(err.to_string()),
            Error::NotFound(_) => AppError::new(StatusCode::NOT_FOUND, "not_found", err.to_string()),
            Error::Generation { .. } => {
                error!(error = %err, "answer generation failed");
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "generation_failed",
                    err.to_string(),
                )
            }
            other => {
                error!(error = %other, "request failed");
                internal()
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<FormRejection> for AppError {
    fn from(rejection: FormRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<MultipartRejection> for AppError {
    fn from(rejection: MultipartRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                err.body_text(),
            )
        } else {
            bad_request(err.body_text())
        }
    }
}

// ============ Authentication ============

/// The user identified by the request's bearer token.
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| unauthorized(Error::InvalidToken.to_string()))?;

        let user = auth::current_user(&state.pool, &state.tokens, token).await?;
        Ok(CurrentUser(user))
    }
}

// ============ POST /auth/register ============

#[derive(Serialize)]
struct RegisterResponse {
    success: bool,
    message: String,
    user_id: i64,
}

async fn handle_register(
    State(state): State<AppState>,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Result<Json<RegisterResponse>, AppError> {
    let Json(new_user) = payload?;
    let user = auth::register_user(&state.pool, &new_user, state.config.auth.pbkdf2_iterations)
        .await?;

    Ok(Json(RegisterResponse {
        success: true,
        message: "User registered successfully".to_string(),
        user_id: user.id,
    }))
}

// ============ POST /auth/login ============

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct UserInfo {
    id: i64,
    username: String,
    email: String,
    full_name: String,
}

#[derive(Serialize)]
struct LoginResponse {
    access_token: String,
    token_type: &'static str,
    user_info: UserInfo,
}

async fn handle_login(
    State(state): State<AppState>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let Form(form) = form?;
    let user = auth::authenticate_user(&state.pool, &form.username, &form.password).await?;
    let access_token = state.tokens.issue(&user.username)?;

    info!(user_id = user.id, "login");

    Ok(Json(LoginResponse {
        access_token,
        token_type: "bearer",
        user_info: UserInfo {
            id: user.id,
            username: user.username,
            email: user.email,
            full_name: user.full_name,
        },
    }))
}

// ============ GET /auth/me ============

async fn handle_me(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

// ============ POST /documents/upload ============

#[derive(Serialize)]
struct UploadedDocument {
    filename: String,
    document_id: String,
    chunk_count: usize,
    status: &'static str,
}

#[derive(Serialize)]
struct UploadResponse {
    success: bool,
    message: String,
    documents: Vec<UploadedDocument>,
}

/// Ingest every PDF part named `files`. Other parts are skipped; the first
/// failing PDF aborts the request.
async fn handle_upload(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let mut multipart = multipart?;
    let mut documents = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("files") {
            continue;
        }
        let filename = field.file_name().unwrap_or("document.pdf").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;

        if !is_pdf(content_type.as_deref(), &bytes) {
            debug!(filename = %filename, content_type = ?content_type, "skipping non-PDF upload");
            continue;
        }

        let outcome = ingest_pdf(
            &state.pool,
            state.embedder.as_ref(),
            &state.config,
            user.id,
            &filename,
            bytes.to_vec(),
        )
        .await
        .inspect_err(|e| warn!(user_id = user.id, filename = %filename, error = %e, "upload failed"))?;

        documents.push(UploadedDocument {
            filename: outcome.filename,
            document_id: outcome.document_id,
            chunk_count: outcome.chunk_count,
            status: "processed",
        });
    }

    Ok(Json(UploadResponse {
        success: true,
        message: format!("Processed {} documents", documents.len()),
        documents,
    }))
}

// ============ GET /documents/list ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentSummary>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = list_documents(&state.pool, user.id).await?;
    Ok(Json(DocumentListResponse { documents }))
}

// ============ POST /chat/ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct AskResponse {
    success: bool,
    answer: String,
    sources: Vec<Source>,
    timestamp: String,
}

/// Answer from the caller's documents and record the exchange.
async fn handle_ask(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<AskResponse>, AppError> {
    let Json(req) = payload?;
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    // Zero falls back to the configured default.
    let top_k = req.top_k.filter(|&k| k > 0).unwrap_or(state.config.retrieval.top_k);

    let answer = answer_question(
        &state.pool,
        state.embedder.as_ref(),
        state.generator.as_ref(),
        user.id,
        &req.question,
        top_k,
        state.config.retrieval.min_similarity,
    )
    .await?;

    history::save_message(
        &state.pool,
        user.id,
        &req.question,
        answer.text(),
        answer.sources(),
    )
    .await?;

    Ok(Json(AskResponse {
        success: true,
        answer: answer.text().to_string(),
        sources: answer.sources().to_vec(),
        timestamp: Utc::now().to_rfc3339(),
    }))
}

// ============ GET /chat/history ============

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<i64>,
}

#[derive(Serialize)]
struct HistoryResponse {
    history: Vec<ChatMessage>,
}

async fn handle_history(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> Result<Json<HistoryResponse>, AppError> {
    let Query(params) = params?;
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let history = history::get_history(&state.pool, user.id, limit).await?;
    Ok(Json(HistoryResponse { history }))
}

// ============ DELETE /chat/clear ============

#[derive(Serialize)]
struct ClearResponse {
    message: String,
    deleted: u64,
}

async fn handle_clear(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<ClearResponse>, AppError> {
    let deleted = history::clear_history(&state.pool, user.id).await?;
    Ok(Json(ClearResponse {
        message: "Chat history cleared successfully".to_string(),
        deleted,
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    timestamp: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}
