//! JSON HTTP API over the harvesting pipeline.
//!
//! # Endpoints
//!
//! | Method   | Path                      | Description |
//! |----------|---------------------------|-------------|
//! | `POST`   | `/batch/{stage}`          | Run a stage over a batch of ids |
//! | `GET`    | `/search`                 | Hybrid search |
//! | `POST`   | `/reconcile`              | Reconcile statuses against storage |
//! | `POST`   | `/index/rebuild`          | Rebuild the lexical index |
//! | `POST`   | `/register`               | Register source URLs |
//! | `GET`    | `/documents/{id}/status`  | Stored vs reconciled stage view |
//! | `DELETE` | `/documents/{id}`         | Remove a document and its objects |
//! | `GET`    | `/stats`                  | Corpus counters |
//! | `GET`    | `/health`                 | Health check |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "dependency_blocked", "message": "..." } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `dependency_blocked`
//! (409), `embeddings_disabled` (400), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the API is consumed
//! by a browser front end on another origin.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::analysis::TextAnalysisClient;
use crate::config::Config;
use crate::pipeline::{
    self, BatchOutcome, DocumentAnalyzer, EmbeddingProducer, HttpDownloader, PipelineError,
    StageProducer, TextExtractor,
};
use crate::search::{self, SearchRequest};
use crate::status::Stage;
use crate::storage::{ExistenceOracle, ObjectStore};
use crate::{db, index, migrate, reconcile, stats, validate};

/// Shared application state for all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
    store: Arc<ObjectStore>,
}

/// Start the API server on `[server].bind`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;
    let store = Arc::new(ObjectStore::from_config(&config.storage)?);

    let state = AppState {
        config: Arc::new(config.clone()),
        pool,
        store,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/batch/{stage}", post(handle_batch))
        .route("/search", get(handle_search))
        .route("/reconcile", post(handle_reconcile))
        .route("/index/rebuild", post(handle_index_rebuild))
        .route("/register", post(handle_register))
        .route("/documents/{id}/status", get(handle_document_status))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("API server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
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

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        internal(format!("{e:#}"))
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::DependencyBlocked { .. } => AppError {
                status: StatusCode::CONFLICT,
                code: "dependency_blocked".to_string(),
                message: e.to_string(),
            },
            PipelineError::Internal(err) => internal(format!("{err:#}")),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /batch/{stage} ============

#[derive(Deserialize)]
struct BatchRequest {
    ids: Vec<i64>,
    #[serde(default)]
    force: bool,
}

async fn handle_batch(
    State(state): State<AppState>,
    Path(stage_name): Path<String>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchOutcome>, AppError> {
    let stage = Stage::parse(&stage_name)
        .ok_or_else(|| bad_request(format!("unknown stage: {stage_name}")))?;
    if req.ids.is_empty() {
        return Err(bad_request("ids must not be empty"));
    }

    let producer: Box<dyn StageProducer> = match stage {
        Stage::Collected => {
            return Err(bad_request(
                "collection is not batchable; use POST /register",
            ));
        }
        Stage::Downloaded => Box::new(
            HttpDownloader::new(state.store.clone(), &state.config.harvest)
                .map_err(AppError::from)?,
        ),
        Stage::Extracted => Box::new(TextExtractor::new(state.store.clone())),
        Stage::Analyzed => {
            let client =
                TextAnalysisClient::new(&state.config.analysis).map_err(AppError::from)?;
            Box::new(DocumentAnalyzer::new(state.store.clone(), client))
        }
        Stage::Embedded => {
            if !state.config.embedding.is_enabled() {
                return Err(AppError {
                    status: StatusCode::BAD_REQUEST,
                    code: "embeddings_disabled".to_string(),
                    message: "embedding provider is disabled".to_string(),
                });
            }
            Box::new(
                EmbeddingProducer::new(state.store.clone(), state.config.embedding.clone())
                    .map_err(AppError::from)?,
            )
        }
    };

    let oracle = ExistenceOracle::new(&*state.store);
    let outcome = pipeline::run_stage(
        &state.pool,
        &oracle,
        stage,
        &req.ids,
        req.force,
        producer.as_ref(),
    )
    .await?;
    Ok(Json(outcome))
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    reference: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    /// Comma-separated lists.
    keywords_all: Option<String>,
    keywords_any: Option<String>,
    exclude: Option<String>,
    chambers_any: Option<String>,
    chambers_all: Option<String>,
    themes_any: Option<String>,
    themes_all: Option<String>,
    limit: Option<i64>,
    score_threshold: Option<f32>,
}

fn split_terms(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_ids(raw: &Option<String>) -> Result<Vec<i64>, AppError> {
    split_terms(raw)
        .iter()
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| bad_request(format!("invalid id: {s}")))
        })
        .collect()
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<search::SearchResponse>, AppError> {
    let req = SearchRequest {
        query: params.q.clone(),
        reference: params.reference.clone(),
        date_from: params.date_from.clone(),
        date_to: params.date_to.clone(),
        keywords_all: split_terms(&params.keywords_all),
        keywords_any: split_terms(&params.keywords_any),
        exclude: split_terms(&params.exclude),
        chambers_any: split_ids(&params.chambers_any)?,
        chambers_all: split_ids(&params.chambers_all)?,
        themes_any: split_ids(&params.themes_any)?,
        themes_all: split_ids(&params.themes_all)?,
        limit: params.limit,
        score_threshold: params.score_threshold,
    };
    let response = search::run_search(
        &state.pool,
        &state.config.embedding,
        &state.config.search,
        &req,
    )
    .await
    .map_err(AppError::from)?;
    Ok(Json(response))
}

// ============ POST /reconcile ============

#[derive(Deserialize)]
struct ReconcileRequest {
    limit: Option<u64>,
    #[serde(default)]
    apply: bool,
}

async fn handle_reconcile(
    State(state): State<AppState>,
    Json(req): Json<ReconcileRequest>,
) -> Result<Json<reconcile::ReconcileReport>, AppError> {
    let oracle = ExistenceOracle::new(&*state.store);
    let report = reconcile::run(&state.pool, &oracle, req.limit, req.apply)
        .await
        .map_err(AppError::from)?;
    Ok(Json(report))
}

// ============ POST /index/rebuild ============

#[derive(Serialize)]
struct RebuildResponse {
    postings: u64,
}

async fn handle_index_rebuild(
    State(state): State<AppState>,
) -> Result<Json<RebuildResponse>, AppError> {
    let postings = index::rebuild(&state.pool).await.map_err(AppError::from)?;
    Ok(Json(RebuildResponse { postings }))
}

// ============ POST /register ============

#[derive(Deserialize)]
struct RegisterRequest {
    urls: Vec<String>,
}

async fn handle_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<crate::collect::RegisterSummary>, AppError> {
    if req.urls.is_empty() {
        return Err(bad_request("urls must not be empty"));
    }
    let summary = crate::collect::register(&state.pool, &req.urls)
        .await
        .map_err(AppError::from)?;
    Ok(Json(summary))
}

// ============ GET /documents/{id}/status ============

#[derive(Serialize)]
struct StageStatusView {
    stage: String,
    stored: String,
    reconciled: String,
}

#[derive(Serialize)]
struct DocumentStatusResponse {
    id: i64,
    reference: Option<String>,
    stages: Vec<StageStatusView>,
}

async fn handle_document_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DocumentStatusResponse>, AppError> {
    let doc = validate::load_snapshot(&state.pool, id)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| not_found(format!("no document with id {id}")))?;

    let oracle = ExistenceOracle::new(&*state.store);
    let mut stages = Vec::new();
    for stage in [
        Stage::Collected,
        Stage::Downloaded,
        Stage::Extracted,
        Stage::Analyzed,
        Stage::Embedded,
    ] {
        let stored = doc.status(stage);
        let reconciled = validate::reconciled_status(&oracle, &doc, stage).await;
        stages.push(StageStatusView {
            stage: stage.name().to_string(),
            stored: stored.to_string(),
            reconciled: reconciled.to_string(),
        });
    }

    Ok(Json(DocumentStatusResponse {
        id: doc.id,
        reference: doc.reference,
        stages,
    }))
}

// ============ DELETE /documents/{id} ============

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = pipeline::delete_document(&state.pool, &state.store, id)
        .await
        .map_err(AppError::from)?;
    if !deleted {
        return Err(not_found(format!("no document with id {id}")));
    }
    Ok(Json(DeleteResponse { deleted }))
}

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<stats::Stats>, AppError> {
    let gathered = stats::gather(&state.pool).await.map_err(AppError::from)?;
    Ok(Json(gathered))
}
