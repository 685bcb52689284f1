use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use triage_core::classify::Classification;
use triage_core::corpus::append_article;
use triage_core::records::{
    append_content_gap, append_feedback, now_rfc3339, read_content_gaps, read_feedback_tail,
    read_llm_logs_recent, truncate_chars, ContentGap, Feedback, RecordPaths,
};
use triage_core::{
    ArticleRecommendation, CsvCorpusSource, IndexStatus, RetrievalConfig, RetrievalService,
    SimilarTicket,
};

pub mod llm;

use llm::{Classifier, LlmConfig};

const ALLOWED_EXTENSIONS: &[&str] = &["txt", "csv", "pdf"];
const ADMIN_LIST_LIMIT: usize = 200;
const MAX_K: usize = 50;

pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub retrieval: RetrievalConfig,
    pub llm: Option<LlmConfig>,
    pub admin_token: Option<String>,
    /// Comma-separated origins; `None` allows any origin.
    pub cors_allow_origin: Option<String>,
}

impl ServerConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            retrieval: RetrievalConfig::from_data_dir(data_dir),
            llm: None,
            admin_token: None,
            cors_allow_origin: None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub retrieval: Arc<RetrievalService<CsvCorpusSource>>,
    pub classifier: Arc<Classifier>,
    pub records: Arc<RecordPaths>,
    pub kb_path: PathBuf,
    pub admin_token: Option<String>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn build_app(config: ServerConfig) -> Result<Router> {
    std::fs::create_dir_all(&config.data_dir)?;
    let records = RecordPaths::new(&config.data_dir);
    let classifier = Classifier::new(config.llm, records.llm_log())?;
    match classifier.model() {
        Some(model) => tracing::info!(model, "classifying with language model"),
        None => tracing::info!("no language model configured; using keyword classification"),
    }
    let app_state = AppState {
        retrieval: Arc::new(RetrievalService::open(&config.retrieval)),
        classifier: Arc::new(classifier),
        records: Arc::new(records),
        kb_path: config.retrieval.kb_path.clone(),
        admin_token: config.admin_token,
    };

    let cors = match config.cors_allow_origin {
        Some(val) => {
            let origins: Vec<_> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(origins))
                    .allow_methods(Any)
                    .allow_headers(Any)
            }
        }
        None => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/analyze", post(analyze_handler))
        .route("/feedback", post(feedback_handler))
        .route("/similar", get(similar_handler))
        .route("/recommend", get(recommend_handler))
        .route("/admin/gaps", get(admin_gaps))
        .route("/admin/generate_kb", post(admin_generate_kb))
        .route("/admin/logs", get(admin_logs))
        .route("/admin/feedback", get(admin_feedback))
        .route("/admin/reindex", post(admin_reindex))
        .route("/admin/index", get(admin_index))
        .route("/admin/download/:fname", get(admin_download))
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());
    Ok(app)
}

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    pub text: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Serialize)]
pub struct AnalyzeResponse {
    pub uploaded_ticket: String,
    pub analyzed_at: String,
    pub llm_result: Classification,
    pub similar_tickets: Vec<SimilarTicket>,
    pub recommended_articles: Vec<ArticleRecommendation>,
    #[serde(flatten)]
    pub summary: Classification,
}

fn extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// Text to analyze for an upload. CSV uploads are flattened to their cell values;
/// anything that fails to parse is used verbatim.
pub fn extract_text(filename: Option<&str>, body: &str) -> String {
    if filename.and_then(extension).as_deref() != Some("csv") {
        return body.to_string();
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(body.as_bytes());
    let mut cells: Vec<String> = Vec::new();
    for record in reader.records() {
        match record {
            Ok(r) => cells.extend(r.iter().map(str::to_string)),
            Err(_) => return body.to_string(),
        }
    }
    cells.join(" ")
}

pub async fn analyze_handler(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    if let Some(name) = req.filename.as_deref() {
        let ok = extension(name).map(|e| ALLOWED_EXTENSIONS.contains(&e.as_str())).unwrap_or(false);
        if !ok {
            return Err(api_error(StatusCode::BAD_REQUEST, "Unsupported file type"));
        }
    }
    let text = extract_text(req.filename.as_deref(), &req.text).trim().to_string();
    if text.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Could not read text from file"));
    }

    let classification = state.classifier.classify(&text).await;

    let retrieval = Arc::clone(&state.retrieval);
    let query = text.clone();
    let (similar_tickets, recommended_articles) = tokio::task::spawn_blocking(move || {
        (retrieval.find_similar_tickets(&query, 3), retrieval.recommend_articles(&query, 3))
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if recommended_articles.is_empty() {
        if let Err(e) = append_content_gap(&state.records.content_gaps(), &text) {
            tracing::warn!(error = %e, "could not record content gap");
        }
    }
    tracing::debug!(
        category = %classification.category,
        similar = similar_tickets.len(),
        articles = recommended_articles.len(),
        "analyzed ticket"
    );

    Ok(Json(AnalyzeResponse {
        uploaded_ticket: truncate_chars(&text, 1000),
        analyzed_at: now_rfc3339(),
        summary: classification.clone(),
        llm_result: classification,
        similar_tickets,
        recommended_articles,
    }))
}

pub async fn feedback_handler(
    State(state): State<AppState>,
    Json(feedback): Json<Feedback>,
) -> Result<Json<Value>, ApiError> {
    append_feedback(&state.records.feedback(), &feedback)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
pub struct RetrievalParams {
    pub q: String,
    #[serde(default = "default_k")]
    pub k: usize,
}
fn default_k() -> usize { 3 }

#[derive(Serialize)]
pub struct RetrievalResponse<T> {
    pub query: String,
    pub results: Vec<T>,
}

pub async fn similar_handler(
    State(state): State<AppState>,
    Query(params): Query<RetrievalParams>,
) -> Result<Json<RetrievalResponse<SimilarTicket>>, ApiError> {
    let k = params.k.min(MAX_K);
    let retrieval = Arc::clone(&state.retrieval);
    let q = params.q.clone();
    let results = tokio::task::spawn_blocking(move || retrieval.find_similar_tickets(&q, k))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(RetrievalResponse { query: params.q, results }))
}

pub async fn recommend_handler(
    State(state): State<AppState>,
    Query(params): Query<RetrievalParams>,
) -> Result<Json<RetrievalResponse<ArticleRecommendation>>, ApiError> {
    let k = params.k.min(MAX_K);
    let retrieval = Arc::clone(&state.retrieval);
    let q = params.q.clone();
    let results = tokio::task::spawn_blocking(move || retrieval.recommend_articles(&q, k))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(RetrievalResponse { query: params.q, results }))
}

// --- Admin endpoints ---
async fn admin_gaps(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ContentGap>>, ApiError> {
    authorize(&state, &headers)?;
    let gaps = read_content_gaps(&state.records.content_gaps())
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(gaps))
}

#[derive(Deserialize)]
struct GenerateKbRequest {
    #[serde(default)]
    ticket_excerpt: String,
}

async fn admin_generate_kb(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GenerateKbRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let ticket_text = req.ticket_excerpt.trim();
    if ticket_text.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Missing ticket text"));
    }
    let mut article = state.classifier.draft_article(ticket_text).await.map_err(|e| {
        tracing::warn!(error = %e, "knowledge-base draft failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "LLM failed")
    })?;
    article.article_id = format!("KB{}", time::OffsetDateTime::now_utc().unix_timestamp());
    article.link = "#".into();
    append_article(&state.kb_path, &article)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    tracing::info!(article_id = %article.article_id, "knowledge-base article created");
    Ok(Json(json!({ "message": "Article created successfully", "article_id": article.article_id })))
}

async fn admin_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, ApiError> {
    authorize(&state, &headers)?;
    let logs = read_llm_logs_recent(&state.records.llm_log(), ADMIN_LIST_LIMIT)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(logs))
}

async fn admin_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    match read_feedback_tail(&state.records.feedback(), ADMIN_LIST_LIMIT) {
        Ok(rows) => Ok(Json(json!(rows))),
        Err(e) => {
            tracing::warn!(error = %e, "could not read feedback");
            Ok(Json(json!([])))
        }
    }
}

async fn admin_reindex(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let retrieval = Arc::clone(&state.retrieval);
    tokio::task::spawn_blocking(move || retrieval.reset_history())
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn admin_index(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<IndexStatus>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.retrieval.history_status()))
}

/// Send one flat file from the data directory as an attachment.
async fn admin_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Path(fname): axum::extract::Path<String>,
) -> Result<Response, ApiError> {
    authorize(&state, &headers)?;
    if fname.is_empty() || fname.contains("..") || fname.contains(['/', '\\']) {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid file name"));
    }
    let path = state.records.root.join(&fname);
    if !path.is_file() {
        return Err(api_error(StatusCode::NOT_FOUND, "not found"));
    }
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{fname}\"")),
    ];
    Ok((headers, bytes).into_response())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let required = match &state.admin_token {
        Some(t) => t,
        None => return Err(api_error(StatusCode::UNAUTHORIZED, "ADMIN_TOKEN not set")),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err(api_error(StatusCode::UNAUTHORIZED, "invalid admin token"))
    }
}
