//! Axum surface for BlogCluster Pro: user-facing job endpoints, engine webhooks
//! and the HTML job page.

mod auth;

use std::sync::Arc;

use askama::Template;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bcp_jobs::{
    CreateJobRequest, IncrementUsageRequest, JobError, JobService, JobStatusView, JobsConfig,
    StartOutlineRequest,
};
use bcp_storage::{HttpEngineClient, MemoryStore, PgStore, Store, StoreError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub use auth::{resolve_current_user_id, AuthConfig, CurrentUser, IngestSecret, USER_HEADER};

pub const CRATE_NAME: &str = "bcp-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    /// `None` runs on the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub host: String,
    pub port: u16,
    pub auth: AuthConfig,
    pub jobs: JobsConfig,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            db_max_connections: std::env::var("BCP_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            host: std::env::var("BCP_WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("BCP_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            auth: AuthConfig {
                ingest_secret: std::env::var("BCP_INGEST_SECRET").unwrap_or_default(),
                jwt_secret: std::env::var("BCP_JWT_SECRET").ok().filter(|v| !v.is_empty()),
                trust_user_header: std::env::var("BCP_TRUST_USER_HEADER")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(false),
            },
            jobs: JobsConfig::from_env(),
        }
    }
}

pub struct AppState {
    pub jobs: JobService,
    pub(crate) auth: AuthConfig,
    pub(crate) ingest_digest: Option<[u8; 32]>,
}

impl AppState {
    pub fn new(jobs: JobService, auth: AuthConfig) -> Self {
        let ingest_digest = auth::secret_digest(&auth.ingest_secret);
        Self {
            jobs,
            auth,
            ingest_digest,
        }
    }
}

/// JSON error envelope: `{ok: false, error}`; dispatch failures add `details` and `jobId`.
#[derive(Debug)]
pub struct ApiError(pub JobError);

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = match &self.0 {
            JobError::Dispatch {
                job_id,
                message,
                details,
            } => json!({"ok": false, "error": message, "details": details, "jobId": job_id}),
            JobError::Storage(err) => {
                error!(error = %err, "storage failure");
                json!({"ok": false, "error": "Server error"})
            }
            other => json!({"ok": false, "error": other.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

/// `{ok: true, ...data}`.
fn ok_json<T: Serialize>(data: T) -> ApiResult {
    let mut value = serde_json::to_value(data)
        .map_err(|e| ApiError(JobError::Storage(StoreError::Decode(e.to_string()))))?;
    match value.as_object_mut() {
        Some(obj) => {
            obj.insert("ok".into(), JsonValue::Bool(true));
        }
        None => value = json!({"ok": true, "data": value}),
    }
    Ok(Json(value).into_response())
}

/// Lenient body parsing: an empty body reads as `{}`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    let bytes: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(bytes).map_err(|e| ApiError(JobError::Validation(format!("invalid JSON body: {e}"))))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/keywords", post(create_job_handler).get(list_jobs_handler))
        .route("/api/research/status", get(status_handler))
        .route("/api/research/preview", get(preview_handler))
        .route("/api/research/cancel", post(cancel_handler))
        .route("/api/n8n/keywords-callback", post(keywords_callback_handler))
        .route("/api/internal/outline", post(outline_handler))
        .route("/api/outlines/start", post(start_outline_handler))
        .route("/api/drafts", post(draft_handler))
        .route("/api/publish", post(publish_handler))
        .route("/posts/supportings", get(supportings_handler))
        .route("/api/usage/increment", post(increment_usage_handler))
        .route("/api/usage", get(usage_handler))
        .route("/api/whoami", get(whoami_handler))
        .route("/keywords/{job_id}", get(job_page_handler))
        .with_state(Arc::new(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Builds the store, engine client and router from `config` and serves until ctrl-c.
pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let mut pg = None;
    let store: Arc<dyn Store> = match config.database_url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url, config.db_max_connections).await?;
            store.migrate().await?;
            pg = Some(store.clone());
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    if config.auth.ingest_secret.is_empty() {
        warn!("BCP_INGEST_SECRET is empty; every engine callback will be rejected");
    }
    if config.jobs.engine.keywords_url.is_none() {
        warn!("BCP_ENGINE_KEYWORDS_URL not set; new jobs will fail to dispatch");
    }

    let engine = Arc::new(HttpEngineClient::new(config.jobs.engine.clone())?);
    let jobs = JobService::new(store, engine, config.jobs.clone());
    let state = AppState::new(jobs, config.auth.clone());

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(host = %config.host, port = config.port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(pg) = pg {
        pg.close().await;
    }
    info!("server stopped");
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobQuery {
    #[serde(default)]
    job_id: Option<String>,
}

impl JobQuery {
    fn job_id(&self) -> &str {
        self.job_id.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SupportingsQuery {
    #[serde(default)]
    parent_slug: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    state.jobs.health().await?;
    ok_json(json!({"service": CRATE_NAME}))
}

async fn create_job_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    let request: CreateJobRequest = parse_body(&body)?;
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let callback_url = state
        .jobs
        .config()
        .callback_url(header_str("x-forwarded-proto"), header_str("x-forwarded-host"));
    let job = state.jobs.submit(&user_id, &request, &callback_url).await?;
    ok_json(json!({"jobId": job.id, "status": job.status}))
}

async fn list_jobs_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let jobs = state.jobs.list_jobs(&user_id, query.limit).await?;
    ok_json(json!({"jobs": jobs}))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<JobQuery>,
) -> ApiResult {
    ok_json(state.jobs.status(&user_id, query.job_id()).await?)
}

async fn preview_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<JobQuery>,
) -> ApiResult {
    ok_json(state.jobs.preview(&user_id, query.job_id()).await?)
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    body: Bytes,
) -> ApiResult {
    let query: JobQuery = parse_body(&body)?;
    let job = state.jobs.cancel(&user_id, query.job_id()).await?;
    ok_json(json!({"jobId": job.id, "status": job.status}))
}

async fn keywords_callback_handler(
    State(state): State<Arc<AppState>>,
    _secret: IngestSecret,
    body: Bytes,
) -> ApiResult {
    let fingerprint = hex::encode(Sha256::digest(&body));
    info!(bytes = body.len(), fingerprint = &fingerprint[..12], "engine callback received");
    let ack = state.jobs.ingest_callback(&body).await?;
    ok_json(json!({
        "jobId": ack.job_id,
        "saved": ack.saved,
        "status": ack.status,
        "ignored": ack.ignored,
    }))
}

async fn outline_handler(
    State(state): State<Arc<AppState>>,
    _secret: IngestSecret,
    body: Bytes,
) -> ApiResult {
    let payload: JsonValue = parse_body(&body)?;
    ok_json(state.jobs.ingest_outline(&payload).await?)
}

async fn draft_handler(
    State(state): State<Arc<AppState>>,
    _secret: IngestSecret,
    body: Bytes,
) -> ApiResult {
    let payload: JsonValue = parse_body(&body)?;
    let post = state.jobs.ingest_draft(&payload).await?;
    ok_json(json!({"post": post}))
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    _secret: IngestSecret,
    body: Bytes,
) -> ApiResult {
    let payload: JsonValue = parse_body(&body)?;
    let outcome = state.jobs.publish(&payload).await?;
    ok_json(json!({
        "clusterId": outcome.cluster_id,
        "idempotent": outcome.replayed,
        "post": outcome.post,
    }))
}

async fn supportings_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    Query(query): Query<SupportingsQuery>,
) -> ApiResult {
    let posts = state
        .jobs
        .supporting_posts(&user_id, query.parent_slug.as_deref(), query.status.as_deref())
        .await?;
    ok_json(json!({"posts": posts}))
}

async fn start_outline_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    body: Bytes,
) -> ApiResult {
    let request: StartOutlineRequest = parse_body(&body)?;
    let upstream = state.jobs.start_outline(&user_id, &request).await?;
    ok_json(json!({"status": upstream.status, "upstream": upstream.body}))
}

async fn increment_usage_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user_id): CurrentUser,
    body: Bytes,
) -> ApiResult {
    let request: IncrementUsageRequest = parse_body(&body)?;
    ok_json(state.jobs.increment_usage(&user_id, &request).await?)
}

async fn usage_handler(State(state): State<Arc<AppState>>, CurrentUser(user_id): CurrentUser) -> ApiResult {
    ok_json(state.jobs.usage(&user_id).await?)
}

async fn whoami_handler(CurrentUser(user_id): CurrentUser) -> ApiResult {
    ok_json(json!({"userId": user_id}))
}

struct SuggestionRow {
    keyword: String,
    score: String,
    source_url: Option<String>,
    sources: usize,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorPageTemplate {
    status: u16,
    message: String,
}

#[derive(Template)]
#[template(path = "job.html")]
struct JobPageTemplate {
    job_id: String,
    topic: String,
    location: String,
    status: String,
    error: Option<String>,
    polling: bool,
    failed: bool,
    suggestions: Vec<SuggestionRow>,
}

impl From<JobStatusView> for JobPageTemplate {
    fn from(view: JobStatusView) -> Self {
        let suggestions = view
            .suggestions
            .into_iter()
            .map(|s| SuggestionRow {
                keyword: s.keyword,
                score: s.score.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".into()),
                source_url: s.source_url,
                sources: s.news_urls.len(),
            })
            .collect();
        Self {
            job_id: view.job_id,
            topic: view.topic,
            location: view.location,
            status: view.status.to_string(),
            error: view.error,
            polling: !view.status.is_terminal(),
            failed: view.status == bcp_core::JobStatus::Failed,
            suggestions,
        }
    }
}

async fn job_page_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let view = match resolve_current_user_id(&state.auth, &headers) {
        Ok(user_id) => state.jobs.status(&user_id, &job_id).await,
        Err(err) => Err(err),
    };
    match view {
        Ok(view) => render_html(JobPageTemplate::from(view)),
        Err(err) => {
            let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let message = match err {
                JobError::Storage(source) => {
                    error!(error = %source, "job page failed");
                    "Server error".to_string()
                }
                other => other.to_string(),
            };
            let mut resp = render_html(ErrorPageTemplate {
                status: status.as_u16(),
                message,
            });
            *resp.status_mut() = status;
            resp
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            error!(error = %err, "template render failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Html("Server error".to_string())).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use bcp_storage::{AutomationEngine, DispatchError, EngineResponse};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Accepts keyword triggers; the formatter is left unconfigured.
    struct NullEngine;

    #[async_trait]
    impl AutomationEngine for NullEngine {
        async fn trigger_keywords(&self, _payload: &JsonValue) -> Result<EngineResponse, DispatchError> {
            Ok(EngineResponse {
                status: 200,
                body: JsonValue::Null,
            })
        }

        async fn trigger_formatter(&self, _payload: &JsonValue) -> Result<EngineResponse, DispatchError> {
            Err(DispatchError::NotConfigured("formatter"))
        }
    }

    fn test_app() -> Router {
        let jobs = JobService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NullEngine),
            JobsConfig::default(),
        );
        app(AppState::new(
            jobs,
            AuthConfig {
                ingest_secret: "ingest".into(),
                jwt_secret: None,
                trust_user_header: true,
            },
        ))
    }

    async fn body_json(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_public_and_not_cached() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(body_json(resp).await["ok"], json!(true));
    }

    #[tokio::test]
    async fn user_routes_require_identity() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/api/whoami").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await, json!({"ok": false, "error": "Unauthorized"}));

        let resp = test_app()
            .oneshot(
                Request::builder()
                    .uri("/api/whoami")
                    .header(USER_HEADER, "user_a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(resp).await, json!({"ok": true, "userId": "user_a"}));
    }

    #[tokio::test]
    async fn missing_topic_is_a_validation_error() {
        let resp = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/keywords")
                    .header(USER_HEADER, "user_a")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], json!("Missing topic"));
    }

    #[tokio::test]
    async fn job_page_renders_running_jobs_with_refresh() {
        let app = test_app();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/keywords")
                    .header(USER_HEADER, "user_a")
                    .body(Body::from(r#"{"topic":"Desk <stretches>","jobId":"kw_page"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["status"], json!("RUNNING"));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/keywords/kw_page")
                    .header(USER_HEADER, "user_a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let html = String::from_utf8(resp.into_body().collect().await.unwrap().to_bytes().to_vec()).unwrap();
        assert!(html.contains("http-equiv=\"refresh\""));
        assert!(html.contains("Desk &lt;stretches&gt;"));
    }

    #[tokio::test]
    async fn formatter_without_url_is_a_502() {
        let app = test_app();
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/keywords")
                    .header(USER_HEADER, "user_a")
                    .body(Body::from(r#"{"topic":"yoga","jobId":"kw_fmt"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/outlines/start")
                    .header(USER_HEADER, "user_a")
                    .body(Body::from(r#"{"jobId":"kw_fmt","topics":["a"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(resp).await;
        assert_eq!(body["jobId"], json!("kw_fmt"));
        assert_eq!(body["ok"], json!(false));
    }
}
