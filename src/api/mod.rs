//! HTTP surface: a thin axum adapter over the core services.
//!
//! Auth is cookie-based; the session token is opaque and stored hashed.
//! Every handler resolves the caller to an [`Actor`] first, then defers
//! to the owning service.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

use crate::auth::{Actor, AuthService};
use crate::config::RuntimeConfig;
use crate::db::Database;
use crate::models::ModelGateway;
use crate::novels::NovelsService;
use crate::pipeline::PipelineRunner;
use crate::rp::RpServiceRouter;
use crate::scheduler::{PipelineJob, PipelineJobsService};
use crate::storage::StorageLayout;
use crate::types::{JobStatus, Result, RuntimeError};
use crate::vector::QdrantIndexProvider;

pub mod routes;
pub mod types;

use types::ErrorResponse;

/// Everything the handlers need, cloned per request via `Arc`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub auth: AuthService,
    pub novels: NovelsService,
    pub layout: StorageLayout,
    pub jobs: Arc<PipelineJobsService>,
    pub rp: Arc<RpServiceRouter>,
}

impl AppState {
    /// Wire the full service graph from configuration. Reaps orphaned
    /// jobs and registers the job-update callback.
    pub fn build(config: RuntimeConfig) -> Result<Arc<Self>> {
        let db = Database::new(&config.storage.database_path);
        db.init_schema()?;

        let layout = StorageLayout::new(&config.storage);
        let auth = AuthService::new(
            db.clone(),
            config.api.user_session_days,
            config.api.guest_session_days,
        );
        let novels = NovelsService::new(db.clone(), layout.clone());

        let gateway = ModelGateway::new(config.llm.clone(), config.embedding.clone());
        let chat = Arc::new(gateway.chat_client()?);
        let embedding = Arc::new(gateway.embedding_client()?);
        let vectors = Arc::new(QdrantIndexProvider::new(
            config.vector_db.clone(),
            config.embedding.dimensions,
        ));

        let runner = PipelineRunner::new(
            config.clone(),
            novels.clone(),
            chat.clone(),
            embedding.clone(),
            vectors.clone(),
        );
        let jobs = Arc::new(PipelineJobsService::new(db.clone(), Arc::new(runner)));
        jobs.reap_orphans()?;

        let rp = Arc::new(RpServiceRouter::new(
            novels.clone(),
            layout.clone(),
            config.rp_query.clone(),
            chat,
            embedding,
            vectors,
        ));

        // Keep the owning novel and the retrieval cache in sync with job
        // transitions.
        let novels_cb = novels.clone();
        let rp_cb = Arc::clone(&rp);
        jobs.set_on_update(Arc::new(move |job: &PipelineJob| {
            let outcome = match job.status {
                JobStatus::Queued | JobStatus::Running => {
                    novels_cb.set_processing(&job.novel_id, &job.job_id)
                }
                JobStatus::Succeeded => {
                    rp_cb.invalidate(&job.novel_id);
                    novels_cb.set_ready(&job.novel_id, &job.job_id, &job.result)
                }
                JobStatus::Failed => {
                    rp_cb.invalidate(&job.novel_id);
                    novels_cb.set_failed(&job.novel_id, &job.job_id, &job.error)
                }
            };
            if let Err(e) = outcome {
                tracing::warn!(job_id = %job.job_id, error = %e, "job callback failed");
            }
        }));

        Ok(Arc::new(Self {
            config,
            auth,
            novels,
            layout,
            jobs,
            rp,
        }))
    }

    /// Resolve the caller from the session cookie.
    pub fn actor(&self, headers: &HeaderMap) -> Result<Option<Actor>> {
        let Some(token) = self.cookie_token(headers) else {
            return Ok(None);
        };
        self.auth.actor_from_token(&token)
    }

    /// A registered user, or `AuthRequired`.
    pub fn require_user(&self, headers: &HeaderMap) -> Result<(String, String)> {
        match self.actor(headers)? {
            Some(Actor::User { user_id, username }) => Ok((user_id, username)),
            _ => Err(RuntimeError::AuthRequired),
        }
    }

    /// Any authenticated actor (user or guest), or `AuthRequired`.
    pub fn require_actor(&self, headers: &HeaderMap) -> Result<Actor> {
        self.actor(headers)?.ok_or(RuntimeError::AuthRequired)
    }

    pub fn cookie_token(&self, headers: &HeaderMap) -> Option<String> {
        let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
        let name = &self.config.api.cookie_name;
        cookies.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }

    pub fn session_cookie(&self, token: &str, max_age_days: u32) -> String {
        format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.config.api.cookie_name,
            token,
            u64::from(max_age_days) * 86_400
        )
    }

    pub fn clear_cookie(&self) -> String {
        format!(
            "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
            self.config.api.cookie_name
        )
    }
}

/// Maps [`RuntimeError`] onto HTTP responses.
pub struct ApiError(pub RuntimeError);

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            RuntimeError::InputValidation(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            RuntimeError::AuthRequired => (StatusCode::UNAUTHORIZED, "AUTH_REQUIRED"),
            RuntimeError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            RuntimeError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            RuntimeError::JobBusy => (StatusCode::CONFLICT, "JOB_BUSY"),
            RuntimeError::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_FAILED"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            code: code.to_string(),
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Assemble the full router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/register", post(routes::register))
        .route("/auth/login", post(routes::login))
        .route("/auth/logout", post(routes::logout))
        .route("/auth/me", get(routes::me))
        .route("/auth/guest", post(routes::guest))
        .route("/novels", get(routes::list_novels).post(routes::create_novel))
        .route(
            "/novels/:novel_id",
            get(routes::get_novel)
                .patch(routes::update_novel)
                .delete(routes::delete_novel),
        )
        .route("/public/novels", get(routes::list_public_novels))
        .route("/public/novels/:novel_id", get(routes::get_public_novel))
        .route("/novels/:novel_id/upload", post(routes::upload_novel))
        .route(
            "/novels/:novel_id/pipeline/chapter-index",
            get(routes::chapter_index),
        )
        .route("/novels/:novel_id/pipeline/run", post(routes::run_pipeline))
        .route("/jobs/:job_id", get(routes::get_job))
        .route("/jobs/:job_id/logs", get(routes::job_logs))
        .route("/rp/query-context", post(routes::rp_query_context))
        .route("/rp/respond", post(routes::rp_respond))
        .route("/rp/session/:session_id", get(routes::rp_session))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let addr = format!("{}:{}", state.config.api.host, state.config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RuntimeError::Internal(format!("bind {addr} failed: {e}")))?;
    tracing::info!(%addr, "serving HTTP API");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| RuntimeError::Internal(format!("server error: {e}")))
}
