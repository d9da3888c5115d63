//! Route handlers.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;

use super::types::*;
use super::{ApiResult, AppState};
use crate::auth::Actor;
use crate::pipeline::{ChapterIndex, PipelineRunSpec};
use crate::rp::service::RpRequest;
use crate::rp::understanding::HistoryTurn;
use crate::types::{RuntimeError, Visibility};

fn with_cookie(cookie: String, body: impl IntoResponse) -> Response {
    let mut response = body.into_response();
    if let Ok(value) = cookie.parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

// ---- auth ----

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<Response> {
    let user = state.auth.register(&body.username, &body.password)?;
    let token = state.auth.create_user_session(&user.id)?;
    let cookie = state.session_cookie(&token, state.config.api.user_session_days);
    Ok(with_cookie(cookie, Json(user)))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Response> {
    let user = state
        .auth
        .authenticate(&body.username, &body.password)?
        .ok_or_else(|| RuntimeError::invalid("credentials", "unknown user or bad password"))?;
    let token = state.auth.create_user_session(&user.id)?;
    let cookie = state.session_cookie(&token, state.config.api.user_session_days);
    Ok(with_cookie(cookie, Json(user)))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    if let Some(token) = state.cookie_token(&headers) {
        state.auth.revoke_session(&token)?;
    }
    Ok(with_cookie(
        state.clear_cookie(),
        Json(serde_json::json!({ "logged_out": true })),
    ))
}

pub async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<MeResponse>> {
    let response = match state.require_actor(&headers)? {
        Actor::User { user_id, username } => MeResponse {
            actor_type: "user".to_string(),
            user_id: Some(user_id),
            username: Some(username),
            guest_id: None,
        },
        Actor::Guest { guest_id } => MeResponse {
            actor_type: "guest".to_string(),
            user_id: None,
            username: None,
            guest_id: Some(guest_id),
        },
    };
    Ok(Json(response))
}

pub async fn guest(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let (token, guest_id) = state.auth.create_guest_session()?;
    let cookie = state.session_cookie(&token, state.config.api.guest_session_days);
    Ok(with_cookie(
        cookie,
        Json(serde_json::json!({ "guest_id": guest_id })),
    ))
}

// ---- novels ----

pub async fn list_novels(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let (user_id, _) = state.require_user(&headers)?;
    let novels = state.novels.list_by_owner(&user_id)?;
    Ok(Json(serde_json::to_value(novels).map_err(RuntimeError::from)?))
}

pub async fn create_novel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateNovelRequest>,
) -> ApiResult<Json<Value>> {
    let (user_id, _) = state.require_user(&headers)?;
    let record = state.novels.create(&user_id, &body.title)?;
    Ok(Json(serde_json::to_value(record).map_err(RuntimeError::from)?))
}

pub async fn get_novel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(novel_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let (user_id, _) = state.require_user(&headers)?;
    let record = state.novels.assert_owner(&user_id, &novel_id)?;
    Ok(Json(serde_json::to_value(record).map_err(RuntimeError::from)?))
}

pub async fn update_novel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(novel_id): Path<String>,
    Json(body): Json<UpdateNovelRequest>,
) -> ApiResult<Json<Value>> {
    let (user_id, _) = state.require_user(&headers)?;
    let visibility = body
        .visibility
        .as_deref()
        .map(Visibility::from_str)
        .transpose()?;
    let record = state
        .novels
        .update(&user_id, &novel_id, body.title.as_deref(), visibility)?;
    Ok(Json(serde_json::to_value(record).map_err(RuntimeError::from)?))
}

pub async fn delete_novel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(novel_id): Path<String>,
    Query(query): Query<DeleteNovelQuery>,
) -> ApiResult<Json<Value>> {
    let (user_id, _) = state.require_user(&headers)?;
    state
        .novels
        .delete(&user_id, &novel_id, query.delete_vector_db)?;
    state.rp.invalidate(&novel_id);
    Ok(Json(serde_json::json!({ "deleted": true, "novel_id": novel_id })))
}

pub async fn list_public_novels(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let novels = state.novels.list_public()?;
    let public: Vec<Value> = novels.iter().map(|n| n.to_public()).collect();
    Ok(Json(Value::Array(public)))
}

pub async fn get_public_novel(
    State(state): State<Arc<AppState>>,
    Path(novel_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = state.novels.get(&novel_id)?;
    if record.visibility != Visibility::Public {
        return Err(RuntimeError::NotFound(format!("novel not found: {novel_id}")).into());
    }
    Ok(Json(record.to_public()))
}

// ---- upload & pipeline ----

pub async fn upload_novel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(novel_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let (user_id, _) = state.require_user(&headers)?;
    state.novels.assert_owner(&user_id, &novel_id)?;

    let field = multipart
        .next_field()
        .await
        .map_err(|e| RuntimeError::invalid("upload", e.to_string()))?
        .ok_or_else(|| RuntimeError::invalid("upload", "missing file field"))?;

    let filename = field.file_name().unwrap_or("").to_string();
    if !filename.to_lowercase().ends_with(".txt") {
        return Err(RuntimeError::invalid("upload", "only .txt files are supported").into());
    }

    let bytes = field
        .bytes()
        .await
        .map_err(|e| RuntimeError::invalid("upload", e.to_string()))?;
    let max_bytes = state.config.api.max_upload_bytes;
    if bytes.len() as u64 > max_bytes {
        return Err(RuntimeError::invalid("upload", "file too large (limit 50MB)").into());
    }

    let paths = state.layout.ensure_novel_dirs(&user_id, &novel_id)?;
    std::fs::write(&paths.source_file, &bytes).map_err(RuntimeError::from)?;

    let mut meta = serde_json::json!({ "filename": filename, "bytes": bytes.len() });
    if let Ok(text) = crate::text::read_text_file(&paths.source_file) {
        meta["char_count"] = text.chars().count().into();
        meta["line_count"] = text.lines().count().into();
    }

    state.novels.set_uploaded(&user_id, &novel_id, &meta)?;
    state.rp.invalidate(&novel_id);

    Ok(Json(UploadResponse {
        uploaded: true,
        novel_id,
        source: meta,
    }))
}

pub async fn chapter_index(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(novel_id): Path<String>,
) -> ApiResult<Json<ChapterIndex>> {
    let (user_id, _) = state.require_user(&headers)?;
    state.novels.assert_owner(&user_id, &novel_id)?;

    let paths = state.novels.paths(&novel_id)?;
    let index = ChapterIndex::load(&paths.chapters_dir)
        .map_err(|_| RuntimeError::NotFound("chapter index not found (run step 1 first)".into()))?;
    Ok(Json(index))
}

pub async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(novel_id): Path<String>,
    Json(spec): Json<PipelineRunSpec>,
) -> ApiResult<Json<Value>> {
    let (user_id, _) = state.require_user(&headers)?;
    state.novels.assert_owner(&user_id, &novel_id)?;
    spec.validate()?;

    let paths = state.novels.paths(&novel_id)?;
    std::fs::create_dir_all(&paths.log_dir).map_err(RuntimeError::from)?;

    let job = state.jobs.start(&novel_id, &user_id, spec, &paths.log_dir)?;
    Ok(Json(serde_json::to_value(job).map_err(RuntimeError::from)?))
}

// ---- jobs ----

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let (user_id, _) = state.require_user(&headers)?;
    let job = state.jobs.get(&job_id)?;
    if job.owner_user_id != user_id {
        return Err(RuntimeError::Forbidden.into());
    }
    Ok(Json(serde_json::to_value(job).map_err(RuntimeError::from)?))
}

pub async fn job_logs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    Query(query): Query<JobLogsQuery>,
) -> ApiResult<Json<JobLogsResponse>> {
    let (user_id, _) = state.require_user(&headers)?;
    let job = state.jobs.get(&job_id)?;
    if job.owner_user_id != user_id {
        return Err(RuntimeError::Forbidden.into());
    }

    let lines = query.lines.clamp(1, 2000);
    let text = state.jobs.tail_logs(&job_id, lines)?;
    Ok(Json(JobLogsResponse { job_id, lines, text }))
}

// ---- role-play ----

fn actor_scope(actor: &Actor) -> (Option<&str>, Option<&str>) {
    (actor.user_id(), actor.guest_id())
}

fn check_novel_access(state: &AppState, actor: &Actor, novel_id: &str) -> ApiResult<()> {
    if state.novels.can_read(actor.user_id(), novel_id)? {
        Ok(())
    } else {
        Err(RuntimeError::Forbidden.into())
    }
}

fn to_rp_request(body: &RpQueryRequest) -> RpRequest {
    RpRequest {
        message: body.message.clone(),
        session_id: body.session_id.clone(),
        unlocked_chapter: body.unlocked_chapter,
        active_characters: body.active_characters.clone(),
        recent_messages: body.recent_messages.as_ref().map(|turns| {
            turns
                .iter()
                .map(|t| HistoryTurn {
                    role: t.role.clone(),
                    content: t.content.clone(),
                })
                .collect()
        }),
    }
}

pub async fn rp_query_context(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RpQueryRequest>,
) -> ApiResult<Json<Value>> {
    let actor = state.require_actor(&headers)?;
    let novel_id = body
        .novel_id
        .clone()
        .ok_or_else(|| RuntimeError::invalid("novel_id", "is required"))?;
    check_novel_access(&state, &actor, &novel_id)?;

    let (user_id, guest_id) = actor_scope(&actor);
    let sessions = state.rp.session_store(user_id, guest_id, Some(&novel_id))?;
    let service = state.rp.get_service(&novel_id)?;

    let response = service.query_context(&sessions, &to_rp_request(&body)).await?;
    Ok(Json(serde_json::to_value(response).map_err(RuntimeError::from)?))
}

pub async fn rp_respond(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RpQueryRequest>,
) -> ApiResult<Json<Value>> {
    let actor = state.require_actor(&headers)?;
    let novel_id = body
        .novel_id
        .clone()
        .ok_or_else(|| RuntimeError::invalid("novel_id", "is required"))?;
    check_novel_access(&state, &actor, &novel_id)?;

    let (user_id, guest_id) = actor_scope(&actor);
    let sessions = state.rp.session_store(user_id, guest_id, Some(&novel_id))?;
    let service = state.rp.get_service(&novel_id)?;

    let response = service
        .respond(
            &sessions,
            &to_rp_request(&body),
            body.worldbook_context.clone(),
            body.citations.clone(),
        )
        .await?;
    Ok(Json(serde_json::to_value(response).map_err(RuntimeError::from)?))
}

pub async fn rp_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<Value>> {
    let actor = state.require_actor(&headers)?;
    if let Some(novel_id) = &query.novel_id {
        check_novel_access(&state, &actor, novel_id)?;
    }

    let (user_id, guest_id) = actor_scope(&actor);
    let sessions = state
        .rp
        .session_store(user_id, guest_id, query.novel_id.as_deref())?;
    let session = sessions.load(&session_id, 0);
    Ok(Json(serde_json::to_value(session).map_err(RuntimeError::from)?))
}
