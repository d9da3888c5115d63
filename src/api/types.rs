//! Request and response bodies for the HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rp::Citation;

/// Uniform error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    #[serde(rename = "type")]
    pub actor_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateNovelRequest {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateNovelRequest {
    pub title: Option<String>,
    pub visibility: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteNovelQuery {
    #[serde(default)]
    pub delete_vector_db: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub uploaded: bool,
    pub novel_id: String,
    pub source: Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct JobLogsQuery {
    #[serde(default = "default_log_lines")]
    pub lines: usize,
}

fn default_log_lines() -> usize {
    200
}

#[derive(Debug, Serialize)]
pub struct JobLogsResponse {
    pub job_id: String,
    pub lines: usize,
    pub text: String,
}

/// Shared body of the two RP endpoints; `respond` additionally accepts a
/// previously returned worldbook and citations.
#[derive(Debug, Deserialize)]
pub struct RpQueryRequest {
    pub message: String,
    pub session_id: String,
    #[serde(default)]
    pub novel_id: Option<String>,
    #[serde(default)]
    pub unlocked_chapter: Option<i64>,
    #[serde(default)]
    pub active_characters: Option<Vec<String>>,
    #[serde(default)]
    pub recent_messages: Option<Vec<RpHistoryTurn>>,
    #[serde(default)]
    pub worldbook_context: Option<Value>,
    #[serde(default)]
    pub citations: Option<Vec<Citation>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpHistoryTurn {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct SessionQuery {
    #[serde(default)]
    pub novel_id: Option<String>,
}
