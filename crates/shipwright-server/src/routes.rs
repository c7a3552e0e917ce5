use std::sync::Arc;

use axum::{
    extract::{Form, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use shipwright_core::{
    command::{parse_chat_command, ChatCommand, PushEvent},
    report::usage,
};
use tracing::{info, warn};

use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Request body types ────────────────────────────────────────────────────

/// Slack outgoing-webhook form fields.
#[derive(Deserialize)]
pub(crate) struct ChatHookForm {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub text: String,
}

// ── Handlers ──────────────────────────────────────────────────────────────

pub(crate) async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn get_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.orchestrator.status();
    let watched: Vec<&str> = state
        .config
        .watched_repos
        .iter()
        .map(|r| r.name.as_str())
        .collect();
    Json(json!({
        "uptime_s": state.start_time.elapsed().as_secs(),
        "worker": status.worker,
        "queued": status.queued,
        "processed": status.processed,
        "watched_repos": watched,
    }))
}

pub(crate) async fn chat_hook(
    State(state): State<Arc<AppState>>,
    Form(form): Form<ChatHookForm>,
) -> Result<Json<Value>, StatusCode> {
    let config = &state.config;
    if !config.chat_token.is_empty() && form.token != config.chat_token {
        warn!(user = %form.user_name, "chat hook rejected: bad token");
        return Err(StatusCode::UNAUTHORIZED);
    }
    if form.user_name == config.bot_username {
        return Ok(Json(json!({})));
    }

    let channel = if form.channel_name.is_empty() {
        config.default_channel.clone()
    } else if form.channel_name.starts_with('#') {
        form.channel_name.clone()
    } else {
        format!("#{}", form.channel_name)
    };

    match parse_chat_command(&form.text, &config.command_prefix, &form.user_name, &channel) {
        None => Ok(Json(json!({}))),
        Some(ChatCommand::Usage) => Ok(Json(json!({ "text": usage(&config.command_prefix) }))),
        Some(ChatCommand::Task(task)) => {
            let action = task.action;
            let id = state.orchestrator.submit(task).map_err(internal)?;
            Ok(Json(json!({
                "text": format!("Queued {action} request #{id}"),
                "task_id": id,
            })))
        }
    }
}

pub(crate) async fn github_hook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match event {
        "ping" => Ok(Json(json!({ "status": "ok" }))),
        "push" => {
            let push: PushEvent = serde_json::from_value(payload).map_err(|e| {
                warn!("malformed push payload: {e}");
                StatusCode::BAD_REQUEST
            })?;
            let Some(task) = push.into_task(&state.config) else {
                return Ok(Json(json!({ "status": "ignored" })));
            };
            let id = state.orchestrator.submit(task).map_err(internal)?;
            Ok(Json(json!({ "status": "queued", "task_id": id })))
        }
        other => {
            info!(event = %other, "unhandled github event ignored");
            Ok(Json(json!({ "status": "ignored" })))
        }
    }
}
