// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This module contains the http handler logic.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tokengate_engine::{RuleEngine, Validation};
use tokengate_ledger::Ledger;

use crate::database::{AuditRow, Db, MessageRow};
use crate::gateway::{Gateway, GatewayError};

type Error = (StatusCode, String);
type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
pub struct App {
    pub engine: Arc<RuleEngine>,
    pub ledger: Ledger,
    pub db: Db,
    pub gateway: Arc<Gateway>,
    pub audit_enabled: bool,
}

fn handle_db_error(err: sqlx::Error) -> Error {
    tracing::error!("DB error: {}", err);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        format!("Database error {}", err),
    )
}

fn handle_engine_error(err: tokengate_engine::EngineError) -> Error {
    tracing::error!("Engine error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Engine error {}", err),
    )
}

fn handle_gateway_error(err: GatewayError, model: &str) -> Error {
    let status = match &err {
        GatewayError::Upstream { status, .. } => match status {
            400 | 401 | 403 | 404 | 422 => StatusCode::BAD_REQUEST,
            429 => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_GATEWAY,
        },
        _ => StatusCode::BAD_GATEWAY,
    };
    let detail = match &err {
        GatewayError::Upstream { status, message } => format!(
            "LLM provider error for model '{}' (upstream status: {}): {}",
            model, status, message
        ),
        other => format!("LLM provider error for model '{}': {}", model, other),
    };
    tracing::warn!("{}", detail);
    (status, detail)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

pub async fn models_list(State(app): State<App>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "default": app.gateway.default_model,
        "models": app.gateway.models,
    }))
}

pub async fn config_get(State(app): State<App>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "app_version": env!("CARGO_PKG_VERSION"),
        "audit_enabled": app.audit_enabled,
        "default_model": app.gateway.default_model,
        "available_models": app.gateway.models,
        "mock_mode": app.gateway.is_mock_mode(),
    }))
}

#[derive(Deserialize)]
pub struct SessionCreateRequest {
    #[serde(default)]
    pub title: String,
}

pub async fn session_create(
    State(app): State<App>,
    Json(request): Json<SessionCreateRequest>,
) -> Result<Json<crate::database::SessionRow>> {
    let title = request.title.trim();
    let title = if title.is_empty() { "New chat" } else { title };
    let session = app.db.create_session(title).await.map_err(handle_db_error)?;
    Ok(Json(session))
}

pub async fn sessions_list(
    State(app): State<App>,
) -> Result<Json<Vec<crate::database::SessionRow>>> {
    let sessions = app.db.get_sessions().await.map_err(handle_db_error)?;
    Ok(Json(sessions))
}

pub async fn session_delete(
    State(app): State<App>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    if app
        .db
        .get_session(&session_id)
        .await
        .map_err(handle_db_error)?
        .is_none()
    {
        return Err((StatusCode::NOT_FOUND, "Session not found".into()));
    }
    app.db
        .delete_session(&session_id)
        .await
        .map_err(handle_db_error)?;
    app.ledger
        .delete_session(&session_id)
        .await
        .map_err(|err| handle_engine_error(err.into()))?;
    Ok(Json(
        serde_json::json!({"ok": true, "session_id": session_id}),
    ))
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: String,
    pub role: String,
    pub content: String,
    pub created_at: chrono::DateTime<Utc>,
    pub model: Option<String>,
    pub metadata: serde_json::Value,
}

/// Users see their sanitized text, assistants their reconciled text; the
/// raw forms stay in storage.
fn to_message_response(row: MessageRow) -> MessageResponse {
    let content = if row.role == "user" {
        row.sanitized_content
    } else {
        row.content
    };
    let metadata = row
        .metadata_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    MessageResponse {
        id: row.id,
        role: row.role,
        content,
        created_at: row.created_at,
        model: row.model,
        metadata,
    }
}

pub async fn messages_list(
    State(app): State<App>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<MessageResponse>>> {
    if app
        .db
        .get_session(&session_id)
        .await
        .map_err(handle_db_error)?
        .is_none()
    {
        return Err((StatusCode::NOT_FOUND, "Session not found".into()));
    }
    let rows = app
        .db
        .get_messages(&session_id)
        .await
        .map_err(handle_db_error)?;
    Ok(Json(rows.into_iter().map(to_message_response).collect()))
}

#[derive(Deserialize)]
pub struct MessageCreateRequest {
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatTurnResponse {
    pub session_id: String,
    pub user_message: MessageResponse,
    pub assistant_message: MessageResponse,
    pub sanitization: serde_json::Value,
    pub audit_id: Option<String>,
}

lazy_static! {
    static ref TITLE_WORD_RE: Regex = Regex::new(r"[A-Za-z0-9À-ÖØ-öø-ÿ]+").unwrap();
}

const TITLE_STOPWORDS: [&str; 18] = [
    "a", "an", "and", "at", "by", "for", "from", "in", "into", "is", "of", "on", "or", "that",
    "the", "this", "to", "with",
];

fn is_default_title(title: &str) -> bool {
    matches!(
        title.trim().to_lowercase().as_str(),
        "" | "new chat"
    )
}

/// Two significant keywords of the first prompt, joined for display.
fn title_from_prompt(prompt: &str) -> Option<String> {
    let mut keywords: Vec<&str> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for word in TITLE_WORD_RE.find_iter(prompt).map(|m| m.as_str()) {
        let normalized = word.to_lowercase();
        if normalized.chars().count() <= 2
            || TITLE_STOPWORDS.contains(&normalized.as_str())
            || !seen.insert(normalized)
        {
            continue;
        }
        keywords.push(word);
        if keywords.len() == 2 {
            break;
        }
    }
    if keywords.is_empty() {
        None
    } else {
        Some(keywords.join(" - "))
    }
}

pub async fn message_post(
    State(app): State<App>,
    Path(session_id): Path<String>,
    Json(request): Json<MessageCreateRequest>,
) -> Result<Json<ChatTurnResponse>> {
    let session = app
        .db
        .get_session(&session_id)
        .await
        .map_err(handle_db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Session not found".to_string()))?;

    let model = request
        .model
        .unwrap_or_else(|| app.gateway.default_model.clone());
    if !app.gateway.models.contains(&model) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Model not allowed: {}", model),
        ));
    }

    let sanitized = app
        .engine
        .sanitize(&session_id, &request.message)
        .await
        .map_err(handle_engine_error)?;

    let first_user_turn = app
        .db
        .count_user_messages(&session_id)
        .await
        .map_err(handle_db_error)?
        == 0;
    if first_user_turn && is_default_title(&session.title) {
        if let Some(title) = title_from_prompt(&request.message) {
            app.db
                .rename_session(&session_id, &title)
                .await
                .map_err(handle_db_error)?;
        }
    }

    let user_metadata = serde_json::json!({
        "sanitized": true,
        "rules_triggered": sanitized.rules_triggered,
        "tokens_created": sanitized.tokens_created,
    });
    let user_row = MessageRow {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session_id.clone(),
        role: "user".to_string(),
        content: sanitized.original_text.clone(),
        sanitized_content: sanitized.sanitized_text.clone(),
        model: Some(model.clone()),
        created_at: Utc::now(),
        metadata_json: Some(user_metadata.to_string()),
    };
    app.db.add_message(&user_row).await.map_err(handle_db_error)?;

    let history = app
        .db
        .sanitized_history(&session_id)
        .await
        .map_err(handle_db_error)?;
    let (raw_reply, usage) = app
        .gateway
        .chat(history, &model)
        .await
        .map_err(|err| handle_gateway_error(err, &model))?;

    let reconciled = app
        .engine
        .reconcile(&session_id, &raw_reply)
        .await
        .map_err(handle_engine_error)?;

    let assistant_metadata = serde_json::json!({
        "reconciled": true,
        "tokens_reconciled": reconciled.replaced_count,
        "missing_tokens": reconciled.missing_tokens,
        "provider_usage": usage,
        "mock_mode": app.gateway.is_mock_mode(),
    });
    let assistant_row = MessageRow {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session_id.clone(),
        role: "assistant".to_string(),
        content: reconciled.restored_text.clone(),
        sanitized_content: raw_reply,
        model: Some(model.clone()),
        created_at: Utc::now(),
        metadata_json: Some(assistant_metadata.to_string()),
    };
    app.db
        .add_message(&assistant_row)
        .await
        .map_err(handle_db_error)?;

    let audit_id = if app.audit_enabled {
        let event = AuditRow {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            session_id: session_id.clone(),
            message_id: user_row.id.clone(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            rules_triggered_json: serde_json::json!(sanitized.rules_triggered).to_string(),
            transformations: sanitized.transformations as i64,
            tokens_created: sanitized.tokens_created as i64,
            tokens_reconciled: reconciled.replaced_count as i64,
            original_hash: sanitized.original_hash.clone(),
            details_json: serde_json::json!({
                "model": model,
                "provider_usage": assistant_metadata["provider_usage"],
                "missing_tokens": assistant_metadata["missing_tokens"],
            })
            .to_string(),
        };
        app.db.add_audit(&event).await.map_err(handle_db_error)?;
        Some(event.id)
    } else {
        None
    };

    let sanitization = serde_json::json!({
        "rules_triggered": sanitized.rules_triggered,
        "transformations": sanitized.transformations,
        "tokens_created": sanitized.tokens_created,
        "tokens_reconciled": reconciled.replaced_count,
        "audit_enabled": app.audit_enabled,
    });

    Ok(Json(ChatTurnResponse {
        session_id,
        user_message: to_message_response(user_row),
        assistant_message: to_message_response(assistant_row),
        sanitization,
        audit_id,
    }))
}

pub async fn rules_validate(State(app): State<App>) -> Json<Validation> {
    Json(app.engine.validate())
}

pub async fn rules_reload(State(app): State<App>) -> Json<Validation> {
    Json(app.engine.validate())
}

pub async fn audit_get(
    State(app): State<App>,
    Path(event_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    if !app.audit_enabled {
        return Err((StatusCode::NOT_FOUND, "Audit logging is disabled".into()));
    }
    let event = app
        .db
        .get_audit(&event_id)
        .await
        .map_err(handle_db_error)?
        .ok_or((StatusCode::NOT_FOUND, "Audit event not found".to_string()))?;
    let rules_triggered: serde_json::Value =
        serde_json::from_str(&event.rules_triggered_json).unwrap_or_default();
    let details: serde_json::Value =
        serde_json::from_str(&event.details_json).unwrap_or_default();
    Ok(Json(serde_json::json!({
        "id": event.id,
        "created_at": event.created_at,
        "session_id": event.session_id,
        "message_id": event.message_id,
        "correlation_id": event.correlation_id,
        "rules_triggered": rules_triggered,
        "transformations": event.transformations,
        "tokens_created": event.tokens_created,
        "tokens_reconciled": event.tokens_reconciled,
        "original_hash": event.original_hash,
        "details": details,
    })))
}
