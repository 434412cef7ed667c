// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::Json;

use tokengate_engine::{ensure_default_rules, RuleEngine, Settings};
use tokengate_ledger::Ledger;
use tokengate_rules::TOKEN_RE;

use crate::database::Db;
use crate::gateway::Gateway;
use crate::routes::{self, App, ChatTurnResponse, MessageCreateRequest, SessionCreateRequest};

fn test_settings(dir: &Path) -> Settings {
    Settings {
        data_dir: dir.join("data"),
        rules_dir: dir.join("rules"),
        ruleset_file: dir.join("rules").join("ruleset.yaml"),
        db_path: dir.join("data").join("tokengate.sqlite"),
        token_secret: "test-secret".to_string(),
        token_ttl_days: 7,
        never_reconcile_categories: HashSet::from([
            "PII".to_string(),
            "SECRET".to_string(),
            "FINANCIAL".to_string(),
        ]),
        audit_enabled: false,
    }
}

fn mock_gateway() -> Gateway {
    Gateway {
        api_key: String::new(),
        base_url: "http://127.0.0.1:1".to_string(),
        default_model: "gpt-4o-mini".to_string(),
        models: vec!["gpt-4o-mini".to_string(), "gpt-4.1".to_string()],
    }
}

async fn test_app(dir: &Path, audit_enabled: bool, gateway: Gateway) -> App {
    let settings = test_settings(dir);
    ensure_default_rules(&settings).unwrap();
    let pool = tokengate_ledger::connect(&settings.db_path).await.unwrap();
    let ledger = Ledger::new(pool.clone(), &settings.token_secret, settings.token_ttl_days)
        .await
        .unwrap();
    let db = Db::new(pool).await.unwrap();
    let engine = RuleEngine::new(settings, ledger.clone()).unwrap();
    App {
        engine: Arc::new(engine),
        ledger,
        db,
        gateway: Arc::new(gateway),
        audit_enabled,
    }
}

async fn create_session(app: &App, title: &str) -> String {
    routes::session_create(
        State(app.clone()),
        Json(SessionCreateRequest {
            title: title.to_string(),
        }),
    )
    .await
    .unwrap()
    .0
    .id
}

async fn post_message(
    app: &App,
    session_id: &str,
    message: &str,
    model: Option<&str>,
) -> Result<ChatTurnResponse, (StatusCode, String)> {
    routes::message_post(
        State(app.clone()),
        UrlPath(session_id.to_string()),
        Json(MessageCreateRequest {
            message: message.to_string(),
            model: model.map(String::from),
        }),
    )
    .await
    .map(|json| json.0)
}

#[tokio::test]
async fn test_chat_turn_mock_flow() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), true, mock_gateway()).await;
    let session_id = create_session(&app, "E2E").await;

    let turn = post_message(
        &app,
        &session_id,
        "Contatta ACME S.p.A. via mario.rossi@example.com",
        None,
    )
    .await
    .unwrap();

    assert_eq!(turn.session_id, session_id);
    // The displayed user message is the sanitized one.
    assert!(turn.user_message.content.contains("<TKN_"));
    assert!(!turn.user_message.content.contains("mario.rossi"));
    assert_eq!(turn.assistant_message.role, "assistant");
    // The mock echoes the sanitized prompt: the business term comes back
    // reconciled, the PII token stays opaque.
    assert!(turn.assistant_message.content.contains("ACME S.p.A."));
    assert!(turn.assistant_message.content.contains("<TKN_PII_001>"));
    assert!(turn.sanitization["transformations"].as_u64().unwrap() >= 2);
    assert_eq!(turn.sanitization["tokens_reconciled"], 1);

    // The turn is audited.
    let audit_id = turn.audit_id.expect("audit event id");
    let event = routes::audit_get(State(app.clone()), UrlPath(audit_id))
        .await
        .unwrap()
        .0;
    assert_eq!(event["session_id"], serde_json::json!(session_id));
    assert!(event["rules_triggered"].is_array());
    assert_eq!(event["message_id"], serde_json::json!(turn.user_message.id));
}

#[tokio::test]
async fn test_messages_list_shows_sanitized_user_content() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), false, mock_gateway()).await;
    let session_id = create_session(&app, "History").await;

    post_message(&app, &session_id, "Email privacy@example.com", None)
        .await
        .unwrap();

    let messages = routes::messages_list(State(app.clone()), UrlPath(session_id))
        .await
        .unwrap()
        .0;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert!(TOKEN_RE.is_match(&messages[0].content));
    assert!(!messages[0].content.contains("privacy@example.com"));
    assert_eq!(messages[1].role, "assistant");
}

#[tokio::test]
async fn test_delete_session_purges_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), false, mock_gateway()).await;
    let session_id = create_session(&app, "ToDelete").await;

    let turn = post_message(&app, &session_id, "Client Enel requests support", None)
        .await
        .unwrap();
    let token = TOKEN_RE
        .find(&turn.user_message.content)
        .unwrap()
        .as_str()
        .to_string();

    let deleted = routes::session_delete(State(app.clone()), UrlPath(session_id.clone()))
        .await
        .unwrap()
        .0;
    assert_eq!(deleted["ok"], true);

    let listing = routes::messages_list(State(app.clone()), UrlPath(session_id.clone())).await;
    assert_eq!(listing.unwrap_err().0, StatusCode::NOT_FOUND);
    let sessions = routes::sessions_list(State(app.clone())).await.unwrap().0;
    assert!(sessions.iter().all(|session| session.id != session_id));

    // The token mapping is gone with the session.
    let reconciled = app.engine.reconcile(&session_id, &token).await.unwrap();
    assert_eq!(reconciled.missing_tokens, vec![token]);
}

#[tokio::test]
async fn test_default_title_is_replaced_after_first_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), false, mock_gateway()).await;
    let session_id = create_session(&app, "New chat").await;

    post_message(&app, &session_id, "Contract Enel annual supply", None)
        .await
        .unwrap();

    let sessions = routes::sessions_list(State(app.clone())).await.unwrap().0;
    let current = sessions
        .iter()
        .find(|session| session.id == session_id)
        .unwrap();
    assert_eq!(current.title, "Contract - Enel");
}

#[tokio::test]
async fn test_model_must_be_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), false, mock_gateway()).await;
    let session_id = create_session(&app, "Models").await;

    let err = post_message(&app, &session_id, "hello", Some("gpt-unknown"))
        .await
        .unwrap_err();
    assert_eq!(err.0, StatusCode::BAD_REQUEST);
    assert!(err.1.contains("gpt-unknown"));
}

#[tokio::test]
async fn test_audit_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), false, mock_gateway()).await;
    let session_id = create_session(&app, "NoAudit").await;

    let turn = post_message(&app, &session_id, "Secret sk-ABCDEFGHIJKLMNOPQRSTUV", None)
        .await
        .unwrap();
    assert!(turn.audit_id.is_none());
    assert_eq!(turn.sanitization["audit_enabled"], false);

    let missing = routes::audit_get(State(app.clone()), UrlPath("unknown".to_string())).await;
    assert_eq!(missing.unwrap_err().0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_validate_endpoint_reports_counts() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_app(dir.path(), false, mock_gateway()).await;

    let validation = routes::rules_validate(State(app.clone())).await.0;
    assert!(validation.ok);
    assert_eq!(validation.rule_count, 5);
    assert_eq!(validation.list_count, 2);

    let reloaded = routes::rules_reload(State(app)).await.0;
    assert!(reloaded.ok);
}

#[tokio::test]
async fn test_provider_reply_is_reconciled() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "choices": [{"message": {"content": "Update for <TKN_BUSINESS_001> sent"}}],
                "usage": {"prompt_tokens": 7, "completion_tokens": 5, "total_tokens": 12},
            })
            .to_string(),
        )
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway {
        api_key: "test-key".to_string(),
        base_url: server.url(),
        ..mock_gateway()
    };
    let app = test_app(dir.path(), false, gateway).await;
    let session_id = create_session(&app, "Live").await;

    let turn = post_message(&app, &session_id, "Client Enel requests support", None)
        .await
        .unwrap();
    assert_eq!(turn.assistant_message.content, "Update for Enel sent");
    assert_eq!(
        turn.assistant_message.metadata["provider_usage"]["total_tokens"],
        12
    );
}

#[tokio::test]
async fn test_provider_error_mapping() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(599)
        .with_body("upstream timeout")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway {
        api_key: "test-key".to_string(),
        base_url: server.url(),
        ..mock_gateway()
    };
    let app = test_app(dir.path(), false, gateway).await;
    let session_id = create_session(&app, "ProviderError").await;

    let err = post_message(&app, &session_id, "ping", None).await.unwrap_err();
    assert_eq!(err.0, StatusCode::BAD_GATEWAY);
    assert!(err.1.contains("upstream status: 599"));
}
