// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This module contains the HTTP logic.

use std::sync::Arc;

use axum::routing::{delete, get, post};
use tower_http::trace::{self, TraceLayer};

use tokengate_engine::{ensure_default_rules, RuleEngine, Settings};
use tokengate_ledger::Ledger;

mod database;
mod gateway;
mod routes;
#[cfg(test)]
mod tests;

fn setup_logging() {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = match std::env::var_os("TOKENGATE_LOG") {
        None => tracing_subscriber::filter::EnvFilter::from_default_env()
            .add_directive("tokengate_api=info".parse().unwrap()),
        Some(_) => tracing_subscriber::filter::EnvFilter::from_env("TOKENGATE_LOG"),
    };

    let fmt = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry().with(filter).with(fmt).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    let settings = Settings::from_env();
    ensure_default_rules(&settings)?;

    let pool = tokengate_ledger::connect(&settings.db_path).await?;
    let ledger = Ledger::new(pool.clone(), &settings.token_secret, settings.token_ttl_days).await?;
    let db = database::Db::new(pool).await?;
    let engine = RuleEngine::new(settings.clone(), ledger.clone())?;
    let (rule_count, list_count) = engine.snapshot().rule_counts();
    tracing::info!(rule_count, list_count, "loaded ruleset");

    let gateway = gateway::Gateway::from_env();
    if gateway.is_mock_mode() {
        tracing::warn!("no provider key configured, replies are mocked");
    }

    let app = routes::App {
        engine: Arc::new(engine),
        ledger,
        db,
        gateway: Arc::new(gateway),
        audit_enabled: settings.audit_enabled,
    };

    let router = axum::Router::new()
        .route("/health", get(routes::health))
        .route("/api/models", get(routes::models_list))
        .route("/api/config", get(routes::config_get))
        .route(
            "/api/chat/sessions",
            post(routes::session_create).get(routes::sessions_list),
        )
        .route(
            "/api/chat/sessions/{session_id}",
            delete(routes::session_delete),
        )
        .route(
            "/api/chat/sessions/{session_id}/messages",
            get(routes::messages_list).post(routes::message_post),
        )
        .route("/api/rulesets/validate", post(routes::rules_validate))
        .route("/api/rules/reload", post(routes::rules_reload))
        .route("/api/audit/events/{event_id}", get(routes::audit_get))
        .with_state(app)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        );

    let addr = std::env::var("TOKENGATE_LISTEN").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
