// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This module contains the session, message and audit storage.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gateway::ChatMessage;

#[derive(Clone)]
pub struct Db(sqlx::SqlitePool);

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS chat_sessions (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chat_messages (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        sanitized_content TEXT NOT NULL,
        model TEXT,
        created_at TEXT NOT NULL,
        metadata_json TEXT
    )",
    "CREATE TABLE IF NOT EXISTS audit_events (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        session_id TEXT NOT NULL,
        message_id TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        rules_triggered_json TEXT NOT NULL,
        transformations INTEGER NOT NULL,
        tokens_created INTEGER NOT NULL,
        tokens_reconciled INTEGER NOT NULL,
        original_hash TEXT NOT NULL,
        details_json TEXT NOT NULL
    )",
];

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub sanitized_content: String,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata_json: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct AuditRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub session_id: String,
    pub message_id: String,
    pub correlation_id: String,
    pub rules_triggered_json: String,
    pub transformations: i64,
    pub tokens_created: i64,
    pub tokens_reconciled: i64,
    pub original_hash: String,
    pub details_json: String,
}

impl Db {
    pub async fn new(pool: sqlx::SqlitePool) -> sqlx::Result<Db> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Db(pool))
    }

    pub async fn create_session(&self, title: &str) -> sqlx::Result<SessionRow> {
        let session = SessionRow {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("insert into chat_sessions (id, title, created_at) values (?, ?, ?)")
            .bind(&session.id)
            .bind(&session.title)
            .bind(session.created_at)
            .execute(&self.0)
            .await?;
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> sqlx::Result<Option<SessionRow>> {
        sqlx::query_as::<_, SessionRow>(
            "select id, title, created_at from chat_sessions where id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.0)
        .await
    }

    pub async fn get_sessions(&self) -> sqlx::Result<Vec<SessionRow>> {
        sqlx::query_as::<_, SessionRow>(
            "select id, title, created_at from chat_sessions order by created_at desc",
        )
        .fetch_all(&self.0)
        .await
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> sqlx::Result<()> {
        sqlx::query("update chat_sessions set title = ? where id = ?")
            .bind(title)
            .bind(session_id)
            .execute(&self.0)
            .await
            .map(|_| ())
    }

    /// Remove the session with its messages and audit events. The token
    /// ledger is purged separately by the caller.
    pub async fn delete_session(&self, session_id: &str) -> sqlx::Result<()> {
        sqlx::query("delete from audit_events where session_id = ?")
            .bind(session_id)
            .execute(&self.0)
            .await?;
        sqlx::query("delete from chat_messages where session_id = ?")
            .bind(session_id)
            .execute(&self.0)
            .await?;
        sqlx::query("delete from chat_sessions where id = ?")
            .bind(session_id)
            .execute(&self.0)
            .await
            .map(|_| ())
    }

    pub async fn count_user_messages(&self, session_id: &str) -> sqlx::Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "select count(*) from chat_messages where session_id = ? and role = 'user'",
        )
        .bind(session_id)
        .fetch_one(&self.0)
        .await
    }

    pub async fn add_message(&self, message: &MessageRow) -> sqlx::Result<()> {
        sqlx::query(
            "insert into chat_messages (id, session_id, role, content, sanitized_content, model, created_at, metadata_json)
             values (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&message.sanitized_content)
        .bind(message.model.as_deref())
        .bind(message.created_at)
        .bind(message.metadata_json.as_deref())
        .execute(&self.0)
        .await
        .map(|_| ())
    }

    pub async fn get_messages(&self, session_id: &str) -> sqlx::Result<Vec<MessageRow>> {
        sqlx::query_as::<_, MessageRow>(
            "select * from chat_messages where session_id = ? order by created_at asc",
        )
        .bind(session_id)
        .fetch_all(&self.0)
        .await
    }

    /// The sanitized conversation so far, in provider wire order. Only
    /// sanitized content leaves the trust boundary.
    pub async fn sanitized_history(&self, session_id: &str) -> sqlx::Result<Vec<ChatMessage>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "select role, sanitized_content from chat_messages where session_id = ? order by created_at asc",
        )
        .bind(session_id)
        .fetch_all(&self.0)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(role, content)| ChatMessage { role, content })
            .collect())
    }

    pub async fn add_audit(&self, event: &AuditRow) -> sqlx::Result<()> {
        sqlx::query(
            "insert into audit_events (id, created_at, session_id, message_id, correlation_id,
                                       rules_triggered_json, transformations, tokens_created,
                                       tokens_reconciled, original_hash, details_json)
             values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(event.created_at)
        .bind(&event.session_id)
        .bind(&event.message_id)
        .bind(&event.correlation_id)
        .bind(&event.rules_triggered_json)
        .bind(event.transformations)
        .bind(event.tokens_created)
        .bind(event.tokens_reconciled)
        .bind(&event.original_hash)
        .bind(&event.details_json)
        .execute(&self.0)
        .await
        .map(|_| ())
    }

    pub async fn get_audit(&self, event_id: &str) -> sqlx::Result<Option<AuditRow>> {
        sqlx::query_as::<_, AuditRow>("select * from audit_events where id = ?")
            .bind(event_id)
            .fetch_optional(&self.0)
            .await
    }
}
