// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This library provides the token ledger: the persistent, session-scoped
//! mapping between tokens and the values they stand for. The ledger is what
//! makes sanitization reversible.
//!
//! Rows never hold plaintext; the value is stored obfuscated and is only
//! decoded by [Ledger::lookup] while the row is still live.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use thiserror::Error;

use tokengate_rules::{casefold, format_token, normalize_category};
use tokengate_secret::{deobfuscate, hash_text, obfuscate, CipherError};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("token allocation conflict for session {0}")]
    Conflict(String),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS token_mappings (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    token TEXT NOT NULL,
    value_hash TEXT NOT NULL,
    value_cipher TEXT NOT NULL,
    category TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    UNIQUE(session_id, token),
    UNIQUE(session_id, value_hash, category)
)";

/// Open the sqlite pool backing the ledger, creating the parent directory
/// and the database file when needed.
pub async fn connect(db_path: &Path) -> sqlx::Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
    }
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    SqlitePoolOptions::new().connect(&db_url).await
}

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    secret: Arc<str>,
    ttl_days: i64,
    /// Serializes the read-then-insert of get_or_create so two concurrent
    /// calls cannot allocate the same sequence number.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(sqlx::FromRow)]
struct MappingRow {
    value_cipher: String,
    expires_at: DateTime<Utc>,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl Ledger {
    pub async fn new(pool: SqlitePool, secret: &str, ttl_days: i64) -> Result<Ledger, LedgerError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Ledger {
            pool,
            secret: secret.into(),
            ttl_days,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Return the stable token for `(session, value, category)`, allocating
    /// a new one when the value was not seen before. The boolean reports
    /// whether this call created the mapping.
    pub async fn get_or_create(
        &self,
        session: &str,
        value: &str,
        category: &str,
    ) -> Result<(String, bool), LedgerError> {
        let category = normalize_category(category);
        let value_hash = hash_text(&format!("{}|{}", category, casefold(value.trim())));
        let _guard = self.write_lock.lock().await;

        match self.allocate(session, value, &category, &value_hash).await {
            Err(LedgerError::Db(err)) if is_unique_violation(&err) => {
                // A concurrent writer allocated the same sequence number
                // before our insert landed; re-read and retry once.
                tracing::warn!(session, category = category.as_str(), "token allocation raced");
                match self.allocate(session, value, &category, &value_hash).await {
                    Err(LedgerError::Db(err)) if is_unique_violation(&err) => {
                        tracing::error!(session, "token allocation conflict persisted");
                        Err(LedgerError::Conflict(session.to_string()))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn allocate(
        &self,
        session: &str,
        value: &str,
        category: &str,
        value_hash: &str,
    ) -> Result<(String, bool), LedgerError> {
        let existing = sqlx::query_scalar::<_, String>(
            "select token from token_mappings where session_id = ? and value_hash = ? and category = ?",
        )
        .bind(session)
        .bind(value_hash)
        .bind(category)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(token) = existing {
            return Ok((token, false));
        }

        let count = sqlx::query_scalar::<_, i64>(
            "select count(*) from token_mappings where session_id = ? and category = ?",
        )
        .bind(session)
        .bind(category)
        .fetch_one(&self.pool)
        .await?;
        let token = format_token(category, count + 1);

        let now = Utc::now();
        let expires = now + Duration::days(self.ttl_days);
        sqlx::query(
            "insert into token_mappings (id, session_id, token, value_hash, value_cipher, category, created_at, expires_at)
             values (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(session)
        .bind(&token)
        .bind(value_hash)
        .bind(obfuscate(value, &self.secret))
        .bind(category)
        .bind(now)
        .bind(expires)
        .execute(&self.pool)
        .await?;
        Ok((token, true))
    }

    /// Decode the value a token stands for. Expired and unknown mappings
    /// are both reported as absent.
    pub async fn lookup(&self, session: &str, token: &str) -> Result<Option<String>, LedgerError> {
        let row = sqlx::query_as::<_, MappingRow>(
            "select value_cipher, expires_at from token_mappings where session_id = ? and token = ?",
        )
        .bind(session)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) if row.expires_at > Utc::now() => {
                Ok(Some(deobfuscate(&row.value_cipher, &self.secret)?))
            }
            _ => Ok(None),
        }
    }

    /// Remove every mapping of a session.
    pub async fn delete_session(&self, session: &str) -> Result<(), LedgerError> {
        sqlx::query("delete from token_mappings where session_id = ?")
            .bind(session)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
