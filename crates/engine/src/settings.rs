// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This module provides the environment-sourced configuration and the
//! default rules bootstrap.

use std::collections::HashSet;
use std::path::PathBuf;

fn env_str(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var_os(key).map(PathBuf::from).unwrap_or(default)
}

fn env_int(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect(),
        _ => default.iter().map(|item| item.to_string()).collect(),
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub rules_dir: PathBuf,
    pub ruleset_file: PathBuf,
    pub db_path: PathBuf,
    pub token_secret: String,
    pub token_ttl_days: i64,
    /// Application fallback when the ruleset omits the policy set.
    pub never_reconcile_categories: HashSet<String>,
    pub audit_enabled: bool,
}

impl Settings {
    pub fn from_env() -> Settings {
        let data_dir = env_path("DATA_DIR", "data".into());
        let rules_dir = env_path("RULES_DIR", "rules".into());
        Settings {
            ruleset_file: env_path("RULESET_FILE", rules_dir.join("ruleset.yaml")),
            db_path: env_path("DB_PATH", data_dir.join("tokengate.sqlite")),
            token_secret: env_str("TOKEN_SECRET", "local-dev-secret"),
            token_ttl_days: env_int("TOKEN_TTL_DAYS", 7),
            never_reconcile_categories: env_list(
                "NEVER_RECONCILE_CATEGORIES",
                &["PII", "SECRET", "FINANCIAL"],
            )
            .into_iter()
            .collect(),
            audit_enabled: env_bool("AUDIT_ENABLED", false),
            data_dir,
            rules_dir,
        }
    }
}

const DEFAULT_RULESET: &str = r#"version: 1
mode: enforce
never_reconcile_categories:
  - PII
  - SECRET
  - FINANCIAL
rules:
  - id: email_regex
    type: regex
    pattern: '\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b'
    category: PII
    action: tokenize
    priority: 120
  - id: phone_regex
    type: regex
    pattern: '\b(?:\+?\d{1,3}[\s.-]?)?(?:\(?\d{2,4}\)?[\s.-]?)?\d{3,4}[\s.-]?\d{3,4}\b'
    category: PII
    action: tokenize
    priority: 110
  - id: api_key_regex
    type: regex
    pattern: '\b(?:sk-[A-Za-z0-9]{20,}|AIza[0-9A-Za-z_\-]{20,})\b'
    category: SECRET
    action: tokenize
    priority: 130
lists:
  - id: clients
    source: lists/clients.txt
    category: BUSINESS
    action: tokenize
    priority: 95
  - id: names
    source: lists/names.txt
    category: BUSINESS
    action: tokenize
    priority: 95
    include_reversed_word_order: true
"#;

const DEFAULT_CLIENTS: &str =
    "# One client per line; matching is case-insensitive.\nACME S.p.A.\nUmbex SRL\nDemo Client\nEnel\n";

const DEFAULT_NAMES: &str = "Marco Rossi\nEmily Davis\n";

/// Create the rules directory with the default ruleset and seed lists when
/// they are missing, so a fresh deployment starts with a working policy.
pub fn ensure_default_rules(settings: &Settings) -> std::io::Result<()> {
    std::fs::create_dir_all(settings.rules_dir.join("lists"))?;
    if !settings.ruleset_file.is_file() {
        std::fs::write(&settings.ruleset_file, DEFAULT_RULESET)?;
    }
    let clients = settings.rules_dir.join("lists/clients.txt");
    if !clients.is_file() {
        std::fs::write(&clients, DEFAULT_CLIENTS)?;
    }
    let names = settings.rules_dir.join("lists/names.txt");
    if !names.is_file() {
        std::fs::write(&names, DEFAULT_NAMES)?;
    }
    Ok(())
}
