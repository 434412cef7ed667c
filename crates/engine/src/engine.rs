// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This library provides the core of the tokengate project: a rule engine
//! that sanitizes user text before it crosses the trust boundary and
//! reconciles provider output on the way back.
//!
//! The engine holds the compiled ruleset behind a mutex; callers snapshot
//! the state and scan without the lock. Reload builds a new state off to
//! the side and installs it with a single swap, so a broken ruleset edit
//! never takes down a running engine.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

use tokengate_ledger::{Ledger, LedgerError};
use tokengate_rules::{
    casefold, find_candidates, loader, resolve_overlaps, token_category, Action, RuleDefinition,
    RulesetState, TOKEN_RE,
};
use tokengate_secret::{anagram, hash_text, obfuscate};

pub mod settings;
pub use settings::{ensure_default_rules, Settings};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// The outcome of a forward sanitization pass.
#[derive(Debug, Serialize)]
pub struct SanitizationResult {
    pub original_text: String,
    pub sanitized_text: String,
    /// Sorted, unique ids of the rules that matched.
    pub rules_triggered: Vec<String>,
    /// Number of accepted matches.
    pub transformations: usize,
    /// New ledger entries created by this call.
    pub tokens_created: usize,
    /// Distinct source values that were tokenized, in encounter order.
    pub encoded_values: Vec<String>,
    pub original_hash: String,
}

impl SanitizationResult {
    fn unchanged(text: &str, original_hash: String) -> SanitizationResult {
        SanitizationResult {
            original_text: text.to_string(),
            sanitized_text: text.to_string(),
            rules_triggered: Vec::new(),
            transformations: 0,
            tokens_created: 0,
            encoded_values: Vec::new(),
            original_hash,
        }
    }
}

/// The outcome of a reconcile pass over provider output.
#[derive(Debug, Serialize)]
pub struct Reconciliation {
    pub restored_text: String,
    pub replaced_count: usize,
    /// Tokens with no live mapping, left verbatim.
    pub missing_tokens: Vec<String>,
    /// Distinct decoded values, in replacement order.
    pub decoded_values: Vec<String>,
}

/// The contract of the validate and reload admin operations.
#[derive(Debug, Serialize)]
pub struct Validation {
    pub ok: bool,
    pub rule_count: usize,
    pub list_count: usize,
    pub message: String,
}

pub struct RuleEngine {
    settings: Settings,
    ledger: Ledger,
    state: Mutex<Arc<RulesetState>>,
}

impl RuleEngine {
    /// Build the engine with its dependencies injected, loading the initial
    /// ruleset. A broken ruleset fails construction.
    pub fn new(settings: Settings, ledger: Ledger) -> Result<RuleEngine, loader::Error> {
        let state = RulesetState::load(
            &settings.ruleset_file,
            &settings.rules_dir,
            &settings.never_reconcile_categories,
        )?;
        Ok(RuleEngine {
            settings,
            ledger,
            state: Mutex::new(Arc::new(state)),
        })
    }

    /// The current ruleset snapshot. The lock is held only long enough to
    /// clone the reference.
    pub fn snapshot(&self) -> Arc<RulesetState> {
        self.state.lock().unwrap().clone()
    }

    /// Rebuild the ruleset from disk and swap it in. Failure leaves the
    /// previous state installed.
    pub fn reload(&self) -> Result<(), loader::Error> {
        let state = RulesetState::load(
            &self.settings.ruleset_file,
            &self.settings.rules_dir,
            &self.settings.never_reconcile_categories,
        )?;
        *self.state.lock().unwrap() = Arc::new(state);
        Ok(())
    }

    pub fn validate(&self) -> Validation {
        match self.reload() {
            Ok(()) => {
                let (rule_count, list_count) = self.snapshot().rule_counts();
                Validation {
                    ok: true,
                    rule_count,
                    list_count,
                    message: "Valid ruleset".to_string(),
                }
            }
            Err(err) => {
                tracing::warn!("ruleset reload failed: {}", err);
                Validation {
                    ok: false,
                    rule_count: 0,
                    list_count: 0,
                    message: err.to_string(),
                }
            }
        }
    }

    /// Replace every accepted match in `text` with its action result.
    pub async fn sanitize(
        &self,
        session: &str,
        text: &str,
    ) -> Result<SanitizationResult, EngineError> {
        let original_hash = hash_text(text);
        if text.is_empty() {
            return Ok(SanitizationResult::unchanged(text, original_hash));
        }

        let state = self.snapshot();
        let accepted = resolve_overlaps(find_candidates(text, &state.rules));
        if accepted.is_empty() {
            return Ok(SanitizationResult::unchanged(text, original_hash));
        }

        let mut sanitized = String::with_capacity(text.len());
        let mut cursor = 0;
        let mut triggered = BTreeSet::new();
        let mut tokens_created = 0;
        let mut encoded_values = Vec::new();
        let mut encoded_seen = HashSet::new();
        let transformations = accepted.len();

        for matched in &accepted {
            sanitized.push_str(&text[cursor..matched.start]);
            let (replacement, created) = self
                .apply_action(session, matched.rule, matched.value)
                .await?;
            sanitized.push_str(&replacement);
            cursor = matched.end;
            triggered.insert(matched.rule.id.clone());
            if created {
                tokens_created += 1;
            }
            if matched.rule.action == Action::Tokenize
                && encoded_seen.insert(casefold(matched.value))
            {
                encoded_values.push(matched.value.to_string());
            }
        }
        sanitized.push_str(&text[cursor..]);

        Ok(SanitizationResult {
            original_text: text.to_string(),
            sanitized_text: sanitized,
            rules_triggered: triggered.into_iter().collect(),
            transformations,
            tokens_created,
            encoded_values,
            original_hash,
        })
    }

    async fn apply_action(
        &self,
        session: &str,
        rule: &RuleDefinition,
        value: &str,
    ) -> Result<(String, bool), EngineError> {
        let applied = match rule.action {
            Action::Replace => {
                let replacement = if rule.replacement.is_empty() {
                    format!("[{}]", rule.category)
                } else {
                    rule.replacement.clone()
                };
                (replacement, false)
            }
            Action::Anagram => (anagram(value, &self.settings.token_secret), false),
            Action::Obfuscate => (
                format!("ENC[{}]", obfuscate(value, &self.settings.token_secret)),
                false,
            ),
            Action::Tokenize => {
                self.ledger
                    .get_or_create(session, value, &rule.category)
                    .await?
            }
            Action::Keep => (value.to_string(), false),
        };
        Ok(applied)
    }

    /// Restore the tokens of `text` to their original values, leaving
    /// never-reconcile categories and unknown or expired tokens verbatim.
    pub async fn reconcile(
        &self,
        session: &str,
        text: &str,
    ) -> Result<Reconciliation, EngineError> {
        let mut result = Reconciliation {
            restored_text: text.to_string(),
            replaced_count: 0,
            missing_tokens: Vec::new(),
            decoded_values: Vec::new(),
        };
        if text.is_empty() {
            return Ok(result);
        }
        let state = self.snapshot();

        let unique: BTreeSet<&str> = TOKEN_RE.find_iter(text).map(|m| m.as_str()).collect();
        let mut tokens: Vec<&str> = unique.into_iter().collect();
        // Longest first so a token cannot shadow another one that shares
        // its prefix during plain substring replacement.
        tokens.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));

        let mut decoded_seen = HashSet::new();
        for token in tokens {
            let category = token_category(token).unwrap_or("");
            if state.never_reconciles(category) {
                continue;
            }
            let value = match self.ledger.lookup(session, token).await? {
                Some(value) => value,
                None => {
                    result.missing_tokens.push(token.to_string());
                    continue;
                }
            };
            let occurrences = result.restored_text.matches(token).count();
            if occurrences == 0 {
                continue;
            }
            // Decoded plaintext is terminal: the replaced text is not
            // rescanned for further tokens.
            result.restored_text = result.restored_text.replace(token, &value);
            result.replaced_count += occurrences;
            if decoded_seen.insert(casefold(&value)) {
                result.decoded_values.push(value);
            }
        }

        Ok(result)
    }
}
