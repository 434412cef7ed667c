// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This module loads a ruleset document and its term-list files into a
//! compiled [RulesetState].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    casefold, compile_pattern, normalize_category, term_pattern, Action, Matcher, RuleDefinition,
    RulesetState,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("ruleset not found: {0}")]
    MissingRuleset(PathBuf),

    #[error("list file not found: {0}")]
    MissingList(PathBuf),

    #[error("invalid file: {0}")]
    BadFile(#[from] std::io::Error),

    #[error("invalid json: {0}")]
    BadJSON(#[from] serde_json::Error),

    #[error("invalid yaml: {0}")]
    BadYAML(#[from] serde_yaml::Error),

    #[error("invalid csv: {0}")]
    BadCSV(#[from] csv::Error),

    #[error("unknown format: {0}")]
    UnknownFormat(String),
}

/// The raw ruleset document. Extra fields are ignored; booleans and
/// priorities default as documented.
#[derive(Deserialize)]
struct RulesetFile {
    #[serde(default = "default_version")]
    version: i64,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    never_reconcile_categories: Vec<String>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
    #[serde(default)]
    lists: Vec<ListEntry>,
}

fn default_version() -> i64 {
    1
}

fn default_mode() -> String {
    "enforce".to_string()
}

fn default_kind() -> String {
    "regex".to_string()
}

fn default_action() -> String {
    "tokenize".to_string()
}

fn default_priority() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct RuleEntry {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    #[serde(default)]
    pattern: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default = "default_action")]
    action: String,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default = "default_true")]
    word_boundary: bool,
    #[serde(default)]
    replacement: String,
}

#[derive(Deserialize)]
struct ListEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default = "default_action")]
    action: String,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default = "default_true")]
    word_boundary: bool,
    #[serde(default)]
    include_reversed_word_order: bool,
}

pub(crate) fn load(
    ruleset_file: &Path,
    rules_dir: &Path,
    default_never: &HashSet<String>,
) -> Result<RulesetState, Error> {
    let document = read_document(ruleset_file)?;
    let mut rules: Vec<RuleDefinition> = Vec::new();

    for entry in &document.rules {
        let id = if entry.id.is_empty() {
            format!("rule_{}", rules.len() + 1)
        } else {
            entry.id.clone()
        };
        // An unsupported type stays in the ruleset for counting but never
        // matches.
        let matcher = if entry.kind == "regex" {
            Matcher::Pattern(compile_pattern(&id, &entry.pattern, entry.case_sensitive))
        } else {
            tracing::warn!("{}: unsupported rule type {:?}", id, entry.kind);
            Matcher::Pattern(None)
        };
        rules.push(RuleDefinition {
            category: normalize_category(entry.category.as_deref().unwrap_or("GENERAL")),
            action: Action::from_name(&entry.action),
            priority: entry.priority,
            case_sensitive: entry.case_sensitive,
            word_boundary: entry.word_boundary,
            replacement: entry.replacement.clone(),
            matcher,
            id,
        });
    }

    let mut declared_sources: HashSet<String> = HashSet::new();
    for entry in &document.lists {
        if entry.source.is_empty() {
            continue;
        }
        declared_sources.insert(entry.source.clone());
        let list_path = rules_dir.join(&entry.source);
        let mut terms = load_terms(&list_path)?;
        if entry.include_reversed_word_order {
            terms = expand_reversed_word_order(terms);
        }
        let id = if entry.id.is_empty() {
            format!("list_{}", file_stem(&list_path))
        } else {
            entry.id.clone()
        };
        rules.push(RuleDefinition {
            category: normalize_category(entry.category.as_deref().unwrap_or("BUSINESS")),
            action: Action::from_name(&entry.action),
            priority: entry.priority,
            case_sensitive: entry.case_sensitive,
            word_boundary: entry.word_boundary,
            replacement: String::new(),
            matcher: compile_terms(&id, &terms, entry.case_sensitive, entry.word_boundary),
            id,
        });
    }

    // Every unreferenced term file under lists/ becomes a BUSINESS tokenize
    // rule. The category and priority are deliberate constants so the token
    // stream stays stable across reloads.
    let lists_dir = rules_dir.join("lists");
    if lists_dir.is_dir() {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&lists_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();
        for path in paths {
            let relative = path
                .strip_prefix(rules_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            if declared_sources.contains(&relative) {
                continue;
            }
            if !matches!(file_extension(&path).as_deref(), Some("txt" | "csv" | "json")) {
                continue;
            }
            let terms = load_terms(&path)?;
            if terms.is_empty() {
                continue;
            }
            let id = format!("auto_{}", file_stem(&path));
            rules.push(RuleDefinition {
                category: "BUSINESS".to_string(),
                action: Action::Tokenize,
                priority: 90,
                case_sensitive: false,
                word_boundary: true,
                replacement: String::new(),
                matcher: compile_terms(&id, &terms, false, true),
                id,
            });
        }
    }

    let mut never: HashSet<String> = document
        .never_reconcile_categories
        .iter()
        .map(|category| normalize_category(category))
        .collect();
    if never.is_empty() {
        never = default_never
            .iter()
            .map(|category| normalize_category(category))
            .collect();
    }

    Ok(RulesetState {
        version: document.version,
        mode: document.mode,
        never_reconcile: never,
        rules,
    })
}

fn read_document(path: &Path) -> Result<RulesetFile, Error> {
    if !path.is_file() {
        return Err(Error::MissingRuleset(path.into()));
    }
    let content = std::fs::read_to_string(path)?;
    match file_extension(path).as_deref() {
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&content)?),
        Some("json") => Ok(serde_json::from_str(&content)?),
        other => Err(Error::UnknownFormat(other.unwrap_or("").to_string())),
    }
}

fn file_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(std::ffi::OsStr::to_str)
        .map(str::to_ascii_lowercase)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("list")
        .to_string()
}

fn compile_terms(id: &str, terms: &[String], case_sensitive: bool, word_boundary: bool) -> Matcher {
    let patterns = terms
        .iter()
        .filter(|term| !term.is_empty())
        .filter_map(|term| compile_pattern(id, &term_pattern(term, word_boundary), case_sensitive))
        .collect();
    Matcher::Terms(patterns)
}

/// Read the terms of a list file. Supported formats: line-oriented text
/// with `#` comments, comma-separated cells, and JSON (an array of strings
/// or an object with a `terms` array). Deduplication is case-folded, first
/// occurrence keeps the display form.
fn load_terms(path: &Path) -> Result<Vec<String>, Error> {
    if !path.is_file() {
        return Err(Error::MissingList(path.into()));
    }
    let content = std::fs::read_to_string(path)?;
    let raw = match file_extension(path).as_deref() {
        Some("txt") => content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect(),
        Some("csv") => csv_terms(&content)?,
        Some("json") => json_terms(&content)?,
        other => return Err(Error::UnknownFormat(other.unwrap_or("").to_string())),
    };
    Ok(dedup_terms(raw))
}

fn csv_terms(content: &str) -> Result<Vec<String>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());
    let mut terms = Vec::new();
    for record in reader.records() {
        for cell in record?.iter() {
            let value = cell.trim();
            if !value.is_empty() {
                terms.push(value.to_string());
            }
        }
    }
    Ok(terms)
}

fn json_terms(content: &str) -> Result<Vec<String>, Error> {
    use serde_json::Value;
    let payload: Value = serde_json::from_str(content)?;
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("terms") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    Ok(items
        .into_iter()
        .map(|item| match item {
            Value::String(term) => term,
            other => other.to_string(),
        })
        .collect())
}

fn dedup_terms(terms: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut deduplicated = Vec::new();
    for term in terms {
        let normalized = term.trim();
        if normalized.is_empty() {
            continue;
        }
        if seen.insert(casefold(normalized)) {
            deduplicated.push(normalized.to_string());
        }
    }
    deduplicated
}

/// Augment every multi-word term with its reversed word order, unless the
/// reversed form is already present under case-folded equality.
fn expand_reversed_word_order(terms: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = terms.iter().map(|term| casefold(term)).collect();
    let mut expanded = terms.clone();
    for term in &terms {
        let parts: Vec<&str> = term.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let reversed = parts.iter().rev().copied().collect::<Vec<_>>().join(" ");
        if seen.insert(casefold(&reversed)) {
            expanded.push(reversed);
        }
    }
    expanded
}
