// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This library provides the redaction ruleset for the tokengate project:
//! loading declarative rule documents, compiling them, and selecting the
//! matches to rewrite in a text.
//!
//! The entry points are [RulesetState::load] to build a compiled ruleset,
//! [find_candidates] to collect every rule hit in a text, and
//! [resolve_overlaps] to pick the non-overlapping subset that the sanitizer
//! rewrites.

use std::collections::HashSet;
use std::path::Path;

use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};

pub mod loader;

lazy_static! {
    /// The wire-observable token grammar. Consumers may rely on this shape
    /// to recognize tokens embedded in provider output.
    pub static ref TOKEN_RE: Regex = Regex::new(r"<TKN_[A-Z0-9_]+_[0-9]{3}>").unwrap();
    static ref TOKEN_PARTS_RE: Regex = Regex::new(r"^<TKN_([A-Z0-9_]+)_([0-9]{3})>$").unwrap();
    static ref CATEGORY_RE: Regex = Regex::new(r"[^A-Za-z0-9]+").unwrap();
}

/// Normalize a category tag: uppercase, runs of non-alphanumeric characters
/// collapse to `_`, leading and trailing `_` are trimmed, and an empty
/// result falls back to `GENERIC`.
pub fn normalize_category(category: &str) -> String {
    let upper = category.to_uppercase();
    let cleaned = CATEGORY_RE.replace_all(&upper, "_");
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "GENERIC".to_string()
    } else {
        cleaned.to_string()
    }
}

#[test]
fn test_normalize_category() {
    assert_eq!(normalize_category("pii"), "PII");
    assert_eq!(normalize_category(" business unit "), "BUSINESS_UNIT");
    assert_eq!(normalize_category("--"), "GENERIC");
    assert_eq!(normalize_category(""), "GENERIC");
}

/// Format the token for a category sequence number.
pub fn format_token(category: &str, seq: i64) -> String {
    format!("<TKN_{}_{:03}>", category, seq)
}

/// Extract the category segment of a well-formed token.
pub fn token_category(token: &str) -> Option<&str> {
    TOKEN_PARTS_RE
        .captures(token)
        .and_then(|captures| captures.get(1))
        .map(|segment| segment.as_str())
}

#[test]
fn test_token_grammar() {
    let token = format_token("BUSINESS", 1);
    assert_eq!(token, "<TKN_BUSINESS_001>");
    assert!(TOKEN_RE.is_match(&token));
    assert_eq!(token_category(&token), Some("BUSINESS"));
    // The category segment may itself contain underscores.
    assert_eq!(token_category("<TKN_BUSINESS_UNIT_042>"), Some("BUSINESS_UNIT"));
    assert_eq!(token_category("<TKN_lower_001>"), None);
}

/// Full Unicode case folding, used for every case-insensitive equality.
pub fn casefold(value: &str) -> String {
    caseless::default_case_fold_str(value)
}

/// What a matched substring becomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Replace with a stable `<TKN_..>` token recorded in the ledger.
    Tokenize,
    /// Replace with the rule's static replacement string.
    Replace,
    /// Replace with a deterministic permutation of the value.
    Anagram,
    /// Replace with the reversible `ENC[..]` form.
    Obfuscate,
    /// Keep the value unchanged; unknown action names degrade to this.
    Keep,
}

impl Action {
    pub fn from_name(name: &str) -> Action {
        match name.trim().to_ascii_lowercase().as_str() {
            "tokenize" => Action::Tokenize,
            "replace" => Action::Replace,
            "anagram" => Action::Anagram,
            "obfuscate" => Action::Obfuscate,
            other => {
                tracing::warn!("unknown action {:?}, matches will be kept as-is", other);
                Action::Keep
            }
        }
    }
}

/// A compiled matcher. `Pattern(None)` marks a regex that failed to
/// compile: the rule yields no matches but does not fail the scan.
#[derive(Debug)]
pub enum Matcher {
    Pattern(Option<Regex>),
    Terms(Vec<Regex>),
}

#[derive(Debug)]
pub struct RuleDefinition {
    pub id: String,
    pub category: String,
    pub action: Action,
    pub priority: i32,
    pub case_sensitive: bool,
    pub word_boundary: bool,
    pub replacement: String,
    pub matcher: Matcher,
}

impl RuleDefinition {
    pub fn is_list(&self) -> bool {
        matches!(self.matcher, Matcher::Terms(_))
    }
}

/// The compiled ruleset plus the reconcile policy.
#[derive(Debug)]
pub struct RulesetState {
    pub version: i64,
    pub mode: String,
    pub never_reconcile: HashSet<String>,
    pub rules: Vec<RuleDefinition>,
}

impl RulesetState {
    /// Load and compile the ruleset document at `ruleset_file`, resolving
    /// term-list sources against `rules_dir`. `default_never` is the
    /// application fallback when the document omits the policy set.
    pub fn load(
        ruleset_file: &Path,
        rules_dir: &Path,
        default_never: &HashSet<String>,
    ) -> Result<RulesetState, loader::Error> {
        loader::load(ruleset_file, rules_dir, default_never)
    }

    /// (total rules, list rules)
    pub fn rule_counts(&self) -> (usize, usize) {
        let lists = self.rules.iter().filter(|rule| rule.is_list()).count();
        (self.rules.len(), lists)
    }

    /// Whether tokens of this category must be left verbatim downstream.
    pub fn never_reconciles(&self, category: &str) -> bool {
        self.never_reconcile.contains(&normalize_category(category))
    }
}

fn compile_pattern(id: &str, pattern: &str, case_sensitive: bool) -> Option<Regex> {
    match RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
    {
        Ok(re) => Some(re),
        Err(err) => {
            tracing::warn!("{}: invalid pattern: {}", id, err);
            None
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Anchor an escaped term with `\b` on each side whose boundary character
/// is a word character. Terms like `ACME S.p.A.` keep an unanchored end.
fn term_pattern(term: &str, word_boundary: bool) -> String {
    let escaped = regex::escape(term);
    if !word_boundary {
        return escaped;
    }
    let start = if term.chars().next().map_or(false, is_word_char) {
        r"\b"
    } else {
        ""
    };
    let end = if term.chars().last().map_or(false, is_word_char) {
        r"\b"
    } else {
        ""
    };
    format!("{}{}{}", start, escaped, end)
}

#[test]
fn test_term_pattern() {
    assert_eq!(term_pattern("Enel", true), r"\bEnel\b");
    assert_eq!(term_pattern("ACME S.p.A.", true), r"\bACME S\.p\.A\.");
    assert_eq!(term_pattern("@here", true), r"@here\b");
    assert_eq!(term_pattern("Enel", false), "Enel");
}

/// A candidate match, before overlap resolution. Offsets are byte offsets
/// into the scanned text.
#[derive(Debug)]
pub struct Candidate<'a> {
    pub start: usize,
    pub end: usize,
    pub value: &'a str,
    pub rule: &'a RuleDefinition,
}

impl Candidate<'_> {
    fn len(&self) -> usize {
        self.end - self.start
    }

    fn overlaps(&self, span: (usize, usize)) -> bool {
        self.start < span.1 && span.0 < self.end
    }
}

/// Produce every candidate match of the compiled rules against the text,
/// without resolving conflicts.
pub fn find_candidates<'a>(text: &'a str, rules: &'a [RuleDefinition]) -> Vec<Candidate<'a>> {
    let mut found = Vec::new();
    for rule in rules {
        match &rule.matcher {
            Matcher::Pattern(None) => {}
            Matcher::Pattern(Some(re)) => collect_matches(text, re, rule, &mut found),
            Matcher::Terms(patterns) => {
                for re in patterns {
                    collect_matches(text, re, rule, &mut found)
                }
            }
        }
    }
    found
}

fn collect_matches<'a>(
    text: &'a str,
    re: &Regex,
    rule: &'a RuleDefinition,
    found: &mut Vec<Candidate<'a>>,
) {
    for m in re.find_iter(text) {
        found.push(Candidate {
            start: m.start(),
            end: m.end(),
            value: m.as_str(),
            rule,
        });
    }
}

/// Pick a non-overlapping subset: earliest start wins, then longest, then
/// highest priority, then encounter order. The result is ordered by start.
pub fn resolve_overlaps(mut candidates: Vec<Candidate<'_>>) -> Vec<Candidate<'_>> {
    candidates.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then(b.len().cmp(&a.len()))
            .then(b.rule.priority.cmp(&a.rule.priority))
    });

    let mut accepted: Vec<Candidate> = Vec::new();
    let mut occupied: Vec<(usize, usize)> = Vec::new();
    for candidate in candidates {
        if occupied.iter().any(|span| candidate.overlaps(*span)) {
            continue;
        }
        occupied.push((candidate.start, candidate.end));
        accepted.push(candidate);
    }
    accepted.sort_by_key(|candidate| candidate.start);
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regex_rule(id: &str, pattern: &str, priority: i32) -> RuleDefinition {
        RuleDefinition {
            id: id.to_string(),
            category: "GENERAL".to_string(),
            action: Action::Tokenize,
            priority,
            case_sensitive: false,
            word_boundary: true,
            replacement: String::new(),
            matcher: Matcher::Pattern(compile_pattern(id, pattern, false)),
        }
    }

    fn term_rule(id: &str, terms: &[&str], priority: i32) -> RuleDefinition {
        let patterns = terms
            .iter()
            .filter_map(|term| compile_pattern(id, &term_pattern(term, true), false))
            .collect();
        RuleDefinition {
            id: id.to_string(),
            category: "BUSINESS".to_string(),
            action: Action::Tokenize,
            priority,
            case_sensitive: false,
            word_boundary: true,
            replacement: String::new(),
            matcher: Matcher::Terms(patterns),
        }
    }

    #[test]
    fn test_find_candidates_case_folding() {
        let rules = vec![term_rule("clients", &["Enel"], 100)];
        let found = find_candidates("enel and ENEL but not Enelx", &rules);
        let values: Vec<&str> = found.iter().map(|c| c.value).collect();
        assert_eq!(values, vec!["enel", "ENEL"]);
    }

    #[test]
    fn test_case_sensitive_rules_match_exact_case_only() {
        let term_rule = RuleDefinition {
            id: "clients".to_string(),
            category: "BUSINESS".to_string(),
            action: Action::Tokenize,
            priority: 100,
            case_sensitive: true,
            word_boundary: true,
            replacement: String::new(),
            matcher: Matcher::Terms(vec![compile_pattern(
                "clients",
                &term_pattern("Enel", true),
                true,
            )
            .unwrap()]),
        };
        let regex_rule = RuleDefinition {
            id: "codes".to_string(),
            category: "GENERAL".to_string(),
            action: Action::Tokenize,
            priority: 100,
            case_sensitive: true,
            word_boundary: true,
            replacement: String::new(),
            matcher: Matcher::Pattern(compile_pattern("codes", "ref-[0-9]+", true)),
        };
        let rules = vec![term_rule, regex_rule];

        let found = find_candidates("enel ENEL Enel REF-1 ref-2", &rules);
        let values: Vec<&str> = found.iter().map(|c| c.value).collect();
        assert_eq!(values, vec!["Enel", "ref-2"]);
    }

    #[test]
    fn test_find_candidates_broken_pattern() {
        let rules = vec![regex_rule("broken", "[unclosed", 100)];
        assert!(find_candidates("anything [unclosed", &rules).is_empty());
    }

    #[test]
    fn test_resolve_overlaps_longest_wins() {
        let rules = vec![
            term_rule("first", &["Marco"], 100),
            term_rule("longer", &["Marco Rossi"], 50),
        ];
        let accepted = resolve_overlaps(find_candidates("ping Marco Rossi", &rules));
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].value, "Marco Rossi");
    }

    #[test]
    fn test_resolve_overlaps_priority_breaks_ties() {
        let rules = vec![
            term_rule("low", &["Enel"], 10),
            term_rule("high", &["Enel"], 200),
        ];
        let accepted = resolve_overlaps(find_candidates("Enel", &rules));
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].rule.id, "high");
    }

    #[test]
    fn test_resolve_overlaps_disjoint_sorted() {
        let rules = vec![term_rule("clients", &["Enel", "ACME"], 100)];
        let accepted = resolve_overlaps(find_candidates("ACME then Enel then ACME", &rules));
        let starts: Vec<usize> = accepted.iter().map(|c| c.start).collect();
        assert_eq!(accepted.len(), 3);
        assert!(starts.windows(2).all(|w| w[0] < w[1]));
        for window in accepted.windows(2) {
            assert!(window[0].end <= window[1].start);
        }
    }
}
