//! Rate-limit and overload detection.
//!
//! Detection is phrase-based. The phrase list is an English-language
//! heuristic and should be checked against real assistant traffic.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backoff::RATE_LIMIT_CEILING;
use crate::stream::StreamEvent;

/// Phrases that mark a rate-limit or overload condition (matched lowercase).
pub const RATE_LIMIT_PHRASES: &[&str] = &[
    "usage limit reached",
    "rate limit",
    "rate_limit",
    "rate-limit",
    "too many requests",
    "overloaded",
    "429",
];

/// Maximum length of a reported message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 500;

/// Where a rate-limit signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitSource {
    Event,
    Text,
    ExitCode,
}

/// Outcome of a single detection check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub detected: bool,
    pub source: RateLimitSource,
    pub message: String,
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitInfo {
    fn none(source: RateLimitSource) -> Self {
        Self {
            detected: false,
            source,
            message: String::new(),
            retry_after_seconds: None,
        }
    }

    fn hit(source: RateLimitSource, message: &str, retry_after_seconds: Option<u64>) -> Self {
        Self {
            detected: true,
            source,
            message: truncate_chars(message, MAX_MESSAGE_CHARS),
            retry_after_seconds,
        }
    }
}

/// Stateless rate-limit detector.
#[derive(Debug, Clone, Default)]
pub struct RateLimitDetector;

impl RateLimitDetector {
    pub fn new() -> Self {
        Self
    }

    /// Checks one stream record.
    ///
    /// An explicit `rate_limit` type or subtype always counts. Phrase matching
    /// only applies to error-bearing records so assistant prose that happens to
    /// mention a phrase is ignored.
    pub fn check_event(&self, event: &StreamEvent) -> RateLimitInfo {
        let raw = event.raw();
        let serialized = raw.to_string();
        let hint = retry_hint_from_value(raw).or_else(|| retry_hint_from_text(&serialized));

        let explicit = event.subtype() == Some("rate_limit") || event.event_type() == Some("rate_limit");
        if explicit {
            return RateLimitInfo::hit(RateLimitSource::Event, &serialized, hint);
        }

        let error_bearing = match event.event_type() {
            Some("error") | Some("system") => true,
            Some("result") => event.is_error(),
            _ => false,
        };
        if error_bearing && contains_phrase(&serialized) {
            return RateLimitInfo::hit(RateLimitSource::Event, &serialized, hint);
        }

        RateLimitInfo::none(RateLimitSource::Event)
    }

    /// Checks accumulated stdout and stderr text.
    ///
    /// Only meaningful after a non-zero exit.
    pub fn check_text(&self, text: &str) -> RateLimitInfo {
        if contains_phrase(text) {
            RateLimitInfo::hit(RateLimitSource::Text, text.trim(), retry_hint_from_text(text))
        } else {
            RateLimitInfo::none(RateLimitSource::Text)
        }
    }

    /// Exit codes alone never indicate a rate limit; corroborating text or
    /// event evidence is required.
    pub fn check_exit_code(&self, _code: Option<i32>) -> RateLimitInfo {
        RateLimitInfo::none(RateLimitSource::ExitCode)
    }
}

fn contains_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|phrase| {
        if phrase.chars().all(|c| c.is_ascii_digit()) {
            contains_status_code(&lower, phrase)
        } else {
            lower.contains(phrase)
        }
    })
}

/// Matches a numeric status code only when it is not part of a longer number.
fn contains_status_code(text: &str, code: &str) -> bool {
    text.match_indices(code).any(|(idx, _)| {
        let before = text[..idx].chars().next_back();
        let after = text[idx + code.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_digit()) && !after.is_some_and(|c| c.is_ascii_digit())
    })
}

fn retry_hint_from_value(value: &Value) -> Option<u64> {
    ["retry_after", "retry_after_seconds", "retryAfter"]
        .iter()
        .find_map(|key| value.get(*key))
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
}

fn retry_hint_from_text(text: &str) -> Option<u64> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)(?:retry[- ]after|try again in)[:\s]*(\d+)\s*(s|sec|secs|seconds?|m|min|mins|minutes?)?\b",
            )
            .ok()
        })
        .as_ref()?;

    let captures = pattern.captures(text)?;
    let amount: u64 = captures.get(1)?.as_str().parse().ok()?;
    let minutes = captures
        .get(2)
        .is_some_and(|unit| unit.as_str().to_lowercase().starts_with('m'));
    let seconds = if minutes { amount.saturating_mul(60) } else { amount };
    Some(seconds.min(RATE_LIMIT_CEILING.as_secs()))
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
