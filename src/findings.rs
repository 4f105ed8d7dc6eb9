//! Structured results embedded in assistant output.
//!
//! The assistant is asked to reply with JSON objects for findings, reviews
//! and verification summaries. Those objects may sit inside a fenced code
//! block or anywhere in free text. Parsing is advisory: anything that cannot
//! be read degrades to a safe default (no findings, approved, passed).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Category, Priority, TestCounts};

/// Minimum bigram similarity for two titles to count as the same issue.
pub const DUPLICATE_THRESHOLD: f64 = 0.8;

/// An issue reported by discovery, review or verification output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    pub priority: Priority,
    pub title: String,
    pub description: String,
    pub file_path: Option<String>,
}

/// Parsed reviewer verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub approved: bool,
    pub issues: Vec<Finding>,
    pub summary: String,
}

impl Default for ReviewOutcome {
    fn default() -> Self {
        Self {
            approved: true,
            issues: Vec::new(),
            summary: String::new(),
        }
    }
}

/// A failing test named in a verification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub name: String,
    pub message: String,
    pub file_path: Option<String>,
}

/// Parsed verification summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// `None` when the output carried no readable summary.
    pub counts: Option<TestCounts>,
    pub skipped: u32,
    pub failures: Vec<TestFailure>,
}

impl VerificationOutcome {
    /// A run passes unless it reported failing tests.
    pub fn passed(&self) -> bool {
        self.counts.map_or(true, |c| c.failed == 0)
    }
}

/// Finds the first JSON object in `output` that has `key` at its top level.
///
/// Fenced code blocks are tried first, then balanced `{...}` spans scanned
/// left to right.
pub fn extract_json_with_key(output: &str, key: &str) -> Option<Value> {
    extract_json_where(output, |value| value.get(key).is_some())
}

fn extract_json_where(output: &str, accept: impl Fn(&Value) -> bool) -> Option<Value> {
    for block in fenced_blocks(output) {
        if let Ok(value) = serde_json::from_str::<Value>(block.trim()) {
            if accept(&value) {
                return Some(value);
            }
        }
        if let Some(value) = scan_objects(block).find(|v| accept(v)) {
            return Some(value);
        }
    }

    scan_objects(output).find(|v| accept(v))
}

/// Bodies of ``` fenced blocks, labelled or not.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let body_start = after_fence.find('\n').map_or(after_fence.len(), |i| i + 1);
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => break,
        }
    }

    blocks
}

/// Every balanced `{...}` span that parses as JSON, outermost first.
fn scan_objects(text: &str) -> impl Iterator<Item = Value> + '_ {
    object_spans(text)
        .into_iter()
        .filter_map(move |(start, end)| serde_json::from_str::<Value>(&text[start..end]).ok())
}

/// Byte ranges of balanced `{...}` spans ordered by start, in one pass.
///
/// Quotes open strings only inside a span, and a string never runs past a
/// newline, so stray quotes in prose cannot hide later objects.
fn object_spans(text: &str) -> Vec<(usize, usize)> {
    let mut open = Vec::new();
    let mut spans = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                '\n' => {
                    in_string = false;
                    escaped = false;
                }
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if !open.is_empty() => in_string = true,
            '{' => open.push(i),
            '}' => {
                if let Some(start) = open.pop() {
                    spans.push((start, i + 1));
                }
            }
            _ => {}
        }
    }

    spans.sort_unstable_by_key(|&(start, _)| start);
    spans
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}

fn u32_field(value: &Value, key: &str) -> Option<u32> {
    value
        .get(key)
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .map(|n| n.min(u32::MAX as u64) as u32)
}

fn parse_finding(item: &Value) -> Option<Finding> {
    let title = str_field(item, &["title", "issue", "name"])?.trim();
    if title.is_empty() {
        return None;
    }

    Some(Finding {
        category: str_field(item, &["category", "type"])
            .map(Category::parse_lenient)
            .unwrap_or(Category::Improvement),
        priority: item
            .get("priority")
            .map(|p| match p {
                Value::Number(n) => Priority::parse_lenient(&n.to_string()),
                other => Priority::parse_lenient(other.as_str().unwrap_or_default()),
            })
            .unwrap_or(Priority::P2),
        title: title.to_string(),
        description: str_field(item, &["description", "details", "suggestion"])
            .unwrap_or_default()
            .to_string(),
        file_path: str_field(item, &["file_path", "file"]).map(str::to_string),
    })
}

fn parse_finding_list(value: &Value, key: &str) -> Vec<Finding> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_finding).collect())
        .unwrap_or_default()
}

/// Findings from discovery or review output; empty when nothing is readable.
pub fn parse_findings(output: &str) -> Vec<Finding> {
    if let Some(value) = extract_json_with_key(output, "findings") {
        return parse_finding_list(&value, "findings");
    }
    if let Some(value) = extract_json_with_key(output, "issues") {
        return parse_finding_list(&value, "issues");
    }
    tracing::debug!("no findings object in output");
    Vec::new()
}

/// Reviewer verdict; unreadable output counts as approved.
pub fn parse_review(output: &str) -> ReviewOutcome {
    let Some(value) = extract_json_with_key(output, "approved")
        .or_else(|| extract_json_with_key(output, "verdict"))
    else {
        tracing::debug!("no review object in output, treating as approved");
        return ReviewOutcome::default();
    };

    let approved = match (value.get("approved"), value.get("verdict")) {
        (Some(Value::Bool(b)), _) => *b,
        (Some(Value::String(s)), _) => !s.eq_ignore_ascii_case("false"),
        (_, Some(Value::String(verdict))) => verdict != "needs_changes",
        _ => true,
    };

    let mut issues = parse_finding_list(&value, "issues");
    if issues.is_empty() {
        issues = parse_finding_list(&value, "suggestions");
    }

    ReviewOutcome {
        approved,
        issues,
        summary: str_field(&value, &["summary"]).unwrap_or_default().to_string(),
    }
}

fn parse_failure(item: &Value) -> Option<TestFailure> {
    match item {
        Value::String(name) => Some(TestFailure {
            name: name.clone(),
            message: String::new(),
            file_path: None,
        }),
        Value::Object(_) => Some(TestFailure {
            name: str_field(item, &["name", "test", "title"])?.to_string(),
            message: str_field(item, &["message", "error", "reason"])
                .unwrap_or_default()
                .to_string(),
            file_path: str_field(item, &["file_path", "file"]).map(str::to_string),
        }),
        _ => None,
    }
}

/// Verification summary; unreadable output counts as passed.
pub fn parse_verification(output: &str) -> VerificationOutcome {
    let Some(value) = extract_json_where(output, |v| v.get("summary").is_some_and(Value::is_object))
    else {
        tracing::debug!("no verification summary in output, treating as passed");
        return VerificationOutcome::default();
    };

    let summary = &value["summary"];
    let passed = u32_field(summary, "passed").unwrap_or(0);
    let failed = u32_field(summary, "failed").unwrap_or(0);
    let total = u32_field(summary, "total").unwrap_or(passed + failed);

    VerificationOutcome {
        counts: Some(TestCounts {
            passed,
            failed,
            total,
        }),
        skipped: u32_field(summary, "skipped").unwrap_or(0),
        failures: value
            .get("failures")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_failure).collect())
            .unwrap_or_default(),
    }
}

fn normalize(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn bigrams(text: &str) -> Vec<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Dice coefficient over character bigrams of the normalised titles.
pub fn bigram_similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a == b {
        return 1.0;
    }

    let left = bigrams(&a);
    let mut right = bigrams(&b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let total = (left.len() + right.len()) as f64;
    let mut shared = 0usize;
    for pair in &left {
        if let Some(pos) = right.iter().position(|p| p == pair) {
            right.swap_remove(pos);
            shared += 1;
        }
    }

    2.0 * shared as f64 / total
}

/// Whether `title` matches any existing title exactly or by similarity.
pub fn is_duplicate<'a>(title: &str, existing: impl IntoIterator<Item = &'a str>) -> bool {
    existing.into_iter().any(|other| {
        other == title || bigram_similarity(title, other) >= DUPLICATE_THRESHOLD
    })
}
