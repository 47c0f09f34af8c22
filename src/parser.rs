//! Response parsing: two-level separator grammar with explicit degradation
//!
//! Raw assistant responses pack several answers into one line of the form
//! `value~url?value~url?...` — `?` separates answers, `~` separates a value
//! from its source URL. Assistant output drifts constantly, so the parser
//! degrades instead of failing: a segment-count mismatch pads with null
//! values flagged `Forced`, and only a response with zero parseable segments
//! at all is a parse error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;
use crate::input::FieldKind;

/// Textual markers the assistant uses for "no answer".
const NULL_MARKERS: &[&str] = &["", "na", "n/a", "none", "null", "unknown", "nil", "-"];

/// Phrases that identify echoed instruction text rather than answer payload.
const INSTRUCTION_ECHOES: &[&str] = &["return the answer", "do not provide", "return exactly"];

static CITATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\d+\]").unwrap());
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:,\d{3})*(?:\.\d+)?").unwrap());

/// How cleanly the parser matched the expected delimiter grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Segment count matched and the segment carried an explicit value~url pair
    Perfect,
    /// Value parsed but without a url portion
    Useful,
    /// Produced by the fallback heuristic (padding or count mismatch)
    Forced,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Perfect => "perfect",
            Confidence::Useful => "useful",
            Confidence::Forced => "forced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "perfect" => Some(Confidence::Perfect),
            "useful" => Some(Confidence::Useful),
            "forced" => Some(Confidence::Forced),
            _ => None,
        }
    }
}

/// One parsed field value with its optional source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedField {
    pub value: Option<String>,
    pub url: Option<String>,
    pub confidence: Confidence,
}

impl ParsedField {
    fn null(confidence: Confidence) -> Self {
        Self { value: None, url: None, confidence }
    }
}

/// Parse a raw response into exactly `expected` fields.
///
/// Returns `ExtractError::Parse` only when not a single segment yields a
/// value or url; every other malformation degrades to padded/forced entries.
pub fn parse(raw: &str, expected: usize) -> Result<Vec<ParsedField>, ExtractError> {
    if expected == 0 {
        return Ok(Vec::new());
    }

    let payload = select_payload(raw);
    if payload.is_empty() {
        return Err(ExtractError::Parse("empty response text".to_string()));
    }

    let segments: Vec<&str> = payload.split('?').collect();
    let mismatch = segments.len() != expected;

    let mut fields = Vec::with_capacity(expected);
    for segment in segments.iter().take(expected) {
        let (value, url, had_tilde) = split_segment(segment);
        let confidence = if mismatch {
            Confidence::Forced
        } else if had_tilde && url.is_some() {
            Confidence::Perfect
        } else {
            Confidence::Useful
        };
        fields.push(ParsedField { value, url, confidence });
    }

    if fields.iter().all(|f| f.value.is_none() && f.url.is_none()) {
        return Err(ExtractError::Parse(format!(
            "no parseable segments in response ({} chars)",
            raw.len()
        )));
    }

    // Recoverable degradation: short responses are padded rather than failed
    while fields.len() < expected {
        fields.push(ParsedField::null(Confidence::Forced));
    }

    Ok(fields)
}

/// Pick the answer payload out of a possibly multi-line response.
///
/// Multi-line responses get scored per line: delimiter hits plus a URL bonus.
/// The best-scoring line wins; if no line scores, the remaining lines are
/// joined so single-value responses still parse.
fn select_payload(raw: &str) -> String {
    let cleaned = CITATION_RE.replace_all(raw, "");
    let candidates: Vec<&str> = cleaned
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !is_instruction_echo(l))
        .collect();

    let best = candidates
        .iter()
        .map(|line| (line_score(line), *line))
        .max_by_key(|(score, _)| *score);

    match best {
        Some((score, line)) if score > 0 => line.to_string(),
        _ => candidates.join(" ").trim().to_string(),
    }
}

fn line_score(line: &str) -> usize {
    let tildes = line.matches('~').count();
    let questions = line.matches('?').count();
    let url_bonus = if line.contains("http") { 1 } else { 0 };
    tildes * 2 + questions + url_bonus
}

fn is_instruction_echo(line: &str) -> bool {
    let lowered = line.to_lowercase();
    INSTRUCTION_ECHOES.iter().any(|p| lowered.contains(p))
}

/// Split one `value~url` segment. The url portion is whatever follows the
/// first tilde; both halves go through null-marker normalization.
fn split_segment(segment: &str) -> (Option<String>, Option<String>, bool) {
    match segment.split_once('~') {
        Some((value, url)) => (normalize_text(value), normalize_text(url), true),
        None => (normalize_text(segment), None, false),
    }
}

/// Trim and map textual null markers to None.
fn normalize_text(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if NULL_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalize a parsed value according to the field's declared kind.
/// Returns None when the value does not fit the kind (e.g. no digits in a
/// number field), which the caller records as an absent value.
pub fn normalize_value(kind: FieldKind, value: &str) -> Option<String> {
    let trimmed = value.trim();
    if NULL_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
        return None;
    }

    match kind {
        FieldKind::Text => Some(trimmed.to_string()),
        FieldKind::Number => {
            let m = NUMBER_RE.find(trimmed)?;
            let number = m.as_str().replace(',', "");
            // Zero means "no data" for counts and headcounts
            if number.trim_start_matches('0').trim_start_matches('.').is_empty() {
                None
            } else {
                Some(number)
            }
        }
        FieldKind::YesNo => {
            let lowered = trimmed.to_lowercase();
            if lowered.starts_with("yes") || lowered == "y" {
                Some("Yes".to_string())
            } else if lowered.starts_with("no") || lowered == "n" {
                Some("No".to_string())
            } else {
                None
            }
        }
        FieldKind::List => {
            let items: Vec<String> = trimmed
                .split(',')
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .collect();
            if items.is_empty() {
                None
            } else {
                Some(items.join(","))
            }
        }
    }
}
