//! Splits a policy document into atomic rule clauses.
//!
//! Boundaries are blank lines and numbered/bulleted clause markers at the start
//! of a line. Clauses below a minimum length and pure headers are dropped. Ids
//! are content hashes, so re-splitting identical bytes yields identical ids in
//! the same order regardless of when or where the split happens.
//!
//! PDF input is reduced to its text layer before splitting. A PDF that cannot
//! be parsed is an `UnsupportedFormat` error, one without a text layer (a scan)
//! is an `EmptyDocument`.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{FragmentId, RuleType, SourceOffset};

pub type DocumentId = String;

const FRAGMENT_ID_LEN: usize = 16;
const PDF_MAGIC: &[u8] = b"%PDF-";

/// Raw policy text plus its content-derived identity.
#[derive(Debug, Clone)]
pub struct PolicyDocument {
    pub id: DocumentId,
    pub text: String,
}

impl PolicyDocument {
    /// PDFs (by magic bytes) go through text extraction; anything else is decoded
    /// as UTF-8 with invalid sequences replaced. The id always hashes the raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = if Self::is_pdf(bytes) {
            pdf_text(bytes)?
        } else {
            String::from_utf8_lossy(bytes).into_owned()
        };
        Ok(Self { id: document_id(bytes), text })
    }

    pub fn from_text(text: &str) -> Self { Self { id: document_id(text.as_bytes()), text: text.to_string() } }

    pub fn is_pdf(bytes: &[u8]) -> bool { bytes.starts_with(PDF_MAGIC) }
}

fn pdf_text(bytes: &[u8]) -> Result<String> {
    // the extractor panics on some malformed cross-reference tables
    let text = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| Error::UnsupportedFormat("PDF parser aborted on malformed input".into()))?
        .map_err(|e| Error::UnsupportedFormat(format!("PDF text extraction failed: {e}")))?;
    if text.trim().is_empty() {
        return Err(Error::EmptyDocument);
    }
    debug!(bytes = bytes.len(), chars = text.len(), "extracted PDF text layer");
    Ok(text)
}

pub fn document_id(bytes: &[u8]) -> DocumentId { blake3::hash(bytes).to_hex().to_string() }

/// Id of a clause: hash of its whitespace-normalized, lowercased text.
pub fn fragment_id(normalized_text: &str) -> FragmentId {
    let hex = blake3::hash(normalized_text.to_lowercase().as_bytes()).to_hex();
    hex[..FRAGMENT_ID_LEN].to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyClause {
    pub id: FragmentId,
    pub text: String,
    pub rule_type: RuleType,
    pub source_offset: SourceOffset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOptions {
    pub min_fragment_chars: usize,
}

impl Default for SplitOptions {
    fn default() -> Self { Self { min_fragment_chars: 20 } }
}

impl SplitOptions {
    /// Stable text form, for keying anything derived from a split.
    pub fn fingerprint(&self) -> String { format!("min_chars={}", self.min_fragment_chars) }
}

#[derive(Default)]
pub struct PolicyProcessor {
    options: SplitOptions,
}

impl PolicyProcessor {
    pub fn new(options: SplitOptions) -> Self { Self { options } }

    pub fn split(&self, document: &PolicyDocument) -> Vec<PolicyClause> {
        let mut seen = HashSet::new();
        let mut clauses = Vec::new();
        let mut dropped = 0usize;
        for (start, end) in segment_ranges(&document.text) {
            let text = normalize_whitespace(&document.text[start..end]);
            if text.chars().count() < self.options.min_fragment_chars || is_header(&text) {
                dropped += 1;
                continue;
            }
            let id = fragment_id(&text);
            if !seen.insert(id.clone()) {
                dropped += 1;
                continue;
            }
            let rule_type = RuleType::classify(&text);
            let ordinal = clauses.len();
            clauses.push(PolicyClause { id, text, rule_type, source_offset: SourceOffset { ordinal, start, end } });
        }
        debug!(document = %&document.id[..FRAGMENT_ID_LEN.min(document.id.len())], kept = clauses.len(), dropped, "split policy document");
        clauses
    }
}

fn clause_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"^\s*(?:\d+(?:\.\d+)*[.)]|\([A-Za-z0-9]{1,3}\)|[A-Za-z][.)]|[-*•])\s+")
            .expect("clause marker pattern is valid")
    })
}

/// Byte ranges of candidate clauses, trailing whitespace trimmed.
fn segment_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_end();
        if trimmed.trim_start().is_empty() {
            ranges.extend(current.take());
            continue;
        }
        let content_start = line_start + (trimmed.len() - trimmed.trim_start().len());
        let content_end = line_start + trimmed.len();
        if clause_marker().is_match(trimmed) {
            ranges.extend(current.take());
        }
        current = Some(match current {
            Some((start, _)) => (start, content_end),
            None => (content_start, content_end),
        });
    }
    ranges.extend(current);
    ranges
}

fn normalize_whitespace(s: &str) -> String { s.split_whitespace().collect::<Vec<_>>().join(" ") }

fn is_header(text: &str) -> bool {
    let stripped = text.trim_end_matches(|c: char| c == '"' || c == '\'' || c == ')' || c == ']');
    if stripped.ends_with(['.', '!', '?', ';']) {
        return false;
    }
    if stripped.ends_with(':') {
        return true;
    }
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if !letters.is_empty() && letters.iter().all(|c| c.is_uppercase()) {
        return true;
    }
    let without_marker = clause_marker().replace(text, "");
    let mut words = without_marker.split_whitespace();
    let first = words.next().map(str::to_lowercase).unwrap_or_default();
    let word_count = 1 + words.count();
    matches!(first.as_str(), "section" | "article" | "chapter" | "part") && word_count <= 8
}
