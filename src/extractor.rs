//! Move extraction from free-form model output.
//!
//! Models are asked to finish with a `MOVE: <san>` line but frequently
//! ignore the format. Extraction tries progressively looser strategies and
//! only ever returns a token taken from the legal move list:
//!
//! 1. **Tagged**: the last line starting with a move label (`MOVE:`,
//!    `Final move:`, ...), first token after the label.
//! 2. **Grammar**: scanning backwards, the last token shaped like SAN.
//! 3. **Last line**: the final non-empty line if it is short enough to be a move.
//! 4. **Fuzzy**: if the candidate is missing or illegal, the rightmost
//!    whole-word occurrence of any legal move in the raw text.

use derive_getters::Getters;
use serde::Serialize;
use tracing::{debug, instrument, trace};

/// Labels that introduce the chosen move, compared case-insensitively.
const MOVE_LABELS: [&str; 5] = ["move:", "final move:", "my move:", "best move:", "your move:"];

/// Characters that separate tokens during grammar scanning.

/// Decoration stripped from a candidate before validation.
const DECORATION: &[char] = &['*', '`', '"', '\'', '[', ']', '(', ')', '{', '}', '_'];

/// Trailing punctuation trimmed from the final candidate.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

/// Bounds for accepting a bare final line as a move.
const LAST_LINE_MIN_LEN: usize = 2;
const LAST_LINE_MAX_LEN: usize = 7;

/// Which strategy produced the chosen move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExtractionMethod {
    /// Explicit `MOVE:` label.
    Tagged,
    /// SAN-shaped token found scanning backwards.
    Grammar,
    /// Short final line.
    LastLine,
    /// Rightmost legal move mentioned anywhere in the text.
    Fuzzy,
}

/// Result of running the extractor over one model response.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize)]
pub struct Extraction {
    /// Legal move token chosen, exactly as it appears in the legal move list.
    chosen: Option<String>,
    /// Model reasoning with the tag line removed.
    rationale: String,
    /// Strategy that produced `chosen`.
    method: Option<ExtractionMethod>,
    /// Best pre-validation candidate, kept for diagnostics when it was illegal.
    candidate: Option<String>,
}

impl Extraction {
    /// True when no legal move could be recovered.
    pub fn is_no_match(&self) -> bool {
        self.chosen.is_none()
    }
}

/// Extracts a legal move from raw model text.
///
/// Pure: the same text and legal set always produce the same result.
/// `attempt` is only recorded on the tracing span.
#[instrument(skip(raw, legal_moves), fields(raw_len = raw.len(), legal = legal_moves.len()))]
pub fn extract(raw: &str, legal_moves: &[String], attempt: u32) -> Extraction {
    let (candidate, method, rationale) = match tagged_candidate(raw) {
        Some((token, rationale)) => (Some(token), ExtractionMethod::Tagged, rationale),
        None => {
            let rationale = raw.trim().to_string();
            match grammar_candidate(raw) {
                Some(token) => (Some(token), ExtractionMethod::Grammar, rationale),
                None => (last_line_candidate(raw), ExtractionMethod::LastLine, rationale),
            }
        }
    };

    trace!(?candidate, %method, "Candidate before validation");

    if let Some(token) = candidate.as_deref().and_then(|c| match_legal(c, legal_moves)) {
        debug!(chosen = %token, %method, "Candidate is legal");
        return Extraction {
            chosen: Some(token.clone()),
            rationale,
            method: Some(method),
            candidate,
        };
    }

    match rightmost_legal(raw, legal_moves) {
        Some(token) => {
            debug!(chosen = %token, ?candidate, "Recovered move by fuzzy scan");
            Extraction {
                chosen: Some(token),
                rationale,
                method: Some(ExtractionMethod::Fuzzy),
                candidate,
            }
        }
        None => {
            debug!(?candidate, "No legal move found in response");
            Extraction {
                chosen: None,
                rationale,
                method: None,
                candidate,
            }
        }
    }
}

/// Finds the last labelled line and returns its first token plus the
/// text with that line removed.
fn tagged_candidate(raw: &str) -> Option<(String, String)> {
    let lines: Vec<&str> = raw.lines().collect();

    for (index, line) in lines.iter().enumerate().rev() {
        let Some(rest) = strip_move_label(line) else {
            continue;
        };

        let token = rest
            .split_whitespace()
            .map(clean_candidate)
            .find(|t| !t.is_empty());

        if let Some(token) = token {
            let rationale = lines
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, l)| *l)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string();
            return Some((token, rationale));
        }
    }

    None
}

/// Returns the text after a move label, if the line starts with one.
fn strip_move_label(line: &str) -> Option<&str> {
    let line = line.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '*' | '#' | '>' | '-' | '_'));
    let lower = line.to_ascii_lowercase();

    MOVE_LABELS
        .iter()
        .find(|label| lower.starts_with(*label))
        .map(|label| &line[label.len()..])
}

/// Scans tokens from the end of the text for the last SAN-shaped one.
fn grammar_candidate(raw: &str) -> Option<String> {
    raw.split(|c: char| !is_token_char(c))
        .rev()
        .filter(|token| !token.is_empty())
        .map(clean_candidate)
        .find(|token| looks_like_san(token))
}

/// Takes the final non-empty line if its length is plausible for a move.
fn last_line_candidate(raw: &str) -> Option<String> {
    let line = raw.lines().rev().find(|l| !l.trim().is_empty())?;
    let token = clean_candidate(line);
    let len = token.chars().count();

    (LAST_LINE_MIN_LEN..=LAST_LINE_MAX_LEN)
        .contains(&len)
        .then_some(token)
}

/// Strips decoration, leading move numbers and trailing punctuation.
fn clean_candidate(token: &str) -> String {
    let stripped: String = token.trim().chars().filter(|c| !DECORATION.contains(c)).collect();

    // "12.Nf3", "3...e5"
    let digits = stripped.chars().take_while(|c| c.is_ascii_digit()).count();
    let without_number = if digits > 0 && stripped[digits..].starts_with('.') {
        stripped[digits..].trim_start_matches('.')
    } else {
        stripped.trim_start_matches('.')
    };

    without_number
        .trim()
        .trim_end_matches(TRAILING_PUNCTUATION)
        .to_string()
}

/// Canonical comparison form: no check/mate/annotation suffix, letter-O castling.
fn normalize_san(token: &str) -> String {
    let core = token.trim_end_matches(['+', '#', '!', '?']);
    match core {
        "0-0" => "O-O".to_string(),
        "0-0-0" => "O-O-O".to_string(),
        other => other.to_string(),
    }
}

/// Finds the legal token equivalent to `candidate`.
fn match_legal<'a>(candidate: &str, legal_moves: &'a [String]) -> Option<&'a String> {
    let wanted = normalize_san(candidate);
    if wanted.is_empty() {
        return None;
    }
    legal_moves.iter().find(|m| normalize_san(m) == wanted)
}

fn is_file(b: u8) -> bool {
    (b'a'..=b'h').contains(&b)
}

fn is_rank(b: u8) -> bool {
    (b'1'..=b'8').contains(&b)
}

fn is_piece(b: u8) -> bool {
    matches!(b, b'K' | b'Q' | b'R' | b'B' | b'N')
}

/// Whether a cleaned token has the shape of a SAN move.
fn looks_like_san(token: &str) -> bool {
    let core = normalize_san(token);
    if core == "O-O" || core == "O-O-O" {
        return true;
    }

    let bytes = core.as_bytes();
    let mut end = bytes.len();
    let mut promotion = false;

    if end >= 3 && matches!(bytes[end - 1], b'Q' | b'R' | b'B' | b'N') {
        promotion = true;
        end -= 1;
        if bytes[end - 1] == b'=' {
            end -= 1;
        }
    }

    if end < 2 || !is_file(bytes[end - 2]) || !is_rank(bytes[end - 1]) {
        return false;
    }
    if promotion && !matches!(bytes[end - 1], b'1' | b'8') {
        return false;
    }

    let prefix = &bytes[..end - 2];
    match prefix.split_first() {
        None => true,
        Some((&piece, rest)) if is_piece(piece) => {
            if promotion {
                return false;
            }
            let rest = match rest.split_last() {
                Some((b'x', head)) => head,
                _ => rest,
            };
            match rest {
                [] => true,
                [d] => is_file(*d) || is_rank(*d),
                [f, r] => is_file(*f) && is_rank(*r),
                _ => false,
            }
        }
        Some(_) => matches!(prefix, [f, b'x'] if is_file(*f)),
    }
}

/// True for characters that continue a move token.
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '='
}

/// Byte offset of the last whole-word occurrence of `needle`.
fn last_whole_word(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }

    haystack.rmatch_indices(needle).map(|(i, _)| i).find(|&start| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(is_token_char) && !after.is_some_and(is_token_char)
    })
}

/// Rightmost legal move mentioned as a whole word.
fn rightmost_legal(raw: &str, legal_moves: &[String]) -> Option<String> {
    legal_moves
        .iter()
        .filter_map(|m| last_whole_word(raw, &normalize_san(m)).map(|pos| (pos, m)))
        .max_by_key(|(pos, m)| (*pos, m.len()))
        .map(|(_, m)| m.clone())
}
