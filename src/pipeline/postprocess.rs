//! Post-processing: deterministic cleanup of a model's translation.
//!
//! Even a well-prompted model sometimes answers with more than the
//! translation: it repeats the delimiter scaffolding, translates the context
//! blocks it was told to leave alone, or echoes a hint back verbatim. None
//! of that may reach the output, where only the page's own text belongs.
//!
//! ## Rule order
//!
//! The text block is unwrapped before context blocks are removed (a model
//! that echoes the whole request keeps both), stray markers go next, and the
//! line-ending rules run last on the final text.

use crate::prompts::{
    ALL_DELIMITERS, NEXT_CONTEXT_CLOSE, NEXT_CONTEXT_OPEN, PREVIOUS_CONTEXT_CLOSE,
    PREVIOUS_CONTEXT_OPEN, TEXT_CLOSE, TEXT_OPEN,
};
use once_cell::sync::Lazy;
use regex::Regex;

/// Hints at least this long are scrubbed wherever they appear. Shorter ones
/// may occur in a translation legitimately (names, numbers, code), so they
/// are only removed when they make up a whole first or last line.
const MIN_ECHO_CHARS: usize = 16;

/// Clean one raw model answer for `chunk`.
///
/// `hints` are the context/lookahead excerpts that were sent with the chunk.
///
/// Rules (applied in order):
/// 1. Keep only the inside of an echoed text block
/// 2. Remove echoed context blocks
/// 3. Remove stray delimiter markers
/// 4. Remove hints echoed verbatim (unless the chunk itself contains them).
///    A short hint echoed mid-text, or as the whole answer, is kept.
/// 5. Normalise CRLF when the source used plain LF
/// 6. Restore the chunk's trailing newline so chunks concatenate line-wise
pub fn clean_translation(raw: &str, chunk: &str, hints: &[&str]) -> String {
    let s = unwrap_text_block(raw);
    let s = remove_context_blocks(&s);
    let s = remove_markers(&s);
    let s = remove_echoed_hints(&s, chunk, hints);
    let s = normalise_line_endings(&s, chunk);
    restore_trailing_newline(s, chunk)
}

// ── Rule 1: Unwrap an echoed text block ──────────────────────────────────────

static RE_TEXT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?s){}\n?(.*?)\n?{}",
        regex::escape(TEXT_OPEN),
        regex::escape(TEXT_CLOSE)
    ))
    .unwrap()
});

fn unwrap_text_block(input: &str) -> String {
    match RE_TEXT_BLOCK.captures(input) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Remove context blocks ────────────────────────────────────────────

static RE_CONTEXT_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?s){}.*?{}\n?|{}.*?{}\n?",
        regex::escape(PREVIOUS_CONTEXT_OPEN),
        regex::escape(PREVIOUS_CONTEXT_CLOSE),
        regex::escape(NEXT_CONTEXT_OPEN),
        regex::escape(NEXT_CONTEXT_CLOSE)
    ))
    .unwrap()
});

fn remove_context_blocks(input: &str) -> String {
    RE_CONTEXT_BLOCKS.replace_all(input, "").to_string()
}

// ── Rule 3: Remove stray markers ─────────────────────────────────────────────

fn remove_markers(input: &str) -> String {
    if !ALL_DELIMITERS.iter().any(|d| input.contains(d)) {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    for line in input.split_inclusive('\n') {
        let stripped = ALL_DELIMITERS
            .iter()
            .fold(line.to_string(), |acc, d| acc.replace(d, ""));
        // A line that held nothing but a marker disappears entirely.
        if stripped.trim().is_empty() && !line.trim().is_empty() {
            continue;
        }
        out.push_str(&stripped);
    }
    out
}

// ── Rule 4: Remove echoed hints ──────────────────────────────────────────────

fn remove_echoed_hints(input: &str, chunk: &str, hints: &[&str]) -> String {
    let mut out = input.to_string();
    for hint in hints {
        let hint = hint.trim();
        if hint.is_empty() || chunk.contains(hint) {
            continue;
        }
        if hint.chars().count() < MIN_ECHO_CHARS {
            out = remove_edge_line(&out, hint);
        } else if out.contains(hint) {
            out = out.replace(hint, "");
            out = out.trim_start_matches(['\n', ' ']).to_string();
        }
    }
    out
}

/// Drop the first and/or last non-blank line when it is exactly `hint`.
/// A text whose only non-blank line is the hint is returned unchanged.
fn remove_edge_line(input: &str, hint: &str) -> String {
    let lines: Vec<&str> = input.split_inclusive('\n').collect();
    let (Some(first), Some(last)) = (
        lines.iter().position(|l| !l.trim().is_empty()),
        lines.iter().rposition(|l| !l.trim().is_empty()),
    ) else {
        return input.to_string();
    };
    if first == last {
        return input.to_string();
    }
    let drop_first = lines[first].trim() == hint;
    let drop_last = lines[last].trim() == hint;
    if !drop_first && !drop_last {
        return input.to_string();
    }

    let mut out: String = lines
        .iter()
        .enumerate()
        .filter(|&(i, _)| !(drop_first && i == first) && !(drop_last && i == last))
        .map(|(_, l)| *l)
        .collect();
    if drop_first {
        out = out.trim_start_matches(['\r', '\n']).to_string();
    }
    if drop_last {
        out.truncate(out.trim_end_matches(['\r', '\n']).len());
    }
    out
}

// ── Rule 5: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str, chunk: &str) -> String {
    if chunk.contains('\r') {
        input.to_string()
    } else {
        input.replace("\r\n", "\n")
    }
}

// ── Rule 6: Restore trailing newline ─────────────────────────────────────────

fn restore_trailing_newline(mut s: String, chunk: &str) -> String {
    let newline = if chunk.ends_with("\r\n") { "\r\n" } else { "\n" };
    if chunk.ends_with('\n') && !s.ends_with('\n') {
        s.push_str(newline);
    }
    s
}
