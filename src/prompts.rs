//! Prompts and delimiters for chunk translation.
//!
//! All prompt text lives here so the retry and error-handling code in
//! [`crate::pipeline::translate`] never changes when wording does, and so
//! tests can inspect the exact request a chunk produces.
//!
//! When a chunk travels with neighbouring-page hints, the user message is a
//! sequence of delimited blocks:
//!
//! ```text
//! <<<PREVIOUS_PAGE_CONTEXT>>>      (first chunk of a page only)
//! …tail of the previous page…
//! <<<END_PREVIOUS_PAGE_CONTEXT>>>
//! <<<TEXT_TO_TRANSLATE>>>
//! …the chunk…
//! <<<END_TEXT_TO_TRANSLATE>>>
//! <<<NEXT_PAGE_CONTEXT>>>          (last chunk of a page only)
//! …head of the next page…
//! <<<END_NEXT_PAGE_CONTEXT>>>
//! ```
//!
//! A chunk without hints is sent bare, exactly as extracted.

pub const PREVIOUS_CONTEXT_OPEN: &str = "<<<PREVIOUS_PAGE_CONTEXT>>>";
pub const PREVIOUS_CONTEXT_CLOSE: &str = "<<<END_PREVIOUS_PAGE_CONTEXT>>>";
pub const TEXT_OPEN: &str = "<<<TEXT_TO_TRANSLATE>>>";
pub const TEXT_CLOSE: &str = "<<<END_TEXT_TO_TRANSLATE>>>";
pub const NEXT_CONTEXT_OPEN: &str = "<<<NEXT_PAGE_CONTEXT>>>";
pub const NEXT_CONTEXT_CLOSE: &str = "<<<END_NEXT_PAGE_CONTEXT>>>";

/// Every delimiter, used by post-processing to scrub echoed markers.
pub const ALL_DELIMITERS: [&str; 6] = [
    PREVIOUS_CONTEXT_OPEN,
    PREVIOUS_CONTEXT_CLOSE,
    TEXT_OPEN,
    TEXT_CLOSE,
    NEXT_CONTEXT_OPEN,
    NEXT_CONTEXT_CLOSE,
];

/// Default system prompt for `source` → `target` translation.
///
/// Used when [`crate::config::WorkerConfig::system_prompt`] is `None`.
pub fn default_system_prompt(source: &str, target: &str) -> String {
    format!(
        r#"You are a professional translator. Translate the text you are given from {source} to {target}.

Follow these rules precisely:

1. Translate only. Do NOT add explanations, notes, headings or commentary.
2. Keep the original formatting, line breaks and structure exactly as they are.
   Output one line for every input line.
3. Never refuse and never summarise. If a fragment cannot be translated
   (code, numbers, proper names), copy it unchanged.
4. The text may start or end mid-sentence because it is one piece of a
   longer document. Translate the fragment as it stands.
5. Input may contain delimited blocks:
   - {PREVIOUS_CONTEXT_OPEN} … {PREVIOUS_CONTEXT_CLOSE}: the end of the previous page.
   - {NEXT_CONTEXT_OPEN} … {NEXT_CONTEXT_CLOSE}: the start of the next page.
   - {TEXT_OPEN} … {TEXT_CLOSE}: the text to translate.
   Context blocks are for continuity only: use them to choose correct grammar
   and inflection at the edges, but do NOT translate or repeat them.
   Output ONLY the translation of the text block, without any delimiters."#
    )
}

/// Build the user message for one chunk.
///
/// `context` is the previous page's tail and `lookahead` the next page's
/// head; blank hints are omitted.
pub fn build_user_message(chunk: &str, context: Option<&str>, lookahead: Option<&str>) -> String {
    let context = context.filter(|c| !c.trim().is_empty());
    let lookahead = lookahead.filter(|l| !l.trim().is_empty());

    if context.is_none() && lookahead.is_none() {
        return chunk.to_string();
    }

    let mut msg = String::with_capacity(
        chunk.len() + context.map_or(0, str::len) + lookahead.map_or(0, str::len) + 200,
    );
    if let Some(ctx) = context {
        push_block(&mut msg, PREVIOUS_CONTEXT_OPEN, ctx, PREVIOUS_CONTEXT_CLOSE);
    }
    push_block(&mut msg, TEXT_OPEN, chunk, TEXT_CLOSE);
    if let Some(next) = lookahead {
        push_block(&mut msg, NEXT_CONTEXT_OPEN, next, NEXT_CONTEXT_CLOSE);
    }
    msg
}

fn push_block(msg: &mut String, open: &str, body: &str, close: &str) {
    msg.push_str(open);
    msg.push('\n');
    msg.push_str(body);
    if !body.ends_with('\n') {
        msg.push('\n');
    }
    msg.push_str(close);
    msg.push('\n');
}
