//! Neighbouring-page excerpts sent as translation hints.
//!
//! A page often ends mid-sentence. Without seeing how the sentence continues
//! the model has to guess case and gender endings in the target language,
//! and without the previous page it cannot tell a continuation from a new
//! sentence. [`tail`] and [`head`] cut short word-aligned excerpts from the
//! previous and next pages; they travel as delimited context and are never
//! written to the output themselves.

/// Up to the last `n` characters of `text`, never starting mid-word.
///
/// If the cut would land inside a word, the excerpt starts after that word
/// instead. Surrounding whitespace is trimmed. A text whose final `n`
/// characters are one unbroken word yields `""`.
pub fn tail(text: &str, n: usize) -> &str {
    let text = text.trim_end();
    if n == 0 || text.is_empty() {
        return "";
    }
    let total = text.chars().count();
    if total <= n {
        return text.trim_start();
    }

    let start = char_to_byte(text, total - n);
    let excerpt = &text[start..];
    let before = text[..start].chars().next_back();
    let mid_word = before.is_some_and(|c| !c.is_whitespace())
        && excerpt.chars().next().is_some_and(|c| !c.is_whitespace());

    let excerpt = if mid_word {
        match excerpt.find(char::is_whitespace) {
            Some(i) => &excerpt[i..],
            None => "",
        }
    } else {
        excerpt
    };
    excerpt.trim_start()
}

/// Up to the first `n` characters of `text`, never ending mid-word.
///
/// The mirror image of [`tail`]: a cut inside a word moves back to the
/// previous word boundary.
pub fn head(text: &str, n: usize) -> &str {
    let text = text.trim_start();
    if n == 0 || text.is_empty() {
        return "";
    }
    let total = text.chars().count();
    if total <= n {
        return text.trim_end();
    }

    let end = char_to_byte(text, n);
    let excerpt = &text[..end];
    let after = text[end..].chars().next();
    let mid_word = after.is_some_and(|c| !c.is_whitespace())
        && excerpt.chars().next_back().is_some_and(|c| !c.is_whitespace());

    let excerpt = if mid_word {
        match excerpt.rfind(char::is_whitespace) {
            Some(i) => &excerpt[..i],
            None => "",
        }
    } else {
        excerpt
    };
    excerpt.trim_end()
}

fn char_to_byte(text: &str, char_idx: usize) -> usize {
    text.char_indices()
        .nth(char_idx)
        .map_or(text.len(), |(i, _)| i)
}
