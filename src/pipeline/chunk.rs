//! Line-preserving chunking of page text.
//!
//! A translation call has a practical input ceiling and its latency grows
//! with input size, so long pages are split into chunks of at most
//! `max_chars` characters. Splits only ever fall on line boundaries:
//!
//! * concatenating the chunks in order reproduces the input byte for byte;
//! * every chunk fits in `max_chars` unless it is a single line that is
//!   longer on its own, which is emitted whole rather than cut.
//!
//! Lengths are counted in `char`s, not bytes, so a Cyrillic or CJK page gets
//! the same budget as a Latin one.

/// Split `text` into line-aligned chunks of at most `max_chars` characters.
///
/// Lines keep their terminators (`\n`, and the `\r` of a `\r\n`). An empty
/// input yields no chunks.
pub fn split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut end = 0usize;
    let mut len = 0usize;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if len > 0 && len + line_len > max_chars {
            chunks.push(&text[start..end]);
            start = end;
            len = 0;
        }
        end += line.len();
        len += line_len;
    }
    if end > start {
        chunks.push(&text[start..end]);
    }
    chunks
}
