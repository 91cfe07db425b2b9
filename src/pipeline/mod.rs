//! Per-document pipeline stages for translating one job.
//!
//! Each submodule implements exactly one step and is testable on its own;
//! [`crate::process`] wires them together for a claimed job.
//!
//! ## Data Flow
//!
//! ```text
//! extract ──▶ context ──▶ chunk ──▶ translate ──▶ postprocess ──▶ output
//! (pdfium)   (tail/head)  (lines)   (backend)     (cleanup)       (pages)
//! ```
//!
//! 1. [`extract`]   open the PDF, walk pages batch by batch; runs in
//!    `spawn_blocking` because pdfium is synchronous
//! 2. [`context`]   word-aligned excerpts of the neighbouring pages
//! 3. [`chunk`]     line-preserving split of a page into bounded pieces
//! 4. [`translate`] retry/backoff/fail-soft around a [`backend`] call; the
//!    only stage with network I/O
//! 5. [`postprocess`] scrub echoed delimiters and hints from model answers
//! 6. [`output`]    page markers and the append/truncate output file

pub mod backend;
pub mod chunk;
pub mod context;
pub mod extract;
pub mod output;
pub mod postprocess;
pub mod translate;
