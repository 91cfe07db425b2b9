//! Page text extraction.
//!
//! ## Blocking extractors behind an async wrapper
//!
//! PDF parsers are synchronous and CPU-bound, and pdfium keeps global state
//! behind its own lock. [`TextExtractor`] is therefore a plain blocking
//! trait, and [`Document`] runs every call on tokio's blocking pool with a
//! deadline so one pathological PDF cannot stall the scheduler.
//!
//! ## Failure isolation
//!
//! A document that cannot be opened at all is job-fatal
//! ([`WorkerError::OpenDocument`]). A single page that fails to yield text is
//! logged and treated as empty; the job carries on with the next page.
//!
//! ## Batches
//!
//! [`PageCursor`] pulls pages `page_batch_size` at a time and the extractor
//! re-opens the document for every batch, so a 2 000-page PDF never keeps
//! more than one batch of parsed pages alive.

use crate::error::{ExtractError, PageError, WorkerError};
use pdfium_render::prelude::*;
use std::collections::VecDeque;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A synchronous, per-page text source.
///
/// Implementations are called from `spawn_blocking`; they may block freely.
pub trait TextExtractor: Send + Sync {
    /// Number of pages, or an error if the document cannot be opened.
    fn page_count(&self, path: &Path) -> Result<usize, ExtractError>;

    /// Text of each page in `pages` (0-indexed).
    ///
    /// The outer error means the document itself could not be opened; inner
    /// errors are per-page and must not stop the remaining pages.
    fn extract_pages(
        &self,
        path: &Path,
        pages: Range<usize>,
    ) -> Result<Vec<Result<String, ExtractError>>, ExtractError>;
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// [`TextExtractor`] backed by the pdfium library via `pdfium-render`.
///
/// The library is located from, in order: an explicit path (file or
/// directory), `PDFIUM_LIB_PATH`, the working directory, the system library
/// search path.
#[derive(Debug, Clone, Default)]
pub struct PdfiumExtractor {
    library_path: Option<PathBuf>,
}

impl PdfiumExtractor {
    /// Extractor honouring `PDFIUM_LIB_PATH` when set.
    pub fn new() -> Self {
        Self {
            library_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    /// Extractor bound to an explicit library file or directory.
    pub fn with_library_path(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
        }
    }

    /// Fail early if the pdfium library cannot be loaded.
    pub fn check_binding(&self) -> Result<(), ExtractError> {
        self.bind().map(|_| ())
    }

    fn bind(&self) -> Result<Pdfium, ExtractError> {
        let bindings = match &self.library_path {
            Some(p) if p.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(p))
            }
            Some(p) => Pdfium::bind_to_library(p),
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("."))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| ExtractError::Binding(e.to_string()))?;
        Ok(Pdfium::new(bindings))
    }
}

/// Reject non-PDF input before pdfium sees it.
fn check_pdf_magic(path: &Path) -> Result<(), ExtractError> {
    let mut f = std::fs::File::open(path).map_err(|e| ExtractError::Io(e.to_string()))?;
    let mut magic = [0u8; 4];
    match f.read_exact(&mut magic) {
        Ok(()) if &magic == b"%PDF" => Ok(()),
        Ok(()) => Err(ExtractError::NotAPdf { magic }),
        Err(_) => Err(ExtractError::Corrupt("file shorter than a PDF header".into())),
    }
}

impl TextExtractor for PdfiumExtractor {
    fn page_count(&self, path: &Path) -> Result<usize, ExtractError> {
        check_pdf_magic(path)?;
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| ExtractError::Corrupt(format!("{e:?}")))?;
        Ok(document.pages().len() as usize)
    }

    fn extract_pages(
        &self,
        path: &Path,
        pages: Range<usize>,
    ) -> Result<Vec<Result<String, ExtractError>>, ExtractError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|e| ExtractError::Corrupt(format!("{e:?}")))?;
        let doc_pages = document.pages();
        let total = doc_pages.len() as usize;

        Ok(pages
            .map(|idx| {
                if idx >= total {
                    return Err(ExtractError::PageOutOfRange { page: idx + 1, total });
                }
                doc_pages
                    .get(idx as u16)
                    .and_then(|page| {
                        let text = page.text()?.all();
                        Ok(text)
                    })
                    .map_err(|e| ExtractError::Page {
                        page: idx + 1,
                        detail: format!("{e:?}"),
                    })
            })
            .collect())
    }
}

// ── Document ─────────────────────────────────────────────────────────────

/// An opened document: page count known, pages extracted on demand.
pub struct Document {
    extractor: Arc<dyn TextExtractor>,
    path: PathBuf,
    page_count: usize,
    timeout: Duration,
}

impl Document {
    /// Open `path` and read its page count. Failure here is job-fatal.
    pub async fn open(
        extractor: Arc<dyn TextExtractor>,
        path: &Path,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let owned = path.to_path_buf();
        let ext = Arc::clone(&extractor);
        let page_count = run_blocking(path, timeout, move || ext.page_count(&owned)).await?;
        info!(pages = page_count, path = %path.display(), "Document opened");
        Ok(Self {
            extractor,
            path: path.to_path_buf(),
            page_count,
            timeout,
        })
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Text of pages in `range`; pages that fail are returned as `""`.
    pub async fn extract_batch(&self, range: Range<usize>) -> Result<Vec<String>, WorkerError> {
        let range = range.start.min(self.page_count)..range.end.min(self.page_count);
        if range.is_empty() {
            return Ok(Vec::new());
        }
        debug!(from = range.start + 1, to = range.end, "Extracting batch");

        let expected = range.len();
        let start = range.start;
        let path = self.path.clone();
        let ext = Arc::clone(&self.extractor);
        let results = run_blocking(&self.path, self.timeout, move || {
            ext.extract_pages(&path, range)
        })
        .await?;

        let mut texts: Vec<String> = results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.unwrap_or_else(|e| {
                    let err = PageError::ExtractFailed {
                        page: start + i + 1,
                        detail: e.to_string(),
                    };
                    warn!("{err}; treating page as empty");
                    String::new()
                })
            })
            .collect();
        if texts.len() != expected {
            warn!(
                got = texts.len(),
                expected, "Extractor returned the wrong number of pages; padding with empty pages"
            );
            texts.resize(expected, String::new());
        }
        Ok(texts)
    }

    /// Text of one page (0-indexed); `""` if the page fails.
    pub async fn extract_page(&self, index: usize) -> Result<String, WorkerError> {
        Ok(self
            .extract_batch(index..index + 1)
            .await?
            .pop()
            .unwrap_or_default())
    }
}

async fn run_blocking<T, F>(path: &Path, timeout: Duration, f: F) -> Result<T, WorkerError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ExtractError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, task).await {
        Err(_) => Err(WorkerError::OpenTimeout {
            path: path.to_path_buf(),
            secs: timeout.as_secs(),
        }),
        Ok(Err(join)) => Err(WorkerError::Internal(format!(
            "Extraction task panicked: {join}"
        ))),
        Ok(Ok(result)) => result.map_err(|source| WorkerError::OpenDocument {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ── Page cursor ──────────────────────────────────────────────────────────

/// One page handed out by [`PageCursor`], with its neighbours' text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorPage {
    /// 0-indexed page number.
    pub index: usize,
    pub text: String,
    /// Text of page `index - 1`, if there is one.
    pub previous: Option<String>,
    /// Text of page `index + 1`, if there is one.
    pub next: Option<String>,
}

/// Sequential walk over pages `start..page_count`, batch by batch.
///
/// Keeps one page of lookahead so each page can be translated with the
/// start of the next one. When resuming (`start > 0`) the page before
/// `start` is extracted once, for context only.
pub struct PageCursor<'a> {
    doc: &'a Document,
    batch_size: usize,
    fetched_until: usize,
    next_index: usize,
    buffer: VecDeque<String>,
    previous: Option<String>,
}

impl<'a> PageCursor<'a> {
    pub async fn new(
        doc: &'a Document,
        start: usize,
        batch_size: usize,
    ) -> Result<PageCursor<'a>, WorkerError> {
        let start = start.min(doc.page_count());
        let previous = if start > 0 {
            Some(doc.extract_page(start - 1).await?)
        } else {
            None
        };
        Ok(Self {
            doc,
            batch_size: batch_size.max(1),
            fetched_until: start,
            next_index: start,
            buffer: VecDeque::new(),
            previous,
        })
    }

    /// The next page, or `None` past the last page.
    pub async fn advance(&mut self) -> Result<Option<CursorPage>, WorkerError> {
        while self.buffer.len() < 2 && self.fetched_until < self.doc.page_count() {
            let end = (self.fetched_until + self.batch_size).min(self.doc.page_count());
            let batch = self.doc.extract_batch(self.fetched_until..end).await?;
            self.buffer.extend(batch);
            self.fetched_until = end;
        }

        let Some(text) = self.buffer.pop_front() else {
            return Ok(None);
        };
        let page = CursorPage {
            index: self.next_index,
            previous: self.previous.replace(text.clone()),
            next: self.buffer.front().cloned(),
            text,
        };
        self.next_index += 1;
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pages are the form-feed-separated sections of a text file.
    struct FormFeedExtractor {
        fail_page: Option<usize>,
        opens: AtomicUsize,
    }

    impl FormFeedExtractor {
        fn new(fail_page: Option<usize>) -> Self {
            Self {
                fail_page,
                opens: AtomicUsize::new(0),
            }
        }

        fn read(path: &Path) -> Result<Vec<String>, ExtractError> {
            let raw = std::fs::read_to_string(path).map_err(|e| ExtractError::Io(e.to_string()))?;
            Ok(raw.split('\x0c').map(str::to_string).collect())
        }
    }

    impl TextExtractor for FormFeedExtractor {
        fn page_count(&self, path: &Path) -> Result<usize, ExtractError> {
            Ok(Self::read(path)?.len())
        }

        fn extract_pages(
            &self,
            path: &Path,
            pages: Range<usize>,
        ) -> Result<Vec<Result<String, ExtractError>>, ExtractError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let all = Self::read(path)?;
            Ok(pages
                .map(|i| {
                    if Some(i) == self.fail_page {
                        Err(ExtractError::Page {
                            page: i + 1,
                            detail: "bad content stream".into(),
                        })
                    } else {
                        Ok(all[i].clone())
                    }
                })
                .collect())
        }
    }

    fn write_doc(pages: &[&str]) -> tempfile::NamedTempFile {
        let f = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(f.path(), pages.join("\x0c")).unwrap();
        f
    }

    #[tokio::test]
    async fn failed_page_becomes_empty() {
        let f = write_doc(&["one", "two", "three"]);
        let ext = Arc::new(FormFeedExtractor::new(Some(1)));
        let doc = Document::open(ext, f.path(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(doc.page_count(), 3);
        let texts = doc.extract_batch(0..3).await.unwrap();
        assert_eq!(texts, vec!["one", "", "three"]);
    }

    #[tokio::test]
    async fn unreadable_document_is_fatal() {
        let ext = Arc::new(FormFeedExtractor::new(None));
        let err = Document::open(ext, Path::new("/nonexistent/doc.pdf"), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::OpenDocument { .. }));
    }

    #[tokio::test]
    async fn cursor_yields_neighbours_across_batches() {
        let f = write_doc(&["p1", "p2", "p3", "p4", "p5"]);
        let ext = Arc::new(FormFeedExtractor::new(None));
        let doc = Document::open(ext.clone(), f.path(), Duration::from_secs(5))
            .await
            .unwrap();
        let mut cursor = PageCursor::new(&doc, 0, 2).await.unwrap();

        let mut seen = Vec::new();
        while let Some(page) = cursor.advance().await.unwrap() {
            seen.push(page);
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0].previous, None);
        assert_eq!(seen[0].next.as_deref(), Some("p2"));
        // p3 sits at a batch boundary: its lookahead comes from the next batch.
        assert_eq!(seen[1].next.as_deref(), Some("p3"));
        assert_eq!(seen[2].previous.as_deref(), Some("p2"));
        assert_eq!(seen[2].next.as_deref(), Some("p4"));
        assert_eq!(seen[4].next, None);
        assert_eq!(ext.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cursor_resumes_with_previous_page_context() {
        let f = write_doc(&["p1", "p2", "p3"]);
        let ext = Arc::new(FormFeedExtractor::new(None));
        let doc = Document::open(ext, f.path(), Duration::from_secs(5)).await.unwrap();
        let mut cursor = PageCursor::new(&doc, 2, 20).await.unwrap();

        let page = cursor.advance().await.unwrap().unwrap();
        assert_eq!(page.index, 2);
        assert_eq!(page.text, "p3");
        assert_eq!(page.previous.as_deref(), Some("p2"));
        assert!(cursor.advance().await.unwrap().is_none());
    }

    #[test]
    fn magic_check_rejects_non_pdf() {
        let f = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(f.path(), b"PK\x03\x04zipfile").unwrap();
        assert!(matches!(
            check_pdf_magic(f.path()),
            Err(ExtractError::NotAPdf { magic }) if &magic == b"PK\x03\x04"
        ));
        std::fs::write(f.path(), b"%PDF-1.7\n").unwrap();
        assert!(check_pdf_magic(f.path()).is_ok());
    }

    #[test]
    fn library_directory_without_pdfium_is_a_binding_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PdfiumExtractor::with_library_path(dir.path())
            .check_binding()
            .unwrap_err();
        assert!(matches!(err, ExtractError::Binding(_)), "got {err:?}");
    }
}
