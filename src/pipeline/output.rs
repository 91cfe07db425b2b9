//! Output assembly: page sections appended to a local file.
//!
//! Each page becomes one section:
//!
//! ```text
//! --- Page 3 ---
//! <translated text>
//!
//! ```
//!
//! A page without text is written as its marker followed by a blank line,
//! so page numbering in the output always matches the source document.
//!
//! The file is truncated for a fresh job and opened in append mode when a
//! job resumes, after the sections of already-finished pages have been
//! restored into it.

use crate::error::WorkerError;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// The marker line that opens page `page_num` (1-indexed).
pub fn page_marker(page_num: usize) -> String {
    format!("--- Page {page_num} ---\n")
}

/// Render the full section for a page. `None` or blank text yields the
/// marker-only form.
pub fn render_page(page_num: usize, text: Option<&str>) -> String {
    match text.filter(|t| !t.trim().is_empty()) {
        Some(t) => format!("{}{t}\n\n", page_marker(page_num)),
        None => format!("{}\n", page_marker(page_num)),
    }
}

/// Append-only writer for a job's output file.
pub struct OutputWriter {
    file: File,
    path: PathBuf,
    bytes_written: u64,
}

impl OutputWriter {
    /// Open `path` for a fresh job (`resume == false`, truncates) or a
    /// resumed one (`resume == true`, appends).
    pub async fn open(path: &Path, resume: bool) -> Result<Self, WorkerError> {
        let mut opts = OpenOptions::new();
        opts.create(true);
        if resume {
            opts.append(true);
        } else {
            opts.write(true).truncate(true);
        }
        let file = opts.open(path).await.map_err(|source| WorkerError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            bytes_written: 0,
        })
    }

    /// Write one page section and flush it. Returns the section written.
    pub async fn write_page(
        &mut self,
        page_num: usize,
        text: Option<&str>,
    ) -> Result<String, WorkerError> {
        let section = render_page(page_num, text);
        self.write_raw(section.as_bytes()).await?;
        Ok(section)
    }

    /// Append bytes verbatim (restored sections on resume).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), WorkerError> {
        self.file
            .write_all(bytes)
            .await
            .map_err(|source| self.io_error(source))?;
        self.file.flush().await.map_err(|source| self.io_error(source))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flush and sync to disk before the file is uploaded.
    pub async fn finish(mut self) -> Result<PathBuf, WorkerError> {
        self.file.flush().await.map_err(|source| self.io_error(source))?;
        self.file
            .sync_all()
            .await
            .map_err(|source| self.io_error(source))?;
        Ok(self.path)
    }

    /// Bytes written through this writer (not counting pre-existing content).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> WorkerError {
        WorkerError::OutputWriteFailed {
            path: self.path.clone(),
            source,
        }
    }
}
