//! Object storage for inputs, outputs and resume segments.
//!
//! Keys are `/`-separated and relative (`inputs/7/<uuid>_report.pdf`).
//! [`FsObjectStore`] maps them onto a directory tree under
//! `<root>/<bucket>/` and signs time-limited download URLs with a shared
//! secret, so a front end serving that tree can hand out links without
//! exposing the store itself.
//!
//! ## Key layout
//!
//! ```text
//! inputs/{user}/{uuid}_{filename}                    uploaded PDF
//! outputs/{user}/translated_{job}_{stem}.txt         finished translation
//! outputs/{user}/partial/{job}/page-{nnnnn}.txt      per-page resume segment
//! ```

use crate::error::StoreError;
use crate::job::JobId;
use async_trait::async_trait;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// A bucket of binary objects addressed by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Store `bytes` under `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Read a whole object into memory.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Copy the object at `key` into `local_path`.
    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StoreError>;

    /// Copy `local_path` into the store under `key`.
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), StoreError>;

    /// A URL that downloads `key` until `ttl` has passed.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StoreError>;

    /// Remove every object whose key starts with `prefix`. Returns how
    /// many were removed; a missing prefix removes nothing.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;
}

// ── Key helpers ──────────────────────────────────────────────────────────

/// Key for a newly uploaded input. The random prefix keeps re-uploads of
/// the same name apart.
pub fn input_key(user_id: i64, filename: &str) -> String {
    format!(
        "inputs/{user_id}/{}_{}",
        uuid::Uuid::new_v4().simple(),
        safe_file_name(filename)
    )
}

/// Key of the finished translation for `job`.
pub fn output_key(user_id: i64, job: JobId, filename: &str) -> String {
    let name = safe_file_name(filename);
    let stem = Path::new(&name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("document");
    format!("outputs/{user_id}/translated_{job}_{stem}.txt")
}

/// Prefix under which `job` keeps its per-page resume segments.
pub fn partial_prefix(user_id: i64, job: JobId) -> String {
    format!("outputs/{user_id}/partial/{job}/")
}

/// Segment holding the rendered section of page `page_num` (1-indexed).
pub fn segment_key(user_id: i64, job: JobId, page_num: usize) -> String {
    format!("{}page-{page_num:05}.txt", partial_prefix(user_id, job))
}

/// Last path component of an uploaded name, with separators and control
/// characters replaced.
pub fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "document.pdf".to_string(),
        _ => cleaned,
    }
}

// ── Filesystem store ─────────────────────────────────────────────────────

/// [`ObjectStore`] on a local directory tree.
pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
    base_url: String,
    secret: String,
}

impl fmt::Debug for FsObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsObjectStore")
            .field("root", &self.root)
            .field("bucket", &self.bucket)
            .field("base_url", &self.base_url)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl FsObjectStore {
    /// Objects live under `root/bucket/`. `base_url` is where that tree is
    /// served from; presigned URLs are `{base_url}/{bucket}/{key}?…`.
    pub fn new(
        root: impl Into<PathBuf>,
        bucket: impl Into<String>,
        base_url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    pub fn bucket_dir(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }

    /// Filesystem path for `key`, refusing anything that could escape the
    /// bucket directory.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = key.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(invalid("empty key"));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(invalid("keys must be relative and use '/'"));
        }
        let rel = Path::new(trimmed);
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(invalid("'.', '..' and root segments are not allowed")),
            }
        }
        if trimmed.split('/').any(|seg| seg.is_empty() || seg == ".") {
            return Err(invalid("empty segment"));
        }
        Ok(self.bucket_dir().join(rel))
    }

    /// HMAC-SHA256 under the store secret over `bucket\nkey\nexpires`.
    fn mac(&self, key: &str, expires: u64) -> Result<HmacSha256, InvalidLength> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())?;
        mac.update(self.bucket.as_bytes());
        mac.update(b"\n");
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// Sign `key` for download until `expires` (Unix seconds).
    fn signature(&self, key: &str, expires: u64) -> Result<String, InvalidLength> {
        Ok(hex::encode(self.mac(key, expires)?.finalize().into_bytes()))
    }

    /// Check a presigned URL's parameters in constant time. Used by
    /// whatever serves the tree.
    pub fn verify_presigned(&self, key: &str, expires: u64, signature: &str) -> bool {
        if unix_now() > expires {
            return false;
        }
        match (hex::decode(signature), self.mac(key, expires)) {
            (Ok(tag), Ok(mac)) => mac.verify_slice(&tag).is_ok(),
            _ => false,
        }
    }

    async fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.bucket_dir());
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|source| io_err(&parent, source))?;

        let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        if let Err(source) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(&tmp, source));
        }
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| io_err(&path, source))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(key, bytes).await?;
        debug!(key, bytes = bytes.len(), "Object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path).await.map_err(|source| not_found_or(key, &path, source))
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        let bytes = tokio::fs::copy(&path, local_path)
            .await
            .map_err(|source| not_found_or(key, &path, source))?;
        debug!(key, bytes, to = %local_path.display(), "Object downloaded");
        Ok(())
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), StoreError> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|source| io_err(local_path, source))?;
        self.write_atomic(key, &bytes).await?;
        debug!(key, bytes = bytes.len(), from = %local_path.display(), "Object uploaded");
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, StoreError> {
        self.resolve(key)?;
        let expires = unix_now().saturating_add(ttl.as_secs());
        let presign_err = |reason: String| StoreError::Presign {
            key: key.to_string(),
            reason,
        };

        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| presign_err(format!("invalid base URL '{}': {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| presign_err(format!("base URL '{}' cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push(&self.bucket)
            .extend(key.split('/'));
        let signature = self
            .signature(key, expires)
            .map_err(|e| presign_err(format!("cannot sign: {e}")))?;
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url.into())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let path = self.resolve(prefix)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(io_err(&path, source)),
        };
        let removed = if meta.is_dir() {
            let count = count_files(&path).await?;
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|source| io_err(&path, source))?;
            count
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|source| io_err(&path, source))?;
            1
        };
        debug!(prefix, removed, "Objects deleted");
        Ok(removed)
    }
}

async fn count_files(dir: &Path) -> Result<u64, StoreError> {
    let mut count = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|source| io_err(&dir, source))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_err(&dir, source))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|source| io_err(&entry.path(), source))?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn not_found_or(key: &str, path: &Path, source: std::io::Error) -> StoreError {
    if source.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound {
            key: key.to_string(),
        }
    } else {
        io_err(path, source)
    }
}
