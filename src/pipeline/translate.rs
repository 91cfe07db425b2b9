//! Chunk translation with retry, backoff and fail-soft fallback.
//!
//! ## Retry strategy
//!
//! Provider errors under load (429, 5xx, dropped connections, slow answers)
//! are mostly transient. Each call gets `1 + max_retries` attempts, each
//! bounded by `api_timeout`, with exponential backoff between them
//! (`retry_backoff_ms * 2^(attempt-1)`: 1.5 s → 3 s → 6 s by default).
//!
//! ## Fail-soft
//!
//! When every attempt fails the original chunk is returned unchanged. A
//! provider outage then produces a partly untranslated document instead of
//! a stuck or failed job. The outcome says so ([`TranslationOutcome::degraded`])
//! and every attempt is logged, but nothing is escalated.

use crate::config::WorkerConfig;
use crate::error::BackendError;
use crate::pipeline::backend::{ChatBackend, ChatRequest};
use crate::pipeline::postprocess::clean_translation;
use crate::prompts::{build_user_message, default_system_prompt};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// One chunk to translate, with optional neighbouring-page hints.
#[derive(Debug, Clone, Copy)]
pub struct TranslationRequest<'a> {
    pub chunk: &'a str,
    /// Tail of the previous page (first chunk of a page only).
    pub context: Option<&'a str>,
    /// Head of the next page (last chunk of a page only).
    pub lookahead: Option<&'a str>,
    /// Log label, e.g. `p3.c2/4`.
    pub part: &'a str,
}

/// What a translation call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationOutcome {
    /// The translation, or the original chunk on fallback.
    pub text: String,
    /// Backend calls made (0 when the chunk was passed through).
    pub attempts: u32,
    /// Last error when every attempt failed and the original was kept.
    pub degraded: Option<String>,
}

impl TranslationOutcome {
    fn passthrough(chunk: &str) -> Self {
        Self {
            text: chunk.to_string(),
            attempts: 0,
            degraded: None,
        }
    }
}

/// Anything that turns a chunk into its translation. Never fails.
#[async_trait]
pub trait Translate: Send + Sync {
    async fn translate(&self, request: &TranslationRequest<'_>) -> TranslationOutcome;
}

/// [`Translate`] over a [`ChatBackend`] with the retry/fail-soft policy.
pub struct TranslationClient {
    backend: Arc<dyn ChatBackend>,
    system_prompt: String,
    model: String,
    temperature: f32,
    max_retries: u32,
    retry_backoff_ms: u64,
    api_timeout: Duration,
    min_translatable_chars: usize,
}

impl TranslationClient {
    pub fn new(backend: Arc<dyn ChatBackend>, config: &WorkerConfig) -> Self {
        let system_prompt = config.system_prompt.clone().unwrap_or_else(|| {
            default_system_prompt(&config.source_language, &config.target_language)
        });
        Self {
            backend,
            system_prompt,
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            api_timeout: config.api_timeout(),
            min_translatable_chars: config.min_translatable_chars,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    async fn attempt(&self, request: &ChatRequest<'_>) -> Result<String, BackendError> {
        match timeout(self.api_timeout, self.backend.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                secs: self.api_timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl Translate for TranslationClient {
    async fn translate(&self, req: &TranslationRequest<'_>) -> TranslationOutcome {
        if req.chunk.trim().chars().count() < self.min_translatable_chars {
            debug!(part = req.part, "Chunk too short to translate; passing through");
            return TranslationOutcome::passthrough(req.chunk);
        }

        let user = build_user_message(req.chunk, req.context, req.lookahead);
        let chat = ChatRequest {
            model: &self.model,
            system: &self.system_prompt,
            user: &user,
            temperature: self.temperature,
        };
        let hints: Vec<&str> = req.context.into_iter().chain(req.lookahead).collect();
        let max_attempts = self.max_retries + 1;
        let mut last_err = String::from("no attempt made");

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self
                    .retry_backoff_ms
                    .saturating_mul(2u64.saturating_pow(attempt - 1));
                debug!(part = req.part, "Retry {}/{} after {}ms", attempt, self.max_retries, backoff);
                sleep(Duration::from_millis(backoff)).await;
            }

            let start = Instant::now();
            let result = self.attempt(&chat).await.and_then(|raw| {
                let text = clean_translation(&raw, req.chunk, &hints);
                if text.trim().is_empty() {
                    Err(BackendError::Malformed("empty translation".into()))
                } else {
                    Ok(text)
                }
            });

            match result {
                Ok(text) => {
                    info!(
                        part = req.part,
                        backend = self.backend.name(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        chars_in = req.chunk.chars().count(),
                        chars_out = text.chars().count(),
                        "Translation ok"
                    );
                    return TranslationOutcome {
                        text,
                        attempts: attempt + 1,
                        degraded: None,
                    };
                }
                Err(e) => {
                    warn!(
                        part = req.part,
                        backend = self.backend.name(),
                        "Translation attempt {}/{} failed: {}",
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    last_err = e.to_string();
                }
            }
        }

        error!(
            part = req.part,
            "Translation failed after {} attempts; keeping original chunk. Last error: {}",
            max_attempts,
            last_err
        );
        TranslationOutcome {
            text: req.chunk.to_string(),
            attempts: max_attempts,
            degraded: Some(last_err),
        }
    }
}
