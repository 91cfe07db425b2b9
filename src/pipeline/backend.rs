//! Chat-completion backends.
//!
//! [`ChatBackend`] is one request/response exchange with a language model:
//! a system instruction and a user message in, the assistant's text out.
//! Retries, timeouts and fail-soft policy live one level up in
//! [`crate::pipeline::translate`]; a backend only reports what happened.
//!
//! Two implementations ship with the crate:
//!
//! * [`ChatCompletionsBackend`]: a direct HTTP client for any endpoint that
//!   speaks the OpenAI chat-completions wire format
//!   (`{model, messages, temperature}` → `choices[0].message.content`).
//! * [`ProviderBackend`]: wraps an edgequake-llm [`LLMProvider`], giving
//!   access to every provider that crate supports (OpenAI, Anthropic,
//!   Gemini, Azure, Ollama, …).

use crate::error::BackendError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Response bodies quoted in errors are cut to this many characters.
const MAX_ERROR_BODY_CHARS: usize = 4000;

/// One chat-completion request.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub user: &'a str,
    pub temperature: f32,
}

/// A single chat-completion exchange with a language model.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Short name for logs, e.g. `chat-completions` or `openai`.
    fn name(&self) -> &str;

    /// Send one request and return the assistant text.
    async fn complete(&self, request: &ChatRequest<'_>) -> Result<String, BackendError>;
}

// ── HTTP chat-completions ────────────────────────────────────────────────

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: [WireMessage<'a>; 2],
    temperature: f32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    content: Option<String>,
}

/// Direct HTTP client for an OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct ChatCompletionsBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for ChatCompletionsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsBackend")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ChatCompletionsBackend {
    pub const DEFAULT_URL: &'static str = "https://api.openai.com/v1/chat/completions";

    /// Build a client for `url`, sending `api_key` as a Bearer token when given.
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChatBackend for ChatCompletionsBackend {
    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn complete(&self, request: &ChatRequest<'_>) -> Result<String, BackendError> {
        let body = WireRequest {
            model: request.model,
            messages: [
                WireMessage {
                    role: "system",
                    content: request.system,
                },
                WireMessage {
                    role: "user",
                    content: request.user,
                },
            ],
            temperature: request.temperature,
        };

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        parse_completion(status, &bytes)
    }
}

/// Map an HTTP status and body to the assistant text.
fn parse_completion(status: u16, body: &[u8]) -> Result<String, BackendError> {
    if !(200..300).contains(&status) {
        let text = String::from_utf8_lossy(body);
        return Err(BackendError::Http {
            status,
            body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        });
    }
    let parsed: WireResponse =
        serde_json::from_slice(body).map_err(|e| BackendError::Malformed(e.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| BackendError::Malformed("missing choices[0].message.content".into()))
}

// ── edgequake-llm provider ───────────────────────────────────────────────

/// [`ChatBackend`] over an edgequake-llm provider.
pub struct ProviderBackend {
    provider: Arc<dyn LLMProvider>,
    name: String,
}

impl ProviderBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, name: impl Into<String>) -> Self {
        Self {
            provider,
            name: name.into(),
        }
    }

    /// Resolve a provider, from most-specific to least-specific:
    ///
    /// 1. `provider_name` given: [`ProviderFactory::create_llm_provider`] with
    ///    `model`, reading that provider's API key from the environment.
    /// 2. `EDGEQUAKE_LLM_PROVIDER` set: same, with that name.
    /// 3. Otherwise [`ProviderFactory::from_env`] picks the first provider
    ///    whose API key is present.
    pub fn resolve(provider_name: Option<&str>, model: &str) -> Result<Self, BackendError> {
        let named = provider_name
            .map(str::to_string)
            .or_else(|| std::env::var("EDGEQUAKE_LLM_PROVIDER").ok())
            .filter(|n| !n.is_empty());

        if let Some(name) = named {
            let provider = ProviderFactory::create_llm_provider(&name, model).map_err(|e| {
                BackendError::Provider {
                    provider: name.clone(),
                    detail: e.to_string(),
                }
            })?;
            return Ok(Self::new(provider, name));
        }

        let (provider, _embedding) =
            ProviderFactory::from_env().map_err(|e| BackendError::Provider {
                provider: "auto".to_string(),
                detail: format!(
                    "No LLM provider could be auto-detected from environment. \
                     Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or name a provider. Error: {e}"
                ),
            })?;
        Ok(Self::new(provider, "auto"))
    }
}

#[async_trait]
impl ChatBackend for ProviderBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ChatRequest<'_>) -> Result<String, BackendError> {
        let messages = vec![
            ChatMessage::system(request.system),
            ChatMessage::user(request.user),
        ];
        let options = CompletionOptions {
            temperature: Some(request.temperature),
            ..Default::default()
        };
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| BackendError::Provider {
                provider: self.name.clone(),
                detail: e.to_string(),
            })?;
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_choice() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"Привет"}}]}"#;
        assert_eq!(parse_completion(200, body.as_bytes()).unwrap(), "Привет");
    }

    #[test]
    fn non_success_status_is_http_error() {
        let err = parse_completion(503, b"upstream overloaded").unwrap_err();
        assert!(matches!(err, BackendError::Http { status: 503, ref body } if body == "upstream overloaded"));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(10_000);
        match parse_completion(500, body.as_bytes()).unwrap_err() {
            BackendError::Http { body, .. } => assert_eq!(body.len(), MAX_ERROR_BODY_CHARS),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_content_is_malformed() {
        for body in [
            &br#"{"choices":[]}"#[..],
            br#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#,
            br#"{"error":"nope"}"#,
            b"<html>not json</html>",
        ] {
            assert!(matches!(
                parse_completion(200, body),
                Err(BackendError::Malformed(_))
            ));
        }
    }

    #[test]
    fn wire_request_shape() {
        let body = WireRequest {
            model: "gpt-4o-mini",
            messages: [
                WireMessage {
                    role: "system",
                    content: "sys",
                },
                WireMessage {
                    role: "user",
                    content: "hello",
                },
            ],
            temperature: 0.3,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hello");
        assert!((json["temperature"].as_f64().unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn debug_redacts_api_key() {
        let b = ChatCompletionsBackend::new("http://localhost:1/v1", Some("sk-secret".into()))
            .unwrap();
        let dbg = format!("{b:?}");
        assert!(!dbg.contains("sk-secret"));
    }
}
