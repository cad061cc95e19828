//! OpenAI-compatible chat completions backend.
//!
//! Works with any provider speaking the chat completions API: OpenAI,
//! OpenRouter, or a self-hosted endpoint. Pass the model identifier and
//! base URL for your provider. Enabled by the `http` cargo feature.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use super::{
    parse_composition, Backend, BackendError, BackendResult, CancelToken, JudgeRequest,
    RequestKind, Verdict,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Configuration for an OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Model identifier, e.g. "gpt-4o-mini" or "google/gemini-2.5-flash".
    pub model: String,
    /// API base URL without the trailing endpoint path.
    pub base_url: String,
    /// Bearer token. `None` for unauthenticated local endpoints.
    pub api_key: Option<String>,
    /// Per-call HTTP timeout.
    pub timeout: Duration,
    /// Completion token ceiling per call.
    pub max_tokens: u32,
}

impl OpenAiConfig {
    /// Config for a model on the default OpenAI endpoint.
    #[must_use]
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Overrides the base URL (OpenRouter, self-hosted, proxy).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Backend for any provider speaking the OpenAI chat completions API.
///
/// The blocking client is cheap to clone internally and safe for
/// concurrent use, so one backend value can serve several simultaneous
/// evaluations.
#[derive(Debug)]
pub struct OpenAiCompatibleBackend {
    name: String,
    config: OpenAiConfig,
    client: reqwest::blocking::Client,
}

impl OpenAiCompatibleBackend {
    /// Creates a backend named after its model id.
    ///
    /// # Errors
    /// `BackendError::Transport` if the HTTP client cannot be built.
    pub fn new(config: OpenAiConfig) -> BackendResult<Self> {
        let name = config.model.clone();
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::Transport {
                backend: name.clone(),
                message: format!("client build failed: {e}"),
            })?;
        Ok(Self {
            name,
            config,
            client,
        })
    }

    fn complete(&self, prompt: &str) -> BackendResult<String> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout {
                    backend: self.name.clone(),
                    elapsed_ms: self.config.timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                }
            } else {
                BackendError::Transport {
                    backend: self.name.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(BackendError::Transport {
                backend: self.name.clone(),
                message: format!("HTTP {status}: {}", truncate(&detail, 200)),
            });
        }

        let parsed: ChatResponse = response.json().map_err(|e| BackendError::Malformed {
            backend: self.name.clone(),
            message: format!("completion envelope: {e}"),
            raw: String::new(),
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::Malformed {
                backend: self.name.clone(),
                message: "response has no message content".to_string(),
                raw: String::new(),
            })
    }
}

impl Backend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn judge(&self, request: &JudgeRequest, cancel: &CancelToken) -> BackendResult<Verdict> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled {
                backend: self.name.clone(),
            });
        }

        let raw = self.complete(&request.prompt)?;

        // The call may have raced a cancellation; a cancelled evaluation
        // must not observe this verdict.
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled {
                backend: self.name.clone(),
            });
        }

        match request.kind {
            RequestKind::Composition => parse_composition(&self.name, &raw),
            RequestKind::PairRule { .. }
            | RequestKind::Exploration { .. }
            | RequestKind::Decomposition => Ok(Verdict::raw_only(raw)),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
