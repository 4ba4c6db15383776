//! Upstream model providers (§4.8). One `reqwest::Client` shared across all
//! four clients; the effective per-call timeout is enforced by wrapping
//! each call in `tokio::time::timeout` rather than per-request client
//! configuration, matching the fast-text provider's configurable deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ProviderConfig;

const LOCAL_TEXT_TIMEOUT: Duration = Duration::from_secs(60);
const PREMIUM_TEXT_TIMEOUT: Duration = Duration::from_secs(60);
const MEDIA_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: &'static str,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    fn new(provider: &'static str, message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            provider,
            message: message.into(),
            status_code,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status_code == Some(429)
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.provider, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Trait seam so the dispatcher's tests can inject fakes instead of making
/// network calls.
#[async_trait]
pub trait ProviderClients: Send + Sync {
    async fn call_fast_text(&self, prompt: &str) -> Result<String, ProviderError>;
    async fn call_local_text(&self, prompt: &str) -> Result<String, ProviderError>;
    async fn call_premium_text(&self, prompt: &str) -> Result<String, ProviderError>;
    async fn call_media(
        &self,
        prompt: &str,
        media_url: &str,
        metadata: &serde_json::Map<String, Value>,
    ) -> Result<Value, ProviderError>;

    fn fast_text_timeout(&self) -> Duration;
}

/// Real HTTP-backed provider clients, grounded on `providers.py`'s
/// endpoint shapes.
pub struct HttpProviderClients {
    http: reqwest::Client,
    config: ProviderConfig,
    ollama_semaphore: Arc<tokio::sync::Semaphore>,
}

impl HttpProviderClients {
    pub fn new(config: ProviderConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let ollama_semaphore = Arc::new(tokio::sync::Semaphore::new(config.ollama_max_concurrency.max(1)));
        Self {
            http,
            config,
            ollama_semaphore,
        }
    }
}

fn malformed(provider: &'static str, body: &Value) -> ProviderError {
    ProviderError::new(provider, format!("malformed response: {body}"), None)
}

async fn timeout_error(provider: &'static str, elapsed: tokio::time::error::Elapsed) -> ProviderError {
    let _ = elapsed;
    ProviderError::new(provider, "request timed out", None)
}

#[async_trait]
impl ProviderClients for HttpProviderClients {
    async fn call_fast_text(&self, prompt: &str) -> Result<String, ProviderError> {
        let Some(api_key) = self.config.groq_api_key.as_ref() else {
            return Err(ProviderError::new("groq", "GROQ_API_KEY is not configured", None));
        };

        let url = format!("{}/chat/completions", self.config.groq_base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.config.groq_model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.2,
        });

        let call = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&payload)
            .send();

        let response = match tokio::time::timeout(self.config.groq_timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(ProviderError::new("groq", error.to_string(), error.status().map(|s| s.as_u16()))),
            Err(elapsed) => return Err(timeout_error("groq", elapsed).await),
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::new("groq", body, Some(status.as_u16())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| ProviderError::new("groq", error.to_string(), None))?;
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| malformed("groq", &body))
    }

    async fn call_local_text(&self, prompt: &str) -> Result<String, ProviderError> {
        let _permit = self
            .ollama_semaphore
            .acquire()
            .await
            .map_err(|_| ProviderError::new("ollama", "semaphore closed", None))?;

        let url = format!("{}/api/generate", self.config.ollama_base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.config.ollama_model,
            "prompt": prompt,
            "stream": false,
        });

        let call = self.http.post(&url).json(&payload).send();
        let response = match tokio::time::timeout(LOCAL_TEXT_TIMEOUT, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(ProviderError::new("ollama", error.to_string(), error.status().map(|s| s.as_u16()))),
            Err(elapsed) => return Err(timeout_error("ollama", elapsed).await),
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::new("ollama", body, Some(status.as_u16())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| ProviderError::new("ollama", error.to_string(), None))?;
        body.get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| malformed("ollama", &body))
    }

    async fn call_premium_text(&self, prompt: &str) -> Result<String, ProviderError> {
        let Some(api_key) = self.config.claude_api_key.as_ref() else {
            return Err(ProviderError::new("claude", "CLAUDE_API_KEY is not configured", None));
        };

        let url = "https://api.anthropic.com/v1/messages";
        let payload = json!({
            "model": self.config.claude_model,
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": prompt}],
        });

        let call = self
            .http
            .post(url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send();

        let response = match tokio::time::timeout(PREMIUM_TEXT_TIMEOUT, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(ProviderError::new("claude", error.to_string(), error.status().map(|s| s.as_u16()))),
            Err(elapsed) => return Err(timeout_error("claude", elapsed).await),
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::new("claude", body, Some(status.as_u16())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| ProviderError::new("claude", error.to_string(), None))?;
        let chunks = body.get("content").and_then(Value::as_array).ok_or_else(|| malformed("claude", &body))?;
        let text = chunks
            .iter()
            .filter(|chunk| chunk.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|chunk| chunk.get("text").and_then(Value::as_str))
            .collect::<String>();
        Ok(text.trim().to_string())
    }

    async fn call_media(
        &self,
        prompt: &str,
        media_url: &str,
        metadata: &serde_json::Map<String, Value>,
    ) -> Result<Value, ProviderError> {
        let Some(api_key) = self.config.kie_api_key.as_ref() else {
            return Err(ProviderError::new("kie", "KIE_API_KEY is not configured", None));
        };

        let url = format!("{}/v1/media/infer", self.config.kie_base_url.trim_end_matches('/'));
        let payload = json!({
            "prompt": prompt,
            "media_url": media_url,
            "metadata": metadata,
        });

        let call = self.http.post(&url).bearer_auth(api_key).json(&payload).send();
        let response = match tokio::time::timeout(MEDIA_TIMEOUT, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(ProviderError::new("kie", error.to_string(), error.status().map(|s| s.as_u16()))),
            Err(elapsed) => return Err(timeout_error("kie", elapsed).await),
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::new("kie", body, Some(status.as_u16())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| ProviderError::new("kie", error.to_string(), None))?;
        match body {
            Value::Object(ref map) if map.contains_key("output") => Ok(map["output"].clone()),
            other => Ok(other),
        }
    }

    fn fast_text_timeout(&self) -> Duration {
        self.config.groq_timeout
    }
}

/// Scriptable provider double — reachable from both unit tests in this
/// crate and the integration tests under `tests/`, matching how
/// `store::fake` is exposed.
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Scripted responses for dispatcher tests — no network dependency.
    pub enum Scripted {
        Text(String),
        RateLimited,
        Failure,
        NotConfigured,
    }

    #[derive(Default)]
    pub struct FakeProviderClients {
        pub fast_text: Mutex<Vec<Scripted>>,
        pub local_text: Mutex<Vec<Scripted>>,
        pub premium_text: Mutex<Vec<Scripted>>,
        pub media: Mutex<Vec<Scripted>>,
    }

    /// FIFO: responses are consumed in the order they were pushed.
    fn pop(queue: &Mutex<Vec<Scripted>>, provider: &'static str) -> Result<String, ProviderError> {
        let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
        match (!queue.is_empty()).then(|| queue.remove(0)) {
            Some(Scripted::Text(text)) => Ok(text),
            Some(Scripted::RateLimited) => Err(ProviderError::new(provider, "rate limited", Some(429))),
            Some(Scripted::Failure) => Err(ProviderError::new(provider, "failed", Some(500))),
            Some(Scripted::NotConfigured) => Err(ProviderError::new(provider, "not configured", None)),
            None => Err(ProviderError::new(provider, "no scripted response", None)),
        }
    }

    #[async_trait]
    impl ProviderClients for FakeProviderClients {
        async fn call_fast_text(&self, _prompt: &str) -> Result<String, ProviderError> {
            pop(&self.fast_text, "groq")
        }

        async fn call_local_text(&self, _prompt: &str) -> Result<String, ProviderError> {
            pop(&self.local_text, "ollama")
        }

        async fn call_premium_text(&self, _prompt: &str) -> Result<String, ProviderError> {
            pop(&self.premium_text, "claude")
        }

        async fn call_media(
            &self,
            _prompt: &str,
            _media_url: &str,
            _metadata: &serde_json::Map<String, Value>,
        ) -> Result<Value, ProviderError> {
            pop(&self.media, "kie").map(Value::String)
        }

        fn fast_text_timeout(&self) -> Duration {
            Duration::from_secs(8)
        }
    }
}
