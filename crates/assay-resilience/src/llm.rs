use crate::circuit_breaker::CircuitBreaker;
use crate::retry::RetryPolicy;
use assay_core::{AssayError, AssayResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Connection settings for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    1024
}

/// The upstream language-model call, treated as a black box that can
/// succeed, time out, or error.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Single-turn completion.
    async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> AssayResult<String>;
}

/// OpenAI-compatible backend.
///
/// Works with any provider that implements `POST /v1/chat/completions`.
pub struct HttpLlmBackend {
    config: LlmConfig,
    http: reqwest::Client,
}

impl HttpLlmBackend {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn build_messages(&self, system_prompt: Option<&str>, prompt: &str) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(2);
        if let Some(sys) = system_prompt {
            messages.push(serde_json::json!({"role": "system", "content": sys}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));
        messages
    }
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> AssayResult<String> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": self.build_messages(system_prompt, prompt),
        });

        let mut request = self.http.post(&url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| AssayError::Llm(e.to_string()))?;
        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AssayError::Llm(e.to_string()))?;

        if status.is_client_error() && status.as_u16() != 429 {
            // Not transient: surface as a non-retryable error.
            return Err(AssayError::Config(format!(
                "LLM API rejected request {status}: {resp_body}"
            )));
        }
        if !status.is_success() {
            return Err(AssayError::Llm(format!("LLM API error {status}: {resp_body}")));
        }

        resp_body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| AssayError::Llm(format!("Unexpected LLM response shape: {resp_body}")))
    }
}

/// An [`LlmBackend`] protected by the `llm` circuit, retry, and a per-attempt
/// timeout: breaker → retry → timeout → backend.
pub struct GuardedLlm {
    backend: Arc<dyn LlmBackend>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl GuardedLlm {
    /// Circuit breaker dependency id for the upstream model.
    pub const DEPENDENCY: &'static str = "llm";

    pub fn new(
        backend: Arc<dyn LlmBackend>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        breaker.register(Self::DEPENDENCY);
        Self {
            backend,
            breaker,
            retry,
            timeout,
        }
    }

    /// Guarded completion. Returns `CircuitOpen` immediately while the
    /// `llm` circuit is open.
    pub async fn complete(&self, system_prompt: Option<&str>, prompt: &str) -> AssayResult<String> {
        let backend = &self.backend;
        let timeout = self.timeout;
        self.breaker
            .execute(Self::DEPENDENCY, || {
                self.retry.retry(|| async move {
                    debug!(prompt_len = prompt.len(), "Calling upstream LLM");
                    match tokio::time::timeout(timeout, backend.complete(system_prompt, prompt))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(AssayError::Llm(format!(
                            "timeout after {}ms",
                            timeout.as_millis()
                        ))),
                    }
                })
            })
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerConfig, CircuitStatus};
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct ScriptedBackend {
        results: tokio::sync::Mutex<Vec<AssayResult<String>>>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(results: Vec<AssayResult<String>>) -> Self {
            Self {
                results: tokio::sync::Mutex::new(results),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        async fn complete(&self, _system: Option<&str>, _prompt: &str) -> AssayResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().await;
            if results.is_empty() {
                Err(AssayError::Llm("no more results".into()))
            } else {
                results.remove(0)
            }
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl LlmBackend for HangingBackend {
        async fn complete(&self, _system: Option<&str>, _prompt: &str) -> AssayResult<String> {
            std::future::pending::<()>().await;
            Ok(String::new())
        }
    }

    fn instant_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn guarded_retries_then_succeeds() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(AssayError::Llm("503".into())),
            Ok("looks aligned".into()),
        ]));
        let guarded = GuardedLlm::new(
            backend.clone(),
            Arc::new(CircuitBreaker::default()),
            instant_retry(3),
            Duration::from_secs(5),
        );

        let out = guarded.complete(None, "summarise").await.unwrap();
        assert_eq!(out, "looks aligned");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_times_out_and_opens_circuit() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 60,
        }));
        let guarded = GuardedLlm::new(
            Arc::new(HangingBackend),
            breaker.clone(),
            instant_retry(1),
            Duration::from_millis(50),
        );

        let err = guarded.complete(None, "hello").await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
        assert_eq!(breaker.status(GuardedLlm::DEPENDENCY), CircuitStatus::Open);

        let err = guarded.complete(None, "hello").await.unwrap_err();
        assert!(matches!(err, AssayError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn http_backend_parses_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "fine"}}]
            })))
            .mount(&server)
            .await;

        let backend = HttpLlmBackend::new(LlmConfig {
            base_url: server.uri(),
            model: "test-model".into(),
            api_key: "sk-test".into(),
            timeout_secs: 5,
            max_tokens: 64,
        });
        assert_eq!(backend.complete(Some("sys"), "hi").await.unwrap(), "fine");
    }

    #[tokio::test]
    async fn http_backend_maps_server_error_to_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(serde_json::json!({"error": "busy"})),
            )
            .mount(&server)
            .await;

        let backend = HttpLlmBackend::new(LlmConfig {
            base_url: server.uri(),
            model: "m".into(),
            api_key: String::new(),
            timeout_secs: 5,
            max_tokens: 64,
        });
        let err = backend.complete(None, "hi").await.unwrap_err();
        assert!(crate::retry::is_retryable(&err));
    }
}
