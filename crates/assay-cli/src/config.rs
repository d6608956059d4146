use assay_orchestrator::OrchestratorConfig;
use assay_resilience::{BreakerConfig, LlmConfig, RetryPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides `llm.api_key`.
pub const LLM_API_KEY_ENV: &str = "ASSAY_LLM_API_KEY";

/// Top-level `assay.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Optional model used for verification commentary.
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    /// `[[agents]]` file replacing the built-in capability set.
    #[serde(default)]
    pub agents_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accepted API keys. Empty disables authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: vec![],
        }
    }
}

/// Where worker queues are reachable over HTTP.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_workers_base_url")]
    pub base_url: String,
    /// Hard cap on a single HTTP dispatch, above any scenario timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            base_url: default_workers_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_workers_base_url() -> String {
    "http://127.0.0.1:8081".to_string()
}
fn default_request_timeout_secs() -> u64 {
    300
}
fn default_webhook_timeout_secs() -> u64 {
    10
}

impl AssayConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a config file. Relative `agents_file` paths are resolved against
    /// the file's directory.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let mut config = Self::from_toml_str(&content)?;
        if let Some(agents) = config.agents_file.as_mut() {
            if agents.is_relative() {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                *agents = base.join(&*agents);
            }
        }
        Ok(config)
    }

    /// Apply environment overrides using `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let (Some(llm), Some(key)) = (self.llm.as_mut(), lookup(LLM_API_KEY_ENV)) {
            llm.api_key = key;
        }
    }
}
