use crate::config::{GenerationConfig, GenerationProvider};
use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Prompt in, text out
pub trait GenerationClient: Send + Sync {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, CacheError>;
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    seed: u64,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Ollama `/api/generate` with pinned sampling
pub struct OllamaClient {
    agent: ureq::Agent,
    base_url: String,
    temperature: f32,
    seed: u64,
}

impl OllamaClient {
    pub fn new(config: &GenerationConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            seed: config.seed,
        }
    }
}

impl GenerationClient for OllamaClient {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, CacheError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
                seed: self.seed,
            },
        };
        debug!(%url, model, "Calling generation service");

        let response = self
            .agent
            .post(&url)
            .send_json(&request)
            .map_err(|e| CacheError::Generation(format!("{}: {}", url, e)))?;
        let body: GenerateResponse = response
            .into_json()
            .map_err(|e| CacheError::Generation(format!("invalid response from {}: {}", url, e)))?;
        Ok(body.response)
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    seed: u64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// OpenAI-compatible `/chat/completions` with pinned sampling
pub struct OpenAiClient {
    agent: ureq::Agent,
    base_url: String,
    api_key: Option<String>,
    api_key_env: String,
    temperature: f32,
    seed: u64,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn new(config: &GenerationConfig, api_key: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            api_key_env: config.api_key_env.clone(),
            temperature: config.temperature,
            seed: config.seed,
            max_tokens: config.max_tokens,
        }
    }

    /// Key read from the environment variable named in `config`. A missing
    /// key only fails calls that actually reach the service.
    pub fn from_env(config: &GenerationConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        if api_key.is_none() {
            warn!(var = %config.api_key_env, "API key not set, remote generation unavailable");
        }
        Self::new(config, api_key)
    }
}

impl GenerationClient for OpenAiClient {
    fn generate(&self, model: &str, prompt: &str) -> Result<String, CacheError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CacheError::Generation(format!("{} is not set", self.api_key_env)))?;
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            seed: self.seed,
            max_tokens: self.max_tokens,
        };
        debug!(%url, model, "Calling remote generation service");

        let response = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", api_key))
            .send_json(&request)
            .map_err(|e| CacheError::Generation(format!("{}: {}", url, e)))?;
        let body: ChatResponse = response
            .into_json()
            .map_err(|e| CacheError::Generation(format!("invalid response from {}: {}", url, e)))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CacheError::Generation(format!("empty completion from {}", url)))
    }
}

/// Client for the configured provider
pub fn client_for(config: &GenerationConfig) -> Arc<dyn GenerationClient> {
    match config.provider {
        GenerationProvider::Ollama => Arc::new(OllamaClient::new(config)),
        GenerationProvider::OpenAi => Arc::new(OpenAiClient::from_env(config)),
    }
}
