use anyhow::{Result, anyhow};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::LlmSettings;
use crate::llm::error_handler::{ErrorHandler, LlmError, RetryConfig};

#[derive(Debug, Clone, PartialEq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" | "chatgpt" => Ok(LlmProvider::OpenAi),
            "anthropic" | "claude" => Ok(LlmProvider::Anthropic),
            "ollama" | "local" => Ok(LlmProvider::Ollama),
            _ => Err(anyhow!("Unsupported LLM provider: {}", s)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Ollama => "ollama",
        }
    }

    pub fn api_base_url(&self) -> &str {
        match self {
            LlmProvider::OpenAi => "https://api.openai.com/v1",
            LlmProvider::Anthropic => "https://api.anthropic.com/v1",
            LlmProvider::Ollama => "http://localhost:11434/api",
        }
    }

    pub fn default_model(&self) -> &str {
        match self {
            LlmProvider::OpenAi => "gpt-3.5-turbo",
            LlmProvider::Anthropic => "claude-3-5-haiku-20241022",
            LlmProvider::Ollama => "llama3",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, LlmProvider::Ollama)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

pub struct LlmClient {
    provider: LlmProvider,
    api_key: String,
    client: Client,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
    error_handler: Mutex<ErrorHandler>,
}

impl LlmClient {
    pub fn new(provider: LlmProvider, api_key: String) -> Result<Self> {
        if provider.requires_api_key() && api_key.trim().is_empty() {
            return Err(anyhow!("API key cannot be empty"));
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let error_handler = Mutex::new(ErrorHandler::new(provider.name(), RetryConfig::default()));

        Ok(Self {
            model: provider.default_model().to_string(),
            base_url: provider.api_base_url().to_string(),
            provider,
            api_key,
            client,
            temperature: 0.1,
            max_tokens: 1000,
            error_handler,
        })
    }

    /// Build a client from the `llm` configuration section
    pub fn from_settings(settings: &LlmSettings) -> Result<Self> {
        let provider = LlmProvider::from_str(&settings.provider)?;
        let mut client = Self::new(provider, settings.api_key.clone())?
            .with_timeout(Duration::from_secs(settings.timeout.max(1)))?;

        if !settings.model.trim().is_empty() {
            client = client.with_model(settings.model.clone());
        }
        if let Some(url) = settings.base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            client = client.with_base_url(url.to_string());
        }
        client.temperature = settings.temperature;
        client.max_tokens = settings.max_tokens;

        Ok(client)
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = model;
        self
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn provider(&self) -> &LlmProvider {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let request = &request;
        let operation = || async move {
            match self.provider {
                LlmProvider::OpenAi => self.generate_openai_internal(request).await,
                LlmProvider::Anthropic => self.generate_anthropic_internal(request).await,
                LlmProvider::Ollama => self.generate_ollama_internal(request).await,
            }
        };

        let mut handler = self.error_handler.lock().await;
        let response = handler.execute_with_retry(operation).await?;
        debug!(
            provider = %response.provider,
            model = %response.model,
            tokens = response.usage.as_ref().map(|u| u.total_tokens),
            "LLM response received"
        );
        Ok(response)
    }

    fn network_error(&self, error: reqwest::Error) -> LlmError {
        LlmError::NetworkError {
            provider: self.provider.name().to_string(),
            retryable: error.is_timeout() || error.is_connect() || error.is_request(),
            error: error.to_string(),
        }
    }

    fn parse_error(&self, message: impl Into<String>) -> LlmError {
        LlmError::ParseError {
            provider: self.provider.name().to_string(),
            message: message.into(),
        }
    }

    /// Map an unsuccessful HTTP status onto the retry taxonomy
    async fn status_error(&self, response: Response) -> LlmError {
        let provider = self.provider.name().to_string();
        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        let message = format!("{}: {}", status, body.trim());

        match status {
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
                provider,
                message,
                retry_after,
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                LlmError::AuthenticationError { provider, message }
            }
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
                LlmError::InvalidRequest { provider, message }
            }
            s if s.is_server_error() => LlmError::ServiceUnavailable {
                provider,
                retry_after,
            },
            _ => LlmError::ApiError { provider, message },
        }
    }

    async fn read_json(&self, response: Response) -> Result<Value, LlmError> {
        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| self.parse_error(e.to_string()))
    }

    async fn generate_openai_internal(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({
                "role": "system",
                "content": system
            }));
        }
        messages.push(json!({
            "role": "user",
            "content": request.prompt
        }));

        let payload = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "temperature": request.temperature.unwrap_or(self.temperature)
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;

        let response_json = self.read_json(response).await?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| self.parse_error("Invalid OpenAI response format"))?
            .to_string();

        let usage = response_json.get("usage").map(|usage_data| Usage {
            prompt_tokens: usage_data["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage_data["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: usage_data["total_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(LlmResponse {
            content,
            usage,
            model: self.model.clone(),
            provider: self.provider.name().to_string(),
        })
    }

    async fn generate_anthropic_internal(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/messages", self.base_url);

        // System prompt is a top-level parameter for Anthropic
        let mut payload = json!({
            "model": self.model,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "temperature": request.temperature.unwrap_or(self.temperature),
            "messages": [{
                "role": "user",
                "content": request.prompt
            }]
        });
        if let Some(system) = &request.system_prompt {
            payload["system"] = json!(system);
        }

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;

        let response_json = self.read_json(response).await?;

        let content = response_json["content"][0]["text"]
            .as_str()
            .ok_or_else(|| self.parse_error("Invalid Anthropic response format"))?
            .to_string();

        let usage = response_json.get("usage").map(|usage_data| {
            let input = usage_data["input_tokens"].as_u64().unwrap_or(0) as u32;
            let output = usage_data["output_tokens"].as_u64().unwrap_or(0) as u32;
            Usage {
                prompt_tokens: input,
                completion_tokens: output,
                total_tokens: input + output,
            }
        });

        Ok(LlmResponse {
            content,
            usage,
            model: self.model.clone(),
            provider: self.provider.name().to_string(),
        })
    }

    async fn generate_ollama_internal(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/generate", self.base_url);

        let payload = json!({
            "model": self.model,
            "prompt": request.prompt,
            "system": request.system_prompt.clone().unwrap_or_default(),
            "stream": false,
            "options": {
                "num_predict": request.max_tokens.unwrap_or(self.max_tokens),
                "temperature": request.temperature.unwrap_or(self.temperature)
            }
        });

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.network_error(e))?;

        let response_json = self.read_json(response).await?;

        let content = response_json["response"]
            .as_str()
            .ok_or_else(|| self.parse_error("Invalid Ollama response format"))?
            .to_string();

        let usage = response_json.get("prompt_eval_count").map(|prompt_eval_count| {
            let prompt_tokens = prompt_eval_count.as_u64().unwrap_or(0) as u32;
            let completion_tokens = response_json["eval_count"].as_u64().unwrap_or(0) as u32;
            Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }
        });

        Ok(LlmResponse {
            content,
            usage,
            model: self.model.clone(),
            provider: self.provider.name().to_string(),
        })
    }
}
