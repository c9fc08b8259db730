//! Text generators that consume a grounding context.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use evidb_core::config::{GeneratorConfig, GroqConfig, OllamaConfig};
use evidb_core::{Error, Result};

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String>;
}

pub fn build_generator(config: &GeneratorConfig) -> Result<Arc<dyn Generator>> {
    let generator: Arc<dyn Generator> = match config {
        GeneratorConfig::Ollama(cfg) => Arc::new(OllamaGenerator::new(cfg)?),
        GeneratorConfig::Groq(cfg) => Arc::new(GroqGenerator::new(cfg)?),
    };
    Ok(generator)
}

fn http_client(timeout_ms: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| Error::configuration(format!("http client: {e}")))
}

fn transport_error(provider: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Generation(format!("request to {provider} timed out"))
    } else if e.is_connect() {
        Error::Generation(format!("cannot connect to {provider}: {e}"))
    } else {
        Error::Generation(format!("{provider}: {e}"))
    }
}

/// Local Ollama server, `/api/generate` without streaming.
pub struct OllamaGenerator {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_ms)?,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "num_predict": max_tokens },
        });
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("ollama", &e))?;

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::Generation(format!(
                "model '{}' not found; run `ollama pull {}`",
                self.model, self.model
            )));
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("ollama returned {status}: {}", text.trim())));
        }
        let payload: Value = res.json().await.map_err(|e| transport_error("ollama", &e))?;
        Ok(payload["response"].as_str().unwrap_or_default().to_string())
    }
}

/// Groq's OpenAI-compatible chat completions endpoint.
pub struct GroqGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GroqGenerator {
    pub fn new(config: &GroqConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            Error::configuration(format!("environment variable {} is not set", config.api_key_env))
        })?;
        Ok(Self {
            client: http_client(config.timeout_ms)?,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl Generator for GroqGenerator {
    fn name(&self) -> &str {
        "groq"
    }

    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": max_tokens,
            "stream": false,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("groq", &e))?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("groq returned {status}: {}", text.trim())));
        }
        let payload: Value = res.json().await.map_err(|e| transport_error("groq", &e))?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Generation("groq response has no message content".into()))
    }
}
