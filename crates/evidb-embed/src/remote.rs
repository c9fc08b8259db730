//! HTTP embedding endpoint client.
//!
//! Sends `{"model": .., "input": [..]}` and accepts either the OpenAI-style
//! `{"data": [{"embedding": [..], "index": n}]}` body or the Ollama-style
//! `{"embeddings": [[..]]}` body.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use evidb_core::config::RemoteEmbeddingConfig;
use evidb_core::{EmbeddingProvider, Error, ProviderIdentity, ProviderKind, Result};

pub struct RemoteEmbedder {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    identity: ProviderIdentity,
}

impl RemoteEmbedder {
    pub fn new(config: &RemoteEmbeddingConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(Error::configuration("embedding.dimension must be set for remote providers"));
        }
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Error::configuration(format!("environment variable {var} is not set"))
            })?),
            None => None,
        };
        let client = Client::builder()
            .build()
            .map_err(|e| Error::configuration(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            identity: ProviderIdentity::new(ProviderKind::RemoteEmbedding, config.model.clone(), config.dimension),
        })
    }

    fn provider_name(&self) -> String {
        self.identity.to_string()
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbedder {
    fn identity(&self) -> &ProviderIdentity {
        &self.identity
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let body = json!({ "model": self.identity.model, "input": texts });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await.map_err(|e| classify_transport(&self.provider_name(), &e))?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        let payload: serde_json::Value = res
            .json()
            .await
            .map_err(|e| Error::Provider(format!("invalid embedding response: {e}")))?;
        parse_embeddings(payload)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    OpenAi { data: Vec<OpenAiEmbedding> },
    Ollama { embeddings: Vec<Vec<f32>> },
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// Extract vectors in input order from either supported response shape.
pub fn parse_embeddings(payload: serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let response: EmbeddingResponse = serde_json::from_value(payload)
        .map_err(|e| Error::Provider(format!("unrecognised embedding response: {e}")))?;
    match response {
        EmbeddingResponse::OpenAi { mut data } => {
            data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
            Ok(data.into_iter().map(|d| d.embedding).collect())
        }
        EmbeddingResponse::Ollama { embeddings } => Ok(embeddings),
    }
}

/// Server-side and rate-limit failures are retried; other statuses are not.
pub fn classify_status(status: StatusCode, body: &str) -> Error {
    let msg = format!("embedding endpoint returned {status}: {}", body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::ProviderUnavailable(msg)
    } else {
        Error::Provider(msg)
    }
}

fn classify_transport(provider: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::ProviderTimeout { provider: provider.to_string(), attempts: 1 }
    } else if e.is_connect() || e.is_request() {
        Error::ProviderUnavailable(format!("{provider}: {e}"))
    } else {
        Error::Provider(format!("{provider}: {e}"))
    }
}
