use std::sync::Arc;
use std::time::Duration;

use evidb_core::config::DispatchConfig;
use evidb_core::{EmbeddingProvider, Error, ProviderIdentity, Result};

/// Bounded, validated calls into an [`EmbeddingProvider`].
///
/// Every call runs under a timeout; transient failures (timeouts, unavailable
/// backends) are retried with doubling backoff up to `max_retries` times,
/// after which `ProviderTimeout` is surfaced. Returned vectors are checked
/// for count, dimension and finiteness before anything downstream sees them.
#[derive(Clone)]
pub struct EmbeddingDispatcher {
    provider: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
    batch_size: usize,
}

impl EmbeddingDispatcher {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &DispatchConfig) -> Self {
        Self {
            provider,
            timeout: Duration::from_millis(config.timeout_ms),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn identity(&self) -> &ProviderIdentity {
        self.provider.identity()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let provider = self.identity().to_string();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.timeout, self.provider.embed_batch(texts)).await {
                Ok(result) => result,
                Err(_) => Err(Error::ProviderTimeout { provider: provider.clone(), attempts: attempt }),
            };
            match outcome {
                Ok(vectors) => {
                    self.validate(texts.len(), &vectors)?;
                    tracing::debug!(provider = %provider, batch = texts.len(), attempt, "batch embedded");
                    return Ok(vectors);
                }
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let delay = self.backoff.saturating_mul(1u32 << (attempt - 1).min(16));
                    tracing::warn!(provider = %provider, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying embedding call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(provider = %provider, attempts = attempt, error = %e, "embedding provider gave up");
                    return Err(Error::ProviderTimeout { provider, attempts: attempt });
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Provider("provider returned no vector for query".into()))
    }

    fn validate(&self, expected_len: usize, vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() != expected_len {
            return Err(Error::Provider(format!(
                "provider returned {} vectors for {expected_len} inputs",
                vectors.len()
            )));
        }
        let dimension = self.identity().dimension;
        for v in vectors {
            if v.len() != dimension {
                return Err(Error::DimensionMismatch { expected: dimension, actual: v.len() });
            }
            if v.iter().any(|x| !x.is_finite()) {
                return Err(Error::InvalidVector("provider returned a non-finite component".into()));
            }
        }
        Ok(())
    }
}
