use async_trait::async_trait;

use crate::error::Result;
use crate::types::ProviderIdentity;

/// Turns text into fixed-dimension vectors.
///
/// Implementations must be deterministic for a given identity: the same text
/// always maps to the same vector, otherwise indexed vectors and query vectors
/// stop being comparable.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn identity(&self) -> &ProviderIdentity;

    fn dimension(&self) -> usize {
        self.identity().dimension
    }

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| crate::error::Error::Provider("provider returned no vector".into()))
    }
}
