use std::hash::Hasher;

use async_trait::async_trait;
use twox_hash::XxHash64;

use evidb_core::{EmbeddingProvider, Error, ProviderIdentity, ProviderKind, Result};

pub const HASHING_MODEL: &str = "hashing";

/// Deterministic bag-of-tokens embedder: each lowercased alphanumeric token
/// is hashed into one bucket, then the vector is L2-normalised.
///
/// Needs no model files, so it backs offline setups and tests. Texts sharing
/// words score higher than texts that do not; there is no semantics beyond
/// that.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    identity: ProviderIdentity,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::configuration("hashing embedder dimension must be at least 1"));
        }
        Ok(Self { identity: ProviderIdentity::new(ProviderKind::LocalEmbedding, HASHING_MODEL, dimension) })
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let dim = self.identity.dimension;
        let mut v = vec![0f32; dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = XxHash64::with_seed(0);
            hasher.write(token.to_lowercase().as_bytes());
            let h = hasher.finish();
            let idx = (h % dim as u64) as usize;
            let val = 0.5 + ((h >> 32) as u32 as f32) / (u32::MAX as f32) * 0.5;
            v[idx] += val;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        for x in &mut v {
            *x /= norm;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn identity(&self) -> &ProviderIdentity {
        &self.identity
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}
