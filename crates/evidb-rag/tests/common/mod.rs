#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evidb_core::config::{ChunkingConfig, DispatchConfig, Settings};
use evidb_core::{Document, EmbeddingProvider, Error, ProviderIdentity, ProviderKind, Result};

pub const DIMENSION: usize = 5;

/// Maps each word onto one of a few concept buckets so similarity is
/// predictable: discounts, shipping, speed, price-free, everything else.
pub struct ConceptEmbedder {
    identity: ProviderIdentity,
    stalled: AtomicBool,
    fail_after: Option<u32>,
    calls: AtomicU32,
}

impl ConceptEmbedder {
    pub fn new() -> Self {
        Self::named("concepts")
    }

    pub fn named(model: &str) -> Self {
        Self {
            identity: ProviderIdentity::new(ProviderKind::RemoteEmbedding, model, DIMENSION),
            stalled: AtomicBool::new(false),
            fail_after: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Answers `calls` batches, then fails every later one.
    pub fn failing_after(calls: u32) -> Self {
        Self { fail_after: Some(calls), ..Self::new() }
    }

    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0f32; DIMENSION];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let bucket = match word.to_lowercase().as_str() {
                "discount" | "discounts" | "save15" | "off" | "code" | "codes" | "coupon" => 0,
                "shipping" | "ship" | "delivery" => 1,
                "express" | "fast" => 2,
                "free" | "standard" => 3,
                _ => 4,
            };
            v[bucket] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for ConceptEmbedder {
    fn identity(&self) -> &ProviderIdentity {
        &self.identity
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|n| call >= n) {
            return Err(Error::Provider("model crashed".into()));
        }
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

pub fn settings(max_chars: usize, overlap: usize) -> Settings {
    let mut settings = Settings::default();
    settings.chunking = ChunkingConfig::new(max_chars, overlap);
    settings.dispatch = DispatchConfig { batch_size: 1, concurrency: 2, timeout_ms: 100, max_retries: 0, backoff_ms: 1 };
    settings
}

pub fn provider(embedder: ConceptEmbedder) -> (Arc<ConceptEmbedder>, Arc<dyn EmbeddingProvider>) {
    let embedder = Arc::new(embedder);
    let dynamic: Arc<dyn EmbeddingProvider> = embedder.clone();
    (embedder, dynamic)
}

pub fn shop_document() -> Document {
    Document::new(
        "shop",
        "shop.md",
        "SAVE15 gives 15% off\n\nExpress shipping is $10\n\nStandard shipping is free",
        "md",
    )
}
