//! In-process XLM-RoBERTa family embedding model on candle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::xlm_roberta::{Config as XLMRobertaConfig, XLMRobertaModel};
use tokenizers::Tokenizer;

use evidb_core::config::{expand_path, LocalEmbeddingConfig};
use evidb_core::{EmbeddingProvider, Error, ProviderIdentity, ProviderKind, Result};

use crate::device::select_device;
use crate::pool::masked_mean_l2;
use crate::tokenize::{model_err, tokenize_batch};

struct LoadedModel {
    model: XLMRobertaModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl LoadedModel {
    fn embed_sync(&self, texts: &[String], max_len: usize) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let (input_ids, attention_mask) = tokenize_batch(&self.tokenizer, texts, max_len, &self.device)?;
        let token_type_ids = input_ids.zeros_like().map_err(model_err)?;
        let hidden = self
            .model
            .forward(&input_ids, &attention_mask, &token_type_ids, None, None, None)
            .map_err(model_err)?;
        let pooled = masked_mean_l2(&hidden, &attention_mask).map_err(model_err)?;
        let vectors: Vec<Vec<f32>> = pooled
            .to_device(&Device::Cpu)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec2())
            .map_err(model_err)?;
        tracing::debug!(batch = texts.len(), elapsed_ms = start.elapsed().as_millis() as u64, "local batch embedded");
        Ok(vectors)
    }
}

pub struct LocalModel {
    inner: Arc<LoadedModel>,
    identity: ProviderIdentity,
    max_tokens: usize,
}

impl LocalModel {
    /// Load tokenizer, config and weights from the resolved model directory.
    pub fn load(config: &LocalEmbeddingConfig) -> Result<Self> {
        let model_dir = resolve_model_dir(config)?;
        let device = select_device();
        tracing::info!(model = %config.model, dir = %model_dir.display(), "loading local embedding model");

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            Error::configuration(format!("failed to load tokenizer from {}: {e}", tokenizer_path.display()))
        })?;

        let raw_config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(model_dir.join("config.json"))?)?;
        let hidden_size = raw_config
            .get("hidden_size")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::configuration("model config.json has no hidden_size"))?;
        let model_config: XLMRobertaConfig = serde_json::from_value(raw_config)?;

        let weights = load_weights(&model_dir, &device)?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = XLMRobertaModel::new(&model_config, vb).map_err(model_err)?;

        let dimension = usize::try_from(hidden_size).map_err(|e| Error::configuration(e.to_string()))?;
        let identity = ProviderIdentity::new(ProviderKind::LocalEmbedding, config.model.clone(), dimension);
        tracing::info!(identity = %identity, "local embedding model loaded");
        Ok(Self {
            inner: Arc::new(LoadedModel { model, tokenizer, device }),
            identity,
            max_tokens: config.max_tokens.max(8),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalModel {
    fn identity(&self) -> &ProviderIdentity {
        &self.identity
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let inner = Arc::clone(&self.inner);
        let texts = texts.to_vec();
        let max_len = self.max_tokens;
        tokio::task::spawn_blocking(move || inner.embed_sync(&texts, max_len))
            .await
            .map_err(|e| Error::Provider(format!("embedding task failed: {e}")))?
    }
}

fn load_weights(model_dir: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let safetensors = model_dir.join("model.safetensors");
    if safetensors.exists() {
        return candle_core::safetensors::load(&safetensors, device).map_err(model_err);
    }
    let pickle = model_dir.join("pytorch_model.bin");
    let weights = candle_core::pickle::read_all(&pickle).map_err(model_err)?;
    Ok(weights.into_iter().collect())
}

fn resolve_model_dir(config: &LocalEmbeddingConfig) -> Result<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = &config.model_dir {
        candidates.push(expand_path(dir));
    }
    for var in ["APP_MODEL_DIR", "MODEL_DIR"] {
        if let Ok(dir) = std::env::var(var) {
            candidates.push(PathBuf::from(dir));
        }
    }
    candidates.push(Path::new("models").join(&config.model));
    candidates.push(Path::new("../models").join(&config.model));

    candidates
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| Error::NotFound(format!("model directory for '{}'", config.model)))
}
