use std::sync::Arc;

use evidb_core::config::ProviderConfig;
use evidb_core::{EmbeddingProvider, Result};

pub mod device;
pub mod dispatch;
pub mod hashing;
pub mod local;
pub mod pool;
pub mod remote;
pub mod tokenize;

pub use dispatch::EmbeddingDispatcher;
pub use hashing::{HashingEmbedder, HASHING_MODEL};
pub use local::LocalModel;
pub use pool::masked_mean_l2;
pub use remote::RemoteEmbedder;

/// Construct the provider selected by configuration.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match config {
        ProviderConfig::Local(local) if local.model == HASHING_MODEL => {
            tracing::info!(dimension = local.dimension, "using hashing embedder");
            Arc::new(HashingEmbedder::new(local.dimension)?)
        }
        ProviderConfig::Local(local) => Arc::new(LocalModel::load(local)?),
        ProviderConfig::Remote(remote) => {
            tracing::info!(endpoint = %remote.endpoint, model = %remote.model, "using remote embedder");
            Arc::new(RemoteEmbedder::new(remote)?)
        }
    };
    Ok(provider)
}
