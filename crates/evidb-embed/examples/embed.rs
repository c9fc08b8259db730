use evidb_core::config::Config;
use evidb_embed::{build_provider, EmbeddingDispatcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Config::load()?.settings()?;
    let provider = build_provider(&settings.embedding)?;
    let dispatcher = EmbeddingDispatcher::new(provider, &settings.dispatch);
    let texts = vec!["hello world".to_string(), "rust embeddings".to_string()];
    let embs = dispatcher.embed_batch(&texts).await?;
    println!("provider={} B={} dim={}", dispatcher.identity(), embs.len(), embs[0].len());
    Ok(())
}
