use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use evidb_cli::{init_tracing, ConfigArgs};
use evidb_core::documents::DocumentLoader;

#[derive(Parser)]
#[command(name = "evidb-index")]
#[command(about = "Chunk, embed and index a directory of text documents")]
struct Args {
    /// Directory of .txt / .md / .json / .html files
    data_dir: PathBuf,

    /// Only index the first N files (sorted by path)
    #[arg(long)]
    limit: Option<usize>,

    /// Discard the existing index before indexing
    #[arg(long)]
    rebuild: bool,

    /// Hide the progress bar
    #[arg(long)]
    quiet: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let (settings, kb) = if args.rebuild { args.config.open_fresh()? } else { args.config.open()? };
    let kb = kb.with_progress(!args.quiet);

    let loader = args.limit.map_or_else(DocumentLoader::new, DocumentLoader::with_limit);
    let documents = loader
        .load_directory(&args.data_dir)
        .with_context(|| format!("reading {}", args.data_dir.display()))?;
    println!("📂 Loaded {} documents from {}", documents.len(), args.data_dir.display());

    let report = kb.build_index(&documents).await.context("indexing failed")?;
    if let Some(err) = &report.save_error {
        anyhow::bail!("indexed {} chunks but saving failed: {err}", report.chunks_added);
    }
    if !settings.index.autosave && kb.location().is_some() {
        kb.save().context("saving the index")?;
    }

    println!("✅ Indexed {} chunks ({} total)", report.chunks_added, report.total_chunks);
    if let Some(location) = kb.location() {
        println!("💾 Index at {}", location.display());
    }
    Ok(())
}
