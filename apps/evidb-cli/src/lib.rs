//! Shared plumbing for the evidb binaries.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Args;
use tracing_subscriber::{fmt, EnvFilter};

use evidb_core::config::{Config, Settings};
use evidb_rag::KnowledgeBase;

/// Where to find `config.toml` and which environment overlay to apply.
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Directory holding config.toml and config.<env>.toml
    #[arg(long, default_value = ".")]
    pub config_dir: PathBuf,

    /// Environment overlay (defaults to RUST_ENV, then "dev")
    #[arg(long)]
    pub env: Option<String>,
}

impl ConfigArgs {
    pub fn load(&self) -> anyhow::Result<(Config, Settings)> {
        let config = Config::load_from(&self.config_dir, self.env.as_deref())
            .with_context(|| format!("loading configuration from {}", self.config_dir.display()))?;
        let settings = config.settings().context("invalid configuration")?;
        Ok((config, settings))
    }

    pub fn open(&self) -> anyhow::Result<(Settings, KnowledgeBase)> {
        let (config, settings) = self.load()?;
        let kb = KnowledgeBase::from_config(&config).context("opening knowledge base")?;
        Ok((settings, kb))
    }

    /// Like [`open`](Self::open) but discards the saved index unread.
    pub fn open_fresh(&self) -> anyhow::Result<(Settings, KnowledgeBase)> {
        let (config, settings) = self.load()?;
        let kb = KnowledgeBase::rebuild_from_config(&config).context("discarding the existing index")?;
        Ok((settings, kb))
    }
}

/// `RUST_LOG` wins; otherwise info for everything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // a second init in the same process is harmless
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}
