//! Layered configuration and path helpers.
//!
//! Uses Figment to merge built-in defaults + `config.toml` + `config.<env>.toml`
//! + `APP_*` env vars (nested keys separated by `__`, e.g.
//! `APP_CHUNKING__MAX_CHARS=800`). Provides helpers to expand `~` and `${VAR}`
//! and to resolve relative paths against the configuration directory.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::Metric;

pub struct Config {
    figment: Figment,
    base_dir: PathBuf,
}

impl Config {
    /// Load from the current directory, environment taken from `RUST_ENV`.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."), None)
    }

    pub fn load_from(base_dir: &Path, env_name: Option<&str>) -> Result<Self> {
        let env_name = env_name
            .map(str::to_string)
            .unwrap_or_else(|| env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string()));

        let mut figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(base_dir.join("config.toml")));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file(base_dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(base_dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(base_dir.join("config.test.toml"))),
            other => tracing::debug!(env = other, "no environment-specific config file"),
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        Ok(Self { figment, base_dir: base_dir.to_path_buf() })
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::configuration(format!("Failed to get '{key}': {e}")))
    }

    /// Extract and validate the full typed settings.
    pub fn settings(&self) -> Result<Settings> {
        let settings: Settings = self
            .figment
            .extract()
            .map_err(|e| Error::configuration(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Where the index artifacts live, resolved against the config directory.
    pub fn index_location(&self, settings: &Settings) -> Option<PathBuf> {
        settings
            .index
            .location
            .as_deref()
            .map(|p| resolve_with_base(&self.base_dir, p))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chunking: ChunkingConfig,
    pub embedding: ProviderConfig,
    pub dispatch: DispatchConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub generator: Option<GeneratorConfig>,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.dispatch.batch_size == 0 {
            return Err(Error::configuration("dispatch.batch_size must be at least 1"));
        }
        if self.dispatch.concurrency == 0 {
            return Err(Error::configuration("dispatch.concurrency must be at least 1"));
        }
        if self.retrieval.k == 0 {
            return Err(Error::configuration("retrieval.k must be at least 1"));
        }
        if let ProviderConfig::Remote(remote) = &self.embedding {
            if remote.endpoint.trim().is_empty() {
                return Err(Error::configuration("embedding.endpoint is required for remote providers"));
            }
        }
        Ok(())
    }
}

/// Chunk length and overlap are counted in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap: usize,
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap: 200,
            separators: ["\n\n", "\n", ". ", "! ", "? ", "; ", ", ", " ", ""]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl ChunkingConfig {
    pub fn new(max_chars: usize, overlap: usize) -> Self {
        Self { max_chars, overlap, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(Error::configuration("chunking.max_chars must be at least 1"));
        }
        if self.overlap >= self.max_chars {
            return Err(Error::configuration(format!(
                "chunking.overlap ({}) must be smaller than chunking.max_chars ({})",
                self.overlap, self.max_chars
            )));
        }
        Ok(())
    }
}

/// Embedding backend selection: a closed set of provider variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProviderConfig {
    Local(LocalEmbeddingConfig),
    Remote(RemoteEmbeddingConfig),
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Local(LocalEmbeddingConfig::default())
    }
}

/// In-process embedding model.
///
/// `model = "hashing"` selects the deterministic token-hashing model (no model
/// files needed); any other name loads an XLM-RoBERTa family checkpoint from
/// `model_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalEmbeddingConfig {
    pub model: String,
    pub model_dir: Option<String>,
    pub dimension: usize,
    pub max_tokens: usize,
}

impl Default for LocalEmbeddingConfig {
    fn default() -> Self {
        Self { model: "hashing".to_string(), model_dir: None, dimension: 384, max_tokens: 256 }
    }
}

/// HTTP embedding endpoint accepting `{"model", "input": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteEmbeddingConfig {
    pub endpoint: String,
    pub model: String,
    pub dimension: usize,
    pub api_key_env: Option<String>,
}

impl Default for RemoteEmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/api/embed".to_string(),
            model: "all-minilm".to_string(),
            dimension: 384,
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { batch_size: 32, concurrency: 2, timeout_ms: 30_000, max_retries: 3, backoff_ms: 250 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub location: Option<String>,
    pub metric: Metric,
    pub autosave: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { location: Some("data/evidb".to_string()), metric: Metric::Cosine, autosave: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub k: usize,
    pub min_score: Option<f32>,
    pub budget_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k: 5, min_score: None, budget_chars: 4000 }
    }
}

/// Text generator backends consuming a grounding context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GeneratorConfig {
    Ollama(OllamaConfig),
    Groq(GroqConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self { endpoint: "http://localhost:11434".to_string(), model: "llama2".to_string(), timeout_ms: 120_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroqConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub timeout_ms: u64,
}

impl Default for GroqConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            timeout_ms: 60_000,
        }
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
