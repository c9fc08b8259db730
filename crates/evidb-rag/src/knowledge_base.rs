//! Ingestion and query entry points over one explicitly owned index.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use evidb_core::config::{Config, RetrievalConfig, Settings};
use evidb_core::{Chunk, Chunker, Document, EmbeddingProvider, Error, Metric, ProviderIdentity, Result, RetrievalResult};
use evidb_embed::{build_provider, EmbeddingDispatcher};
use evidb_vector::{Lifecycle, PersistenceManager, VectorIndex};

use crate::generator::Generator;
use crate::grounding::{GroundingContext, GroundingContextBuilder};
use crate::retriever::{CancelFlag, Retriever};
use crate::scripts::{build_script_prompt, clean_script, extract_html_selectors, script_query, GeneratedScript, DEFAULT_TEST_URL};
use crate::testcases::{build_test_case_prompt, check_grounding, parse_test_cases, TestCase, TestCaseReport};

/// Outcome of a committed build.
///
/// `save_error` is set when the batch was committed in memory but the
/// autosave that followed failed. The entries are live and must not be
/// re-added; call [`KnowledgeBase::save`] once the location is writable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub chunks_added: usize,
    pub total_chunks: usize,
    pub saved: bool,
    pub save_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub total_chunks: usize,
    pub dimension: Option<usize>,
    pub sources: BTreeSet<String>,
    pub provider: ProviderIdentity,
    pub metric: Metric,
    pub lifecycle: Lifecycle,
    pub location: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    pub context: GroundingContext,
}

pub struct KnowledgeBase {
    chunker: Chunker,
    dispatcher: EmbeddingDispatcher,
    index: Arc<VectorIndex>,
    metric: Metric,
    location: Option<PathBuf>,
    autosave: bool,
    concurrency: usize,
    retrieval: RetrievalConfig,
    show_progress: bool,
}

impl KnowledgeBase {
    /// Open the index at `location` if one was saved there, else start empty.
    pub fn new(settings: &Settings, provider: Arc<dyn EmbeddingProvider>, location: Option<PathBuf>) -> Result<Self> {
        Self::assemble(settings, provider, location, false)
    }

    /// Start empty at `location`, discarding whatever was saved there without
    /// reading it. Works over a corrupt store or one pinned to another
    /// provider.
    pub fn rebuild(settings: &Settings, provider: Arc<dyn EmbeddingProvider>, location: Option<PathBuf>) -> Result<Self> {
        Self::assemble(settings, provider, location, true)
    }

    /// Provider and index location taken from layered configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let settings = config.settings()?;
        let provider = build_provider(&settings.embedding)?;
        Self::new(&settings, provider, config.index_location(&settings))
    }

    /// [`rebuild`](Self::rebuild) with provider and location from configuration.
    pub fn rebuild_from_config(config: &Config) -> Result<Self> {
        let settings = config.settings()?;
        let provider = build_provider(&settings.embedding)?;
        Self::rebuild(&settings, provider, config.index_location(&settings))
    }

    fn assemble(
        settings: &Settings,
        provider: Arc<dyn EmbeddingProvider>,
        location: Option<PathBuf>,
        fresh: bool,
    ) -> Result<Self> {
        settings.validate()?;
        let chunker = Chunker::new(settings.chunking.clone())?;
        let dispatcher = EmbeddingDispatcher::new(provider, &settings.dispatch);
        let identity = dispatcher.identity().clone();
        let index = match &location {
            Some(dir) if fresh => {
                PersistenceManager::new(dir).clear()?;
                VectorIndex::new(identity, settings.index.metric)
            }
            Some(dir) => VectorIndex::open(dir, identity, settings.index.metric)?,
            None => VectorIndex::new(identity, settings.index.metric),
        };
        tracing::info!(provider = %dispatcher.identity(), entries = index.size(), "knowledge base ready");
        Ok(Self {
            chunker,
            dispatcher,
            metric: index.metric(),
            index: Arc::new(index),
            location,
            autosave: settings.index.autosave,
            concurrency: settings.dispatch.concurrency.max(1),
            retrieval: settings.retrieval.clone(),
            show_progress: false,
        })
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn retrieval_defaults(&self) -> &RetrievalConfig {
        &self.retrieval
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Chunk, embed and commit `documents` as one atomic batch.
    ///
    /// Fails before any embedding work when a produced chunk id is already
    /// indexed or repeats across the given documents. A provider failure
    /// aborts the build with nothing committed.
    ///
    /// Once the batch is committed the call succeeds. A failed autosave is
    /// logged and carried in [`BuildReport::save_error`] rather than
    /// returned, since the entries are already in the index.
    pub async fn build_index(&self, documents: &[Document]) -> Result<BuildReport> {
        let chunks: Vec<Chunk> = documents.iter().flat_map(|doc| self.chunker.split(doc)).collect();
        let mut seen = HashSet::with_capacity(chunks.len());
        for chunk in &chunks {
            if self.index.contains(&chunk.chunk_id) || !seen.insert(chunk.chunk_id.as_str()) {
                return Err(Error::DuplicateChunk(chunk.chunk_id.clone()));
            }
        }
        if chunks.is_empty() {
            tracing::info!(documents = documents.len(), "no chunks to index");
            return Ok(BuildReport { chunks_added: 0, total_chunks: self.index.size(), saved: false, save_error: None });
        }
        tracing::info!(documents = documents.len(), chunks = chunks.len(), "indexing");

        let pb = self.progress_bar(chunks.len());
        let batches: Vec<Vec<String>> = chunks
            .chunks(self.dispatcher.batch_size())
            .map(|batch| batch.iter().map(|c| c.text.clone()).collect())
            .collect();
        let mut embedded = stream::iter(batches)
            .map(|texts| {
                let dispatcher = &self.dispatcher;
                async move { dispatcher.embed_batch(&texts).await }
            })
            .buffered(self.concurrency);

        let mut vectors = Vec::with_capacity(chunks.len());
        while let Some(batch) = embedded.next().await {
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    pb.abandon_with_message("embedding failed");
                    return Err(e);
                }
            };
            pb.inc(batch.len() as u64);
            vectors.extend(batch);
        }
        drop(embedded);

        let chunks_added = self.index.add(chunks.into_iter().zip(vectors).collect())?;
        pb.finish_with_message("indexed");

        let mut report = BuildReport { chunks_added, total_chunks: self.index.size(), saved: false, save_error: None };
        if self.autosave {
            if let Some(dir) = &self.location {
                match self.index.save(dir) {
                    Ok(()) => report.saved = true,
                    Err(e) => {
                        tracing::warn!(location = %dir.display(), error = %e, "batch committed but autosave failed");
                        report.save_error = Some(e.to_string());
                    }
                }
            }
        }
        Ok(report)
    }

    pub async fn retrieve(&self, text: &str, k: usize, min_score: Option<f32>) -> Result<Vec<RetrievalResult>> {
        self.retriever().retrieve(text, k, min_score).await
    }

    pub async fn query(&self, text: &str, k: usize, min_score: Option<f32>) -> Result<GroundingContext> {
        self.query_with_cancel(text, k, min_score, &CancelFlag::default()).await
    }

    pub async fn query_with_cancel(
        &self,
        text: &str,
        k: usize,
        min_score: Option<f32>,
        cancel: &CancelFlag,
    ) -> Result<GroundingContext> {
        let results = self.retriever().retrieve_with_cancel(text, k, min_score, cancel).await?;
        Ok(GroundingContextBuilder::new(self.retrieval.budget_chars).build(&results))
    }

    /// Answer a question from retrieved context only.
    pub async fn answer(&self, generator: &dyn Generator, question: &str, k: usize, max_tokens: usize) -> Result<Answer> {
        let context = self.query(question, k, self.retrieval.min_score).await?;
        let prompt = format!(
            "Answer the question using only the context below. Cite the [n] markers you rely on.\n\n\
             Context:\n{}\nQuestion: {question}\n\nAnswer:",
            context.text
        );
        let answer = generator.generate(&prompt, max_tokens).await?;
        Ok(Answer { answer, context })
    }

    /// Generate QA test cases for `query` and sort them by whether their
    /// attribution resolves to the supplied citations.
    pub async fn generate_test_cases(
        &self,
        generator: &dyn Generator,
        query: &str,
        k: usize,
        max_tokens: usize,
    ) -> Result<TestCaseReport> {
        let context = self.query(query, k, self.retrieval.min_score).await?;
        if context.is_empty() {
            return Err(Error::NotFound(format!("no indexed context for '{query}'")));
        }
        let prompt = build_test_case_prompt(&context, query);
        let response = generator.generate(&prompt, max_tokens).await?;
        let cases = parse_test_cases(&response, &context.sources())?;
        let report = check_grounding(cases, &context);
        tracing::info!(
            generator = generator.name(),
            grounded = report.grounded.len(),
            ungrounded = report.ungrounded.len(),
            "test cases generated"
        );
        Ok(report)
    }

    /// Generate a Selenium script for `case` against the page in `html`,
    /// with documentation retrieved for the case's feature and scenario.
    /// An empty index still yields a script, just without documentation.
    pub async fn generate_script(
        &self,
        generator: &dyn Generator,
        case: &TestCase,
        html: &str,
        url: Option<&str>,
        k: usize,
        max_tokens: usize,
    ) -> Result<GeneratedScript> {
        let selectors = extract_html_selectors(html);
        let context = self.query(&script_query(case), k, self.retrieval.min_score).await?;
        let prompt = build_script_prompt(case, &selectors, &context, url.unwrap_or(DEFAULT_TEST_URL));
        let script = clean_script(&generator.generate(&prompt, max_tokens).await?);
        if script.is_empty() {
            return Err(Error::Generation("generator returned an empty script".into()));
        }
        let test_id = if case.test_id.is_empty() { "TC_001".to_string() } else { case.test_id.clone() };
        tracing::info!(generator = generator.name(), test_id = %test_id, context = context.len(), "script generated");
        Ok(GeneratedScript {
            test_id,
            script,
            language: "python",
            selectors: selectors.counts(),
            sources: context.sources().into_iter().map(str::to_string).collect(),
        })
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            total_chunks: self.index.size(),
            dimension: self.index.dimension(),
            sources: self.index.sources(),
            provider: self.index.provider().clone(),
            metric: self.index.metric(),
            lifecycle: self.index.lifecycle(),
            location: self.location.clone(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let dir = self
            .location
            .as_deref()
            .ok_or_else(|| Error::configuration("index.location is not configured"))?;
        self.index.save(dir)
    }

    /// Drop every entry and any saved artifacts; the index starts over empty.
    pub fn clear(&mut self) -> Result<()> {
        if let Some(dir) = &self.location {
            PersistenceManager::new(dir).clear()?;
        }
        self.index = Arc::new(VectorIndex::new(self.dispatcher.identity().clone(), self.metric));
        tracing::info!("knowledge base cleared");
        Ok(())
    }

    fn retriever(&self) -> Retriever {
        Retriever::new(Arc::clone(&self.index), self.dispatcher.clone())
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%) {msg}")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }
}
