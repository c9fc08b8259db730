use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use evidb_core::{Error, Result, RetrievalResult};
use evidb_embed::EmbeddingDispatcher;
use evidb_vector::VectorIndex;

/// Cooperative cancellation for an in-flight retrieval.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Query-time view over an index and the provider that must have built it.
pub struct Retriever {
    index: Arc<VectorIndex>,
    dispatcher: EmbeddingDispatcher,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>, dispatcher: EmbeddingDispatcher) -> Self {
        Self { index, dispatcher }
    }

    pub async fn retrieve(&self, query: &str, k: usize, min_score: Option<f32>) -> Result<Vec<RetrievalResult>> {
        self.retrieve_with_cancel(query, k, min_score, &CancelFlag::default()).await
    }

    /// Top-k chunks for `query`, best first.
    ///
    /// Results under `min_score` are dropped. Of any two results from the same
    /// source whose spans overlap, only the higher-scoring one is kept; the
    /// search window grows until `k` results survive or the index is exhausted.
    pub async fn retrieve_with_cancel(
        &self,
        query: &str,
        k: usize,
        min_score: Option<f32>,
        cancel: &CancelFlag,
    ) -> Result<Vec<RetrievalResult>> {
        cancel.check()?;
        let total = self.index.size();
        if total == 0 || k == 0 {
            return Ok(vec![]);
        }
        if self.dispatcher.identity() != self.index.provider() {
            return Err(Error::ProviderMismatch {
                index: self.index.provider().clone(),
                query: self.dispatcher.identity().clone(),
            });
        }

        let query_vector = self.dispatcher.embed_query(query).await?;
        cancel.check()?;

        let mut window = k.saturating_mul(2).max(k + 4);
        loop {
            let candidates = self.index.search(&query_vector, window)?;
            let exhausted = candidates.len() < window;
            let mut floor_hit = false;
            let mut kept: Vec<RetrievalResult> = Vec::with_capacity(k);
            for candidate in candidates {
                if min_score.is_some_and(|floor| candidate.score < floor) {
                    floor_hit = true;
                    break;
                }
                let redundant = kept.iter().any(|r| {
                    r.chunk.source_name == candidate.chunk.source_name
                        && r.chunk.char_span.overlaps(&candidate.chunk.char_span)
                });
                if redundant {
                    tracing::debug!(chunk = %candidate.chunk.chunk_id, "dropping overlapping result");
                    continue;
                }
                kept.push(candidate);
                if kept.len() == k {
                    break;
                }
            }

            if kept.len() == k || exhausted || floor_hit || window >= total {
                for (rank, result) in kept.iter_mut().enumerate() {
                    result.rank = rank;
                }
                tracing::debug!(k, returned = kept.len(), window, "retrieval finished");
                return Ok(kept);
            }
            window = window.saturating_mul(2);
        }
    }
}
