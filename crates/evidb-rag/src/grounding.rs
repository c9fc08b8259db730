//! Grounding context assembly and citation lookup.
//!
//! Every chunk offered to a generator is rendered as a numbered block:
//!
//! ```text
//! [1] source: policy.md (chars 0..34)
//! Refunds are issued within 14 days.
//! ```
//!
//! and recorded in `citations`, so any attribution the generator echoes back
//! (a marker like `[1]`, a chunk id, or a source name) can be resolved to a
//! concrete span of a concrete document.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use evidb_core::{CharSpan, Chunk, ChunkId, RetrievalResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub marker: usize,
    pub chunk_id: ChunkId,
    pub source_name: String,
    pub char_span: CharSpan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroundedChunk {
    pub marker: usize,
    pub score: f32,
    pub chunk: Chunk,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroundingContext {
    pub entries: Vec<GroundedChunk>,
    pub citations: BTreeMap<ChunkId, Citation>,
    pub text: String,
    /// Results left out because they did not fit the budget.
    pub dropped: usize,
}

impl GroundingContext {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Distinct sources in rank order.
    pub fn sources(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .map(|e| e.chunk.source_name.as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }

    /// Citations an attribution string refers to: a marker (`[2]` or `2`),
    /// a chunk id, or a source name (all chunks of that source).
    pub fn resolve(&self, reference: &str) -> Vec<&Citation> {
        let reference = reference.trim();
        if reference.is_empty() {
            return vec![];
        }
        let marker = reference
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<usize>()
            .ok();
        self.citations
            .values()
            .filter(|c| {
                Some(c.marker) == marker || c.chunk_id == reference || c.source_name == reference
            })
            .collect()
    }

    pub fn is_grounded(&self, reference: &str) -> bool {
        !self.resolve(reference).is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GroundingContextBuilder {
    budget_chars: usize,
}

impl GroundingContextBuilder {
    pub fn new(budget_chars: usize) -> Self {
        Self { budget_chars }
    }

    /// Render results in rank order until the next block would exceed the
    /// character budget. Blocks are never cut; whatever does not fit is
    /// dropped, lowest ranks first.
    pub fn build(&self, results: &[RetrievalResult]) -> GroundingContext {
        let mut ordered: Vec<&RetrievalResult> = results.iter().collect();
        ordered.sort_by_key(|r| r.rank);

        let mut context = GroundingContext::default();
        let mut used = 0usize;
        let mut unique = ordered.into_iter().filter({
            let mut seen = HashSet::new();
            move |r| seen.insert(r.chunk.chunk_id.clone())
        });

        for result in unique.by_ref() {
            let marker = context.entries.len() + 1;
            let block = render_block(marker, &result.chunk);
            let cost = block.chars().count();
            if used + cost > self.budget_chars {
                context.dropped += 1;
                break;
            }
            used += cost;
            context.text.push_str(&block);
            context.citations.insert(
                result.chunk.chunk_id.clone(),
                Citation {
                    marker,
                    chunk_id: result.chunk.chunk_id.clone(),
                    source_name: result.chunk.source_name.clone(),
                    char_span: result.chunk.char_span,
                },
            );
            context.entries.push(GroundedChunk { marker, score: result.score, chunk: result.chunk.clone() });
        }
        context.dropped += unique.count();
        if context.dropped > 0 {
            tracing::warn!(kept = context.entries.len(), dropped = context.dropped, budget = self.budget_chars, "context budget exhausted");
        }
        context
    }
}

fn render_block(marker: usize, chunk: &Chunk) -> String {
    format!(
        "[{marker}] source: {} (chars {})\n{}\n\n",
        chunk.source_name, chunk.char_span, chunk.text
    )
}
