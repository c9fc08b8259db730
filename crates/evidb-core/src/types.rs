//! Domain types shared by the chunker, the vector index and the retriever.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

pub type ChunkId = String;

/// A normalized source document handed over by the parsing boundary.
///
/// Immutable once created; chunks reference it by `source_name` only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_name: String,
    pub raw_text: String,
    pub format_tag: String,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        source_name: impl Into<String>,
        raw_text: impl Into<String>,
        format_tag: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_name: source_name.into(),
            raw_text: raw_text.into(),
            format_tag: format_tag.into(),
        }
    }
}

/// Half-open byte range `[start, end)` into a document's `raw_text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharSpan {
    pub start: usize,
    pub end: usize,
}

impl CharSpan {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "span start {start} after end {end}");
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True when the two spans share at least one byte.
    pub fn overlaps(&self, other: &CharSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for CharSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// The unit of retrieval: a contiguous, trimmed span of one document.
///
/// - `chunk_id`: `"{source_name}:{ordinal}"`, unique within an index
/// - `ordinal`: position within the source, restarting at 0 per document
/// - `char_span`: where `text` sits in the source (`&raw_text[span] == text`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub text: String,
    pub source_name: String,
    pub ordinal: usize,
    pub char_span: CharSpan,
}

impl Chunk {
    pub fn new(source_name: &str, ordinal: usize, text: String, char_span: CharSpan) -> Self {
        Self {
            chunk_id: chunk_id_for(source_name, ordinal),
            text,
            source_name: source_name.to_string(),
            ordinal,
            char_span,
        }
    }
}

pub fn chunk_id_for(source_name: &str, ordinal: usize) -> ChunkId {
    format!("{source_name}:{ordinal}")
}

/// Closed set of embedding backends an index can be pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    LocalEmbedding,
    RemoteEmbedding,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::LocalEmbedding => f.write_str("local-embedding"),
            ProviderKind::RemoteEmbedding => f.write_str("remote-embedding"),
        }
    }
}

/// Stable identity of the provider/model that produced an index's vectors.
///
/// Two vectors are only comparable when their identities are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderIdentity {
    pub kind: ProviderKind,
    pub model: String,
    pub dimension: usize,
}

impl ProviderIdentity {
    pub fn new(kind: ProviderKind, model: impl Into<String>, dimension: usize) -> Self {
        Self { kind, model: model.into(), dimension }
    }
}

impl fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:d{}", self.kind, self.model, self.dimension)
    }
}

/// Similarity metric pinned per index.
///
/// Scores are always "higher is closer": cosine similarity as-is, L2 as the
/// negated euclidean distance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    L2,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Cosine => f.write_str("cosine"),
            Metric::L2 => f.write_str("l2"),
        }
    }
}

/// One ranked hit. `rank` is 0-based; `position` is the entry's insertion
/// position inside the index and decides ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub score: f32,
    pub rank: usize,
    pub position: usize,
}
