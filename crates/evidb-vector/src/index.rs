//! Exact in-memory vector index with a single writer and many readers.
//!
//! Committed state sits behind an `RwLock` and is only swapped in after a
//! whole batch validated, so readers observe either the state before an
//! `add` or the state after it. A separate writer mutex serialises `add`
//! and `save` so a snapshot never races a commit.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use evidb_core::{Chunk, ChunkId, Error, Metric, ProviderIdentity, Result, RetrievalResult};

use crate::metric::{l2_norm, similarity};
use crate::persistence::PersistenceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Empty,
    Building,
    Ready,
    Persisted,
    Loaded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    norm: f64,
}

impl IndexEntry {
    pub fn new(chunk: Chunk, vector: Vec<f32>) -> Self {
        let norm = l2_norm(&vector);
        Self { chunk, vector, norm }
    }

    pub fn norm(&self) -> f64 {
        self.norm
    }
}

/// Point-in-time copy of committed state, cheap to take (entries are shared).
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub provider: ProviderIdentity,
    pub metric: Metric,
    pub dimension: Option<usize>,
    pub entries: Vec<Arc<IndexEntry>>,
}

#[derive(Debug)]
struct IndexState {
    dimension: Option<usize>,
    entries: Vec<Arc<IndexEntry>>,
    positions: HashMap<ChunkId, usize>,
    lifecycle: Lifecycle,
}

impl IndexState {
    fn empty() -> Self {
        Self { dimension: None, entries: Vec::new(), positions: HashMap::new(), lifecycle: Lifecycle::Empty }
    }
}

#[derive(Debug)]
pub struct VectorIndex {
    provider: ProviderIdentity,
    metric: Metric,
    writer: Mutex<()>,
    state: RwLock<IndexState>,
}

impl VectorIndex {
    /// Fresh, empty index pinned to one provider identity and metric.
    pub fn new(provider: ProviderIdentity, metric: Metric) -> Self {
        Self { provider, metric, writer: Mutex::new(()), state: RwLock::new(IndexState::empty()) }
    }

    /// Load previously saved artifacts from `location`.
    pub fn load(location: &Path) -> Result<Self> {
        let (manifest, entries) = PersistenceManager::new(location).load()?;
        let mut positions = HashMap::with_capacity(entries.len());
        let entries: Vec<Arc<IndexEntry>> = entries
            .into_iter()
            .enumerate()
            .map(|(pos, entry)| {
                positions.insert(entry.chunk.chunk_id.clone(), pos);
                Arc::new(entry)
            })
            .collect();
        let dimension = if entries.is_empty() { None } else { manifest.dimension };
        tracing::info!(location = %location.display(), entries = entries.len(), provider = %manifest.provider, "index loaded");
        Ok(Self {
            provider: manifest.provider,
            metric: manifest.metric,
            writer: Mutex::new(()),
            state: RwLock::new(IndexState { dimension, entries, positions, lifecycle: Lifecycle::Loaded }),
        })
    }

    /// Load from `location` when artifacts exist there, else start empty.
    ///
    /// A persisted index built by a different provider is refused; the
    /// persisted metric wins over the requested one.
    pub fn open(location: &Path, provider: ProviderIdentity, metric: Metric) -> Result<Self> {
        if !PersistenceManager::new(location).exists() {
            tracing::debug!(location = %location.display(), "no saved index, starting empty");
            return Ok(Self::new(provider, metric));
        }
        let index = Self::load(location)?;
        if index.provider != provider {
            return Err(Error::ProviderMismatch { index: index.provider.clone(), query: provider });
        }
        if index.metric != metric {
            tracing::warn!(persisted = %index.metric, requested = %metric, "keeping the persisted metric");
        }
        Ok(index)
    }

    pub fn provider(&self) -> &ProviderIdentity {
        &self.provider
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn size(&self) -> usize {
        self.read_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// `None` until the first batch commits.
    pub fn dimension(&self) -> Option<usize> {
        self.read_state().dimension
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.read_state().lifecycle
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.read_state().positions.contains_key(chunk_id)
    }

    pub fn sources(&self) -> BTreeSet<String> {
        self.read_state()
            .entries
            .iter()
            .map(|e| e.chunk.source_name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        let state = self.read_state();
        IndexSnapshot {
            provider: self.provider.clone(),
            metric: self.metric,
            dimension: state.dimension,
            entries: state.entries.clone(),
        }
    }

    /// Atomically append a batch; returns how many entries were committed.
    ///
    /// The whole batch is rejected, leaving the index untouched, when any
    /// vector has the wrong dimension or a non-finite component, or when any
    /// `chunk_id` repeats inside the batch or already exists in the index.
    pub fn add(&self, batch: Vec<(Chunk, Vec<f32>)>) -> Result<usize> {
        let _writer = self.lock_writer();
        if batch.is_empty() {
            return Ok(0);
        }
        {
            let mut state = self.write_state();
            if state.lifecycle == Lifecycle::Empty {
                state.lifecycle = Lifecycle::Building;
            }
        }

        let expected = self.read_state().dimension.unwrap_or(self.provider.dimension);
        {
            let state = self.read_state();
            let mut seen = HashSet::with_capacity(batch.len());
            for (chunk, vector) in &batch {
                if vector.len() != expected {
                    return Err(Error::DimensionMismatch { expected, actual: vector.len() });
                }
                if vector.iter().any(|x| !x.is_finite()) {
                    return Err(Error::InvalidVector(format!("non-finite component in {}", chunk.chunk_id)));
                }
                if state.positions.contains_key(&chunk.chunk_id) || !seen.insert(chunk.chunk_id.as_str()) {
                    return Err(Error::DuplicateChunk(chunk.chunk_id.clone()));
                }
            }
        }

        let added = batch.len();
        let entries: Vec<Arc<IndexEntry>> = batch
            .into_iter()
            .map(|(chunk, vector)| Arc::new(IndexEntry::new(chunk, vector)))
            .collect();

        let mut state = self.write_state();
        for entry in entries {
            let pos = state.entries.len();
            state.positions.insert(entry.chunk.chunk_id.clone(), pos);
            state.entries.push(entry);
        }
        state.dimension = Some(expected);
        state.lifecycle = Lifecycle::Ready;
        tracing::info!(added, total = state.entries.len(), "batch committed");
        Ok(added)
    }

    /// Exact top-k by similarity, ties broken by insertion position.
    ///
    /// An empty index yields an empty result for any query.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievalResult>> {
        let state = self.read_state();
        if state.entries.is_empty() || k == 0 {
            return Ok(vec![]);
        }
        let expected = state.dimension.unwrap_or(self.provider.dimension);
        if query.len() != expected {
            return Err(Error::DimensionMismatch { expected, actual: query.len() });
        }
        if query.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidVector("non-finite component in query".into()));
        }

        let query_norm = l2_norm(query);
        let mut scored: Vec<(f32, usize)> = state
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (similarity(self.metric, query, query_norm, &e.vector, e.norm), pos))
            .collect();
        let order = |a: &(f32, usize), b: &(f32, usize)| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1));
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, order);
            scored.truncate(k);
        }
        scored.sort_by(order);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(rank, (score, position))| RetrievalResult {
                chunk: state.entries[position].chunk.clone(),
                score,
                rank,
                position,
            })
            .collect())
    }

    /// Durably write committed state to `location`.
    pub fn save(&self, location: &Path) -> Result<()> {
        let _writer = self.lock_writer();
        let snapshot = self.snapshot();
        PersistenceManager::new(location).save(&snapshot)?;
        let mut state = self.write_state();
        if state.lifecycle != Lifecycle::Empty {
            state.lifecycle = Lifecycle::Persisted;
        }
        tracing::info!(location = %location.display(), entries = snapshot.entries.len(), "index saved");
        Ok(())
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evidb_core::{CharSpan, ProviderKind};

    fn identity(dimension: usize) -> ProviderIdentity {
        ProviderIdentity::new(ProviderKind::LocalEmbedding, "test", dimension)
    }

    fn chunk(source: &str, ordinal: usize) -> Chunk {
        Chunk::new(source, ordinal, format!("{source} #{ordinal}"), CharSpan::new(0, 1))
    }

    #[test]
    fn lifecycle_moves_from_empty_to_ready() {
        let index = VectorIndex::new(identity(2), Metric::Cosine);
        assert_eq!(index.lifecycle(), Lifecycle::Empty);
        assert_eq!(index.dimension(), None);

        index.add(vec![(chunk("a", 0), vec![1.0, 0.0])]).unwrap();
        assert_eq!(index.lifecycle(), Lifecycle::Ready);
        assert_eq!(index.dimension(), Some(2));
    }

    #[test]
    fn failed_first_batch_leaves_no_entries() {
        let index = VectorIndex::new(identity(2), Metric::Cosine);
        let err = index.add(vec![(chunk("a", 0), vec![1.0, 0.0, 0.0])]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 3 }));
        assert_eq!(index.size(), 0);
        assert_eq!(index.dimension(), None);
        assert_eq!(index.lifecycle(), Lifecycle::Building);
    }

    #[test]
    fn non_finite_vectors_are_rejected() {
        let index = VectorIndex::new(identity(2), Metric::Cosine);
        let err = index.add(vec![(chunk("a", 0), vec![f32::NAN, 0.0])]).unwrap_err();
        assert!(matches!(err, Error::InvalidVector(_)));
    }

    #[test]
    fn k_zero_returns_nothing() {
        let index = VectorIndex::new(identity(2), Metric::Cosine);
        index.add(vec![(chunk("a", 0), vec![1.0, 0.0])]).unwrap();
        assert!(index.search(&[1.0, 0.0], 0).unwrap().is_empty());
    }
}
