//! On-disk layout of a saved index.
//!
//! ```text
//! <location>/
//!   manifest.json            generation, provider, metric, counts, blake3 digests
//!   vectors.<gen>.bin        EVDBVEC1 | u32 dimension | u64 count | count*dimension f32 (LE)
//!   metadata.<gen>.jsonl     one record per entry, insertion order
//! ```
//!
//! A save stages both artifacts under a new generation number, then renames
//! the manifest naming that generation into place. The manifest rename is
//! the only commit point: until it lands, the previous manifest still names
//! the previous generation's untouched files. Superseded generations are
//! pruned after the commit.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use evidb_core::{CharSpan, Chunk, Error, Metric, ProviderIdentity, Result};

use crate::index::{IndexEntry, IndexSnapshot};

pub const MANIFEST_FILE: &str = "manifest.json";

const VECTORS_PREFIX: &str = "vectors.";
const VECTORS_SUFFIX: &str = ".bin";
const METADATA_PREFIX: &str = "metadata.";
const METADATA_SUFFIX: &str = ".jsonl";

const MAGIC: &[u8; 8] = b"EVDBVEC1";
const HEADER_LEN: usize = 8 + 4 + 8;
pub const FORMAT_VERSION: u32 = 2;

pub fn vectors_file(generation: u64) -> String {
    format!("{VECTORS_PREFIX}{generation}{VECTORS_SUFFIX}")
}

pub fn metadata_file(generation: u64) -> String {
    format!("{METADATA_PREFIX}{generation}{METADATA_SUFFIX}")
}

/// Generation encoded in an artifact file name, if it is one.
fn artifact_generation(name: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(VECTORS_PREFIX)
        .and_then(|rest| rest.strip_suffix(VECTORS_SUFFIX))
        .or_else(|| name.strip_prefix(METADATA_PREFIX).and_then(|rest| rest.strip_suffix(METADATA_SUFFIX)))?;
    digits.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub generation: u64,
    pub provider: ProviderIdentity,
    pub metric: Metric,
    pub dimension: Option<usize>,
    pub count: usize,
    pub vectors_blake3: String,
    pub metadata_blake3: String,
    pub saved_at_ms: i64,
}

impl Manifest {
    pub fn vectors_file(&self) -> String {
        vectors_file(self.generation)
    }

    pub fn metadata_file(&self) -> String {
        metadata_file(self.generation)
    }
}

/// Artifacts written for a generation that no manifest names yet.
#[derive(Debug)]
#[must_use = "a staged save is invisible until committed"]
pub struct StagedSave {
    manifest: Manifest,
}

impl StagedSave {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataRecord {
    chunk_id: String,
    source_name: String,
    ordinal: usize,
    char_span: CharSpan,
    text: String,
}

pub struct PersistenceManager {
    dir: PathBuf,
}

impl PersistenceManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A saved index is present when its manifest is.
    pub fn exists(&self) -> bool {
        self.dir.join(MANIFEST_FILE).is_file()
    }

    pub fn save(&self, snapshot: &IndexSnapshot) -> Result<Manifest> {
        let staged = self.stage(snapshot)?;
        self.commit(staged)
    }

    /// Write both artifacts under a fresh generation. Nothing a reader can
    /// see changes until [`commit`](Self::commit).
    pub fn stage(&self, snapshot: &IndexSnapshot) -> Result<StagedSave> {
        fs::create_dir_all(&self.dir)?;
        let generation = self.next_generation()?;
        let dimension = snapshot.dimension.unwrap_or(0);

        let mut vectors = Vec::with_capacity(HEADER_LEN + snapshot.entries.len() * dimension * 4);
        vectors.extend_from_slice(MAGIC);
        vectors.extend_from_slice(&u32::try_from(dimension).map_err(|_| Error::corruption("dimension exceeds u32"))?.to_le_bytes());
        vectors.extend_from_slice(&(snapshot.entries.len() as u64).to_le_bytes());
        let mut metadata = Vec::new();
        for entry in &snapshot.entries {
            for x in &entry.vector {
                vectors.extend_from_slice(&x.to_le_bytes());
            }
            let record = MetadataRecord {
                chunk_id: entry.chunk.chunk_id.clone(),
                source_name: entry.chunk.source_name.clone(),
                ordinal: entry.chunk.ordinal,
                char_span: entry.chunk.char_span,
                text: entry.chunk.text.clone(),
            };
            serde_json::to_writer(&mut metadata, &record)?;
            metadata.push(b'\n');
        }

        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            generation,
            provider: snapshot.provider.clone(),
            metric: snapshot.metric,
            dimension: snapshot.dimension,
            count: snapshot.entries.len(),
            vectors_blake3: blake3::hash(&vectors).to_hex().to_string(),
            metadata_blake3: blake3::hash(&metadata).to_hex().to_string(),
            saved_at_ms: Utc::now().timestamp_millis(),
        };
        self.write_atomic(&manifest.vectors_file(), &vectors)?;
        self.write_atomic(&manifest.metadata_file(), &metadata)?;
        tracing::debug!(location = %self.dir.display(), generation, "artifacts staged");
        Ok(StagedSave { manifest })
    }

    /// Publish a staged generation, then drop the ones it supersedes.
    pub fn commit(&self, staged: StagedSave) -> Result<Manifest> {
        let manifest = staged.manifest;
        self.write_atomic(MANIFEST_FILE, &serde_json::to_vec_pretty(&manifest)?)?;
        sync_dir(&self.dir);
        if let Err(e) = self.remove_artifacts(|generation| generation != manifest.generation) {
            tracing::warn!(location = %self.dir.display(), error = %e, "could not prune old index generations");
        }
        Ok(manifest)
    }

    pub fn manifest(&self) -> Result<Manifest> {
        let manifest_path = self.dir.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(Error::NotFound(format!("no saved index at {}", self.dir.display())));
        }
        let manifest: Manifest = serde_json::from_slice(&fs::read(&manifest_path)?)
            .map_err(|e| Error::corruption(format!("unreadable manifest: {e}")))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(Error::corruption(format!("unsupported format version {}", manifest.format_version)));
        }
        Ok(manifest)
    }

    /// Read and verify the committed generation. Any inconsistency is
    /// `Corruption`.
    pub fn load(&self) -> Result<(Manifest, Vec<IndexEntry>)> {
        let manifest = self.manifest()?;
        let (vectors_name, metadata_name) = (manifest.vectors_file(), manifest.metadata_file());

        let vectors = self.read_artifact(&vectors_name)?;
        let metadata = self.read_artifact(&metadata_name)?;
        if blake3::hash(&vectors).to_hex().as_str() != manifest.vectors_blake3 {
            return Err(Error::corruption(format!("{vectors_name} digest does not match manifest")));
        }
        if blake3::hash(&metadata).to_hex().as_str() != manifest.metadata_blake3 {
            return Err(Error::corruption(format!("{metadata_name} digest does not match manifest")));
        }

        let (dimension, vector_rows) = decode_vectors(&vectors)?;
        let records = decode_metadata(&metadata)?;
        if vector_rows.len() != records.len() {
            return Err(Error::corruption(format!(
                "{} vectors but {} metadata records",
                vector_rows.len(),
                records.len()
            )));
        }
        if records.len() != manifest.count {
            return Err(Error::corruption(format!("manifest count {} but {} entries", manifest.count, records.len())));
        }
        if manifest.count > 0 && manifest.dimension != Some(dimension) {
            return Err(Error::corruption(format!(
                "manifest dimension {:?} but vectors have {dimension}",
                manifest.dimension
            )));
        }

        let mut seen = HashSet::with_capacity(records.len());
        let mut entries = Vec::with_capacity(records.len());
        for (record, vector) in records.into_iter().zip(vector_rows) {
            if !seen.insert(record.chunk_id.clone()) {
                return Err(Error::corruption(format!("duplicate chunk id {}", record.chunk_id)));
            }
            let chunk = Chunk {
                chunk_id: record.chunk_id,
                text: record.text,
                source_name: record.source_name,
                ordinal: record.ordinal,
                char_span: record.char_span,
            };
            entries.push(IndexEntry::new(chunk, vector));
        }
        Ok((manifest, entries))
    }

    /// Remove the manifest and every generation's artifacts, readable or not.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(self.dir.join(MANIFEST_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.remove_artifacts(|_| true)?;
        tracing::info!(location = %self.dir.display(), "index artifacts removed");
        Ok(())
    }

    /// One past the highest generation on disk, counting the committed one
    /// and any left behind by an interrupted save.
    fn next_generation(&self) -> Result<u64> {
        let committed = self.manifest().map_or(0, |m| m.generation);
        let on_disk = self.artifact_generations()?.into_iter().max().unwrap_or(0);
        Ok(committed.max(on_disk) + 1)
    }

    fn artifact_generations(&self) -> Result<Vec<u64>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut generations = Vec::new();
        for entry in entries {
            if let Some(generation) = entry?.file_name().to_str().and_then(artifact_generation) {
                generations.push(generation);
            }
        }
        Ok(generations)
    }

    fn remove_artifacts(&self, doomed: impl Fn(u64) -> bool) -> Result<()> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let is_doomed = entry.file_name().to_str().and_then(artifact_generation).is_some_and(&doomed);
            if is_doomed {
                match fs::remove_file(entry.path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    fn read_artifact(&self, name: &str) -> Result<Vec<u8>> {
        fs::read(self.dir.join(name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::corruption(format!("{name} is missing")),
            _ => Error::Io(e),
        })
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(name)).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

/// Flush the directory entry of a rename. Not every platform can open a
/// directory, so this is best effort.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

fn decode_vectors(bytes: &[u8]) -> Result<(usize, Vec<Vec<f32>>)> {
    if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
        return Err(Error::corruption("vector file has no valid header"));
    }
    let mut dim_bytes = [0u8; 4];
    dim_bytes.copy_from_slice(&bytes[8..12]);
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[12..20]);
    let dimension = u32::from_le_bytes(dim_bytes) as usize;
    let count = usize::try_from(u64::from_le_bytes(count_bytes))
        .map_err(|_| Error::corruption("vector count overflows"))?;

    let body = &bytes[HEADER_LEN..];
    let expected = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| Error::corruption("vector payload size overflows"))?;
    if body.len() != expected {
        return Err(Error::corruption(format!(
            "vector file holds {} payload bytes, header implies {expected}",
            body.len()
        )));
    }

    let rows = if dimension == 0 {
        vec![Vec::new(); count]
    } else {
        body.chunks_exact(dimension * 4)
            .map(|row| {
                row.chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect()
            })
            .collect()
    };
    Ok((dimension, rows))
}

fn decode_metadata(bytes: &[u8]) -> Result<Vec<MetadataRecord>> {
    let text = std::str::from_utf8(bytes).map_err(|e| Error::corruption(format!("metadata file: {e}")))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| Error::corruption(format!("metadata file line {}: {e}", i + 1)))
        })
        .collect()
}
