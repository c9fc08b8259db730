//! Plain-text document loading from a directory tree.
//!
//! Format parsing (PDF, HTML cleanup, ...) happens upstream; this loader only
//! reads files with a known text extension into [`Document`]s.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::Document;

pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "json", "html", "htm"];

#[derive(Debug, Clone, Default)]
pub struct DocumentLoader {
    limit: Option<usize>,
}

impl DocumentLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load at most `limit` files (after sorting by path).
    pub fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit) }
    }

    pub fn load_directory(&self, data_dir: &Path) -> Result<Vec<Document>> {
        let mut files = list_text_files(data_dir);
        if files.is_empty() {
            tracing::warn!(dir = %data_dir.display(), "no text files found");
            return Ok(vec![]);
        }
        if let Some(limit) = self.limit {
            if files.len() > limit {
                files.truncate(limit);
                tracing::info!(limit, "limited to first files");
            }
        }

        let mut documents = Vec::with_capacity(files.len());
        for (file_index, file_path) in files.iter().enumerate() {
            tracing::debug!(file = %file_path.display(), "loading {}/{}", file_index + 1, files.len());
            documents.push(load_file(file_path, data_dir)?);
        }
        tracing::info!(files = documents.len(), dir = %data_dir.display(), "loaded documents");
        Ok(documents)
    }
}

/// Read one file into a document. `source_name` is the path relative to `root`.
pub fn load_file(file_path: &Path, root: &Path) -> Result<Document> {
    let raw_text = read_file_content(file_path)?;
    let source_name = file_path
        .strip_prefix(root)
        .unwrap_or(file_path)
        .to_string_lossy()
        .replace('\\', "/");
    let id = file_path
        .file_stem()
        .map_or_else(|| source_name.clone(), |s| s.to_string_lossy().to_string());
    let format_tag = extension_of(file_path).unwrap_or_else(|| "txt".to_string());
    Ok(Document::new(id, source_name, raw_text, format_tag))
}

fn read_file_content(file_path: &Path) -> Result<String> {
    match fs::read_to_string(file_path) {
        Ok(content) => Ok(content),
        Err(_) => Ok(String::from_utf8_lossy(&fs::read(file_path)?).to_string()),
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
}

fn list_text_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .filter(|p| extension_of(p).is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.as_str())))
        .collect();
    files.sort();
    files
}
