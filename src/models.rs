//! Core data models used throughout vectorfold.
//!
//! These types represent the files, documents, chunks, and vector points
//! that flow through the ingestion pipeline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Maximum characters of chunk text copied into a point payload.
pub const PAYLOAD_TEXT_CHARS: usize = 1000;

/// A file discovered by the scanner, before any content is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to the scan root, `/`-separated on every platform.
    pub rel_path: String,
    /// Lower-cased extension including the leading dot (e.g. `".md"`).
    pub extension: String,
    pub byte_len: u64,
}

/// Extracted plain text of one source file.
#[derive(Debug, Clone)]
pub struct Document {
    pub source_path: PathBuf,
    pub rel_path: String,
    pub extension: String,
    pub text: String,
    pub title: Option<String>,
    pub author: Option<String>,
}

/// A window of a document's text; the unit of embedding.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// UUID v5 point id, see [`crate::chunk_id::chunk_uuid`].
    pub id: String,
    pub source_path: PathBuf,
    pub chunk_index: usize,
    /// Offset of the first character, counted in chars.
    pub char_offset: usize,
    pub text: String,
    /// SHA-256 hex of `text`.
    pub hash: String,
}

/// Metadata stored alongside each vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPayload {
    pub source_path: String,
    pub rel_path: String,
    pub chunk_index: usize,
    pub char_offset: usize,
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub text: String,
}

impl ChunkPayload {
    pub fn new(doc: &Document, chunk: &Chunk) -> Self {
        Self {
            source_path: doc.source_path.display().to_string(),
            rel_path: doc.rel_path.clone(),
            chunk_index: chunk.chunk_index,
            char_offset: chunk.char_offset,
            ext: doc.extension.clone(),
            title: doc.title.clone(),
            author: doc.author.clone(),
            text: chunk.text.chars().take(PAYLOAD_TEXT_CHARS).collect(),
        }
    }
}

/// A vector-store point ready for upsert.
#[derive(Debug, Clone)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: serde_json::Value,
}
