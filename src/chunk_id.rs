//! Content-addressed chunk identifiers.
//!
//! A chunk id is a UUID v5 (URL namespace) over the canonical name
//! `"{path}::{index}::{sha256(text)}"`. The same triple yields the same id
//! in every process and on every platform, so the id doubles as the dedup
//! cache key and the vector-store point id, and re-upserting unchanged
//! content overwrites the existing point.

use std::path::Path;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// SHA-256 of the UTF-8 bytes of `text`, lower-case hex.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable point id for chunk `index` of `path` with content `text`.
pub fn chunk_uuid(path: &Path, index: usize, text: &str) -> Uuid {
    chunk_uuid_with_hash(path, index, &sha256_hex(text))
}

/// Same as [`chunk_uuid`] when the text hash is already known.
pub fn chunk_uuid_with_hash(path: &Path, index: usize, text_hash: &str) -> Uuid {
    let name = format!("{}::{}::{}", path.display(), index, text_hash);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
}
