//! Fixed-window text chunker with overlap.
//!
//! Splits document text into windows of at most `max_chars` characters.
//! Each window starts `max_chars - overlap` characters after the previous
//! one, so consecutive chunks share `overlap` characters of context. The
//! final window always ends exactly at the end of the text.
//!
//! Lengths and offsets are counted in `char`s, never bytes, so windows
//! never split a UTF-8 sequence.
//!
//! # Algorithm
//!
//! 1. Reject `max_chars == 0` and `overlap >= max_chars` (the window would
//!    never advance).
//! 2. `start = 0`; emit `text[start .. min(start + max_chars, len)]`.
//! 3. Stop once a window reaches the end; otherwise `start = end - overlap`.
//!
//! # Example
//!
//! ```rust
//! use vectorfold::chunk::split_windows;
//!
//! let text = "a".repeat(4500);
//! let windows = split_windows(&text, 2000, 200).unwrap();
//! let offsets: Vec<usize> = windows.iter().map(|w| w.offset).collect();
//! assert_eq!(offsets, vec![0, 1800, 3600]);
//! ```

use crate::chunk_id::{chunk_uuid_with_hash, sha256_hex};
use crate::error::ChunkError;
use crate::models::{Chunk, Document};

/// A borrowed window of the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window<'a> {
    /// Char offset of the window start.
    pub offset: usize,
    pub text: &'a str,
}

/// Check that `(max_chars, overlap)` guarantees forward progress.
pub fn validate(max_chars: usize, overlap: usize) -> Result<(), ChunkError> {
    if max_chars == 0 {
        return Err(ChunkError::ZeroWindow);
    }
    if overlap >= max_chars {
        return Err(ChunkError::OverlapTooLarge { max_chars, overlap });
    }
    Ok(())
}

/// Split `text` into overlapping windows.
///
/// Returns an empty vector for empty text and a single window when the
/// text fits in `max_chars`.
pub fn split_windows(
    text: &str,
    max_chars: usize,
    overlap: usize,
) -> Result<Vec<Window<'_>>, ChunkError> {
    validate(max_chars, overlap)?;

    if text.is_empty() {
        return Ok(Vec::new());
    }

    // Byte position of every char boundary, plus the end of the string.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let n = bounds.len() - 1;

    let mut windows = Vec::with_capacity(n / (max_chars - overlap) + 1);
    let mut start = 0usize;
    loop {
        let end = (start + max_chars).min(n);
        windows.push(Window {
            offset: start,
            text: &text[bounds[start]..bounds[end]],
        });
        if end == n {
            break;
        }
        start = end - overlap;
    }

    Ok(windows)
}

/// Chunk a document into identified [`Chunk`]s with contiguous indices.
pub fn chunk_document(
    doc: &Document,
    max_chars: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, ChunkError> {
    let windows = split_windows(&doc.text, max_chars, overlap)?;
    Ok(windows
        .into_iter()
        .enumerate()
        .map(|(index, w)| {
            let hash = sha256_hex(w.text);
            Chunk {
                id: chunk_uuid_with_hash(&doc.source_path, index, &hash).to_string(),
                source_path: doc.source_path.clone(),
                chunk_index: index,
                char_offset: w.offset,
                text: w.text.to_string(),
                hash,
            }
        })
        .collect())
}
