//! Typed errors for the seams where callers branch on the failure kind.
//!
//! Orchestration code uses `anyhow`; these enums exist where the pipeline
//! has to decide between retrying, skipping, or aborting.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single embedding call.
///
/// [`EmbedError::is_retryable`] separates transient service trouble
/// (network, rate limits, timeouts, garbled responses) from requests that
/// will never succeed no matter how often they are repeated.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding transport error: {0}")]
    Transport(String),

    #[error("embedding service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("embedding service rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("embedding service refused credentials ({status})")]
    Unauthorized { status: u16 },

    #[error("malformed embedding response: {0}")]
    MalformedResponse(String),

    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding provider is disabled")]
    Disabled,

    #[error("embedding failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<EmbedError>,
    },
}

impl EmbedError {
    /// Whether repeating the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbedError::Transport(_)
            | EmbedError::Service { .. }
            | EmbedError::MalformedResponse(_)
            | EmbedError::Timeout(_) => true,
            EmbedError::Rejected { .. }
            | EmbedError::Unauthorized { .. }
            | EmbedError::Disabled
            | EmbedError::Exhausted { .. } => false,
        }
    }

    /// Map an HTTP status from an embedding endpoint onto the taxonomy.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => EmbedError::Unauthorized { status },
            408 | 429 => EmbedError::Service { status, body },
            s if s >= 500 => EmbedError::Service { status, body },
            _ => EmbedError::Rejected { status, body },
        }
    }
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            EmbedError::MalformedResponse(err.to_string())
        } else {
            EmbedError::Transport(err.to_string())
        }
    }
}

/// Text extraction failure for one file. The scan skips the file.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported extension: {0}")]
    UnsupportedExtension(String),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("EPUB extraction failed: {0}")]
    Epub(String),

    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// Invalid chunking parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("max_chars must be > 0")]
    ZeroWindow,

    #[error("overlap ({overlap}) must be smaller than max_chars ({max_chars})")]
    OverlapTooLarge { max_chars: usize, overlap: usize },
}
