//! Bounded worker pools for parsing and embedding.
//!
//! Both pools follow the same shape: every unit of work is spawned into a
//! [`JoinSet`], a [`Semaphore`] caps how many run at once, and results are
//! collected at a single point (the caller's task) in completion order.
//! Workers never share mutable state; whatever they produce travels back
//! inside the task's return value.
//!
//! - The parse pool runs blocking extraction on the blocking thread pool.
//!   A panicking extractor fails that file only.
//! - The embed pool runs one [`Embedder::embed`] per batch. A batch carries
//!   its ids and payloads, so a result can never be matched to the wrong
//!   chunks. A failed batch does not cancel its siblings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::embedder::Embedder;
use crate::error::EmbedError;
use crate::extract::ExtractorRegistry;
use crate::ingest::IngestStage;
use crate::models::{Document, SourceFile};
use crate::progress::{is_milestone, ProgressEvent, ProgressReporter};
use crate::scanner::parse_file;

// ============ Parse pool ============

#[derive(Debug, Clone)]
pub struct ParseFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    /// Sorted by source path.
    pub documents: Vec<Document>,
    /// Files whose text was below the minimum length.
    pub skipped: Vec<PathBuf>,
    pub failures: Vec<ParseFailure>,
}

enum Parsed {
    Document(Document),
    Skipped(PathBuf),
    Failed(ParseFailure),
}

/// Extract every file with at most `workers` extractions in flight.
///
/// Returns once all files are done. Output order does not depend on
/// completion order.
pub async fn parse_all(
    files: Vec<SourceFile>,
    registry: Arc<ExtractorRegistry>,
    workers: usize,
    min_content_chars: usize,
    progress: &dyn ProgressReporter,
) -> ParseOutcome {
    let total = files.len() as u64;
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut set = JoinSet::new();

    for file in files {
        let semaphore = Arc::clone(&semaphore);
        let registry = Arc::clone(&registry);
        set.spawn(async move {
            let path = file.path.clone();
            let _permit = semaphore.acquire_owned().await.ok();
            let joined = tokio::task::spawn_blocking(move || {
                parse_file(&file, &registry, min_content_chars)
            })
            .await;

            match joined {
                Ok(Ok(Some(doc))) => Parsed::Document(doc),
                Ok(Ok(None)) => Parsed::Skipped(path),
                Ok(Err(e)) => Parsed::Failed(ParseFailure {
                    path,
                    error: e.to_string(),
                }),
                Err(e) => Parsed::Failed(ParseFailure {
                    path,
                    error: if e.is_panic() {
                        "extractor panicked".to_string()
                    } else {
                        e.to_string()
                    },
                }),
            }
        });
    }

    let mut outcome = ParseOutcome::default();
    let mut done = 0u64;
    while let Some(joined) = set.join_next().await {
        done += 1;
        match joined {
            Ok(Parsed::Document(doc)) => outcome.documents.push(doc),
            Ok(Parsed::Skipped(path)) => {
                tracing::debug!(path = %path.display(), "skipped: too little text");
                outcome.skipped.push(path);
            }
            Ok(Parsed::Failed(failure)) => {
                tracing::warn!(path = %failure.path.display(), error = %failure.error, "parse failed");
                outcome.failures.push(failure);
            }
            Err(e) => {
                tracing::error!(error = %e, "parse task died");
                outcome.failures.push(ParseFailure {
                    path: PathBuf::new(),
                    error: e.to_string(),
                });
            }
        }
        if is_milestone(done, total) {
            progress.report(ProgressEvent::Advance {
                stage: IngestStage::Parsing,
                n: done,
                total,
            });
        }
    }

    outcome
        .documents
        .sort_by(|a, b| a.source_path.cmp(&b.source_path));
    outcome.skipped.sort();
    outcome.failures.sort_by(|a, b| a.path.cmp(&b.path));
    outcome
}

// ============ Embed pool ============

/// A chunk waiting to be embedded.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub id: String,
    pub text: String,
    pub payload: serde_json::Value,
}

/// One embedding request: parallel vectors of ids, texts and payloads.
#[derive(Debug, Clone, Default)]
pub struct EmbedBatch {
    /// Position in submission order, 0-based.
    pub seq: usize,
    pub ids: Vec<String>,
    pub texts: Vec<String>,
    pub payloads: Vec<serde_json::Value>,
}

impl EmbedBatch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Split `pending` into consecutive batches of at most `batch_size`.
pub fn make_batches(pending: Vec<PendingChunk>, batch_size: usize) -> Vec<EmbedBatch> {
    let batch_size = batch_size.max(1);
    let mut batches: Vec<EmbedBatch> = Vec::with_capacity(pending.len().div_ceil(batch_size));
    for chunk in pending {
        let needs_new = batches.last().map_or(true, |b| b.len() >= batch_size);
        if needs_new {
            batches.push(EmbedBatch {
                seq: batches.len(),
                ..EmbedBatch::default()
            });
        }
        if let Some(batch) = batches.last_mut() {
            batch.ids.push(chunk.id);
            batch.texts.push(chunk.text);
            batch.payloads.push(chunk.payload);
        }
    }
    batches
}

/// A batch together with its embedding result.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch: EmbedBatch,
    pub result: Result<Vec<Vec<f32>>, EmbedError>,
    pub latency: Duration,
}

pub struct EmbedPool {
    set: JoinSet<BatchOutcome>,
    outstanding_chunks: usize,
    lost_tasks: usize,
}

impl EmbedPool {
    /// Start embedding every batch, at most `workers` at a time.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(batches: Vec<EmbedBatch>, embedder: Embedder, workers: usize) -> Self {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut set = JoinSet::new();
        let mut outstanding_chunks = 0;

        for batch in batches {
            outstanding_chunks += batch.len();
            let semaphore = Arc::clone(&semaphore);
            let embedder = embedder.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let start = Instant::now();
                let result = embedder.embed(&batch.texts).await;
                BatchOutcome {
                    batch,
                    result,
                    latency: start.elapsed(),
                }
            });
        }

        Self {
            set,
            outstanding_chunks,
            lost_tasks: 0,
        }
    }

    /// Next finished batch, in completion order. `None` once all are done.
    pub async fn next(&mut self) -> Option<BatchOutcome> {
        loop {
            match self.set.join_next().await? {
                Ok(outcome) => {
                    self.outstanding_chunks -= outcome.batch.len();
                    return Some(outcome);
                }
                Err(e) => {
                    self.lost_tasks += 1;
                    tracing::error!(error = %e, "embed task died without reporting");
                }
            }
        }
    }

    /// Chunks whose task died without returning an outcome. Only final
    /// once [`EmbedPool::next`] has returned `None`.
    pub fn lost_chunks(&self) -> usize {
        if self.set.is_empty() {
            self.outstanding_chunks
        } else {
            0
        }
    }

    pub fn lost_tasks(&self) -> usize {
        self.lost_tasks
    }
}
