//! Ingestion pipeline orchestration.
//!
//! [`IngestionDriver::run`] walks a folder through every stage:
//!
//! ```text
//! Scanning → Parsing → Chunking → Embedding → Upserting → Persisting → Done
//!     └──────────── any fatal precondition ────────────→ Failed
//! ```
//!
//! 1. Verify the root; connect the embedding provider and vector store and
//!    ensure (or recreate) the collection. Dry runs skip the services.
//! 2. List files, then ask the [`TuningAdvisor`] for batch size and embed
//!    workers.
//! 3. Parse in the bounded parse pool.
//! 4. Chunk each document, optionally write a parsed-text sidecar, and drop
//!    chunks the dedup cache already knows. A dry run stops here with
//!    per-file projections.
//! 5. Embed in the bounded embed pool. Each finished batch is upserted in
//!    `upsert_batch_size` slices; only ids of a successful slice are marked
//!    in the cache.
//! 6. Flush the cache and emit the summary.
//!
//! Only missing folders, missing credentials and an unreachable store at
//! startup abort a run. Everything else (a bad file, an exhausted batch, a
//! rejected upsert, an unwritable cache) is counted in the [`IngestReport`]
//! and the run still ends in `Done`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde_json::json;

use crate::cache::{CacheStatus, DedupCache};
use crate::chunk;
use crate::config::{Config, EmbeddingConfig, Profile, VectorStoreConfig};
use crate::coordinator::{make_batches, parse_all, EmbedPool, ParseFailure, PendingChunk};
use crate::embedder::{Embedder, RetryPolicy};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::extract::ExtractorRegistry;
use crate::metrics::{emit, MetricsSink, NoMetrics};
use crate::models::{ChunkPayload, Point};
use crate::progress::{is_milestone, NoProgress, ProgressEvent, ProgressReporter};
use crate::scanner::{gather_files, ScanOptions};
use crate::tuning::{TuningAdvisor, TuningDecision, TuningRequest};
use crate::vector_store::{create_store, VectorStore};

pub const METRICS_STREAM: &str = "ingest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Scanning,
    Parsing,
    Chunking,
    Embedding,
    Upserting,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestStage::Scanning => "scanning",
            IngestStage::Parsing => "parsing",
            IngestStage::Chunking => "chunking",
            IngestStage::Embedding => "embedding",
            IngestStage::Upserting => "upserting",
            IngestStage::Persisting => "persisting",
            IngestStage::Done => "done",
            IngestStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ============ Options ============

/// Effective parameters of one run: config, then profile, then CLI flags.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub root: PathBuf,
    pub collection: String,
    pub max_chars: usize,
    pub overlap: usize,
    pub min_content_chars: usize,
    pub batch_size: usize,
    pub upsert_batch_size: usize,
    /// Parse pool size.
    pub workers: usize,
    /// Embed pool size.
    pub embed_workers: usize,
    /// Pinned values are never replaced by a tuning recommendation.
    pub batch_size_pinned: bool,
    pub embed_workers_pinned: bool,
    pub dry_run: bool,
    pub use_cache: bool,
    pub cache_dir: Option<PathBuf>,
    pub tuning_enabled: bool,
    pub tuning_file: PathBuf,
    pub drift_threshold: f64,
    pub recreate: bool,
    pub write_parsed: bool,
    pub parsed_dir: Option<PathBuf>,
    pub scan: ScanOptions,
}

/// Values given explicitly on the command line.
#[derive(Debug, Clone, Default)]
pub struct IngestOverrides {
    pub collection: Option<String>,
    pub max_chars: Option<usize>,
    pub overlap: Option<usize>,
    pub batch_size: Option<usize>,
    pub upsert_batch_size: Option<usize>,
    pub workers: Option<usize>,
    pub embed_workers: Option<usize>,
    pub profile: Option<Profile>,
    pub dry_run: bool,
    pub no_cache: bool,
    pub no_tuning: bool,
    pub recreate: bool,
    pub write_parsed: bool,
    pub parsed_dir: Option<PathBuf>,
}

impl IngestOptions {
    pub fn from_config(root: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            root: root.into(),
            collection: config.ingest.collection.clone(),
            max_chars: config.chunking.max_chars,
            overlap: config.chunking.overlap,
            min_content_chars: config.chunking.min_content_chars,
            batch_size: config.embedding.batch_size,
            upsert_batch_size: config.vector_store.upsert_batch_size,
            workers: config.ingest.workers,
            embed_workers: config.ingest.embed_workers,
            batch_size_pinned: false,
            embed_workers_pinned: false,
            dry_run: false,
            use_cache: config.ingest.use_cache,
            cache_dir: config.ingest.cache_dir.clone(),
            tuning_enabled: config.tuning.enabled,
            tuning_file: config.tuning.file.clone(),
            drift_threshold: config.tuning.drift_threshold,
            recreate: false,
            write_parsed: config.ingest.write_parsed,
            parsed_dir: config.ingest.parsed_dir.clone(),
            scan: ScanOptions {
                exclude_globs: config.ingest.exclude_globs.clone(),
                follow_symlinks: config.ingest.follow_symlinks,
            },
        }
    }

    /// Apply a named preset. Preset values count as pinned.
    pub fn apply_profile(&mut self, profile: Profile) {
        match profile {
            Profile::Aggressive => {
                self.max_chars = 2600;
                self.overlap = 220;
                self.batch_size = self.batch_size.max(48);
                self.upsert_batch_size = self.upsert_batch_size.max(800);
                self.workers = self.workers.max(8);
                self.embed_workers = self.embed_workers.max(6);
            }
            Profile::Books => {
                self.max_chars = 2800;
                self.overlap = 250;
                self.batch_size = self.batch_size.max(48);
                self.upsert_batch_size = self.upsert_batch_size.max(1000);
                self.workers = self.workers.max(8);
                self.embed_workers = self.embed_workers.max(6);
            }
            Profile::Conservative => {
                self.max_chars = 2000;
                self.overlap = 200;
                self.batch_size = 32;
                self.upsert_batch_size = 500;
                self.workers = self.workers.max(4);
                self.embed_workers = self.embed_workers.max(4);
            }
        }
        self.batch_size_pinned = true;
        self.embed_workers_pinned = true;
    }

    /// Profile first, then explicit values on top.
    pub fn apply_overrides(&mut self, o: &IngestOverrides) {
        if let Some(profile) = o.profile {
            self.apply_profile(profile);
        }
        if let Some(c) = &o.collection {
            self.collection = c.clone();
        }
        if let Some(v) = o.max_chars {
            self.max_chars = v;
        }
        if let Some(v) = o.overlap {
            self.overlap = v;
        }
        if let Some(v) = o.batch_size {
            self.batch_size = v;
            self.batch_size_pinned = true;
        }
        if let Some(v) = o.upsert_batch_size {
            self.upsert_batch_size = v;
        }
        if let Some(v) = o.workers {
            self.workers = v;
        }
        if let Some(v) = o.embed_workers {
            self.embed_workers = v;
            self.embed_workers_pinned = true;
        }
        self.dry_run |= o.dry_run;
        self.use_cache &= !o.no_cache;
        self.tuning_enabled &= !o.no_tuning;
        self.recreate |= o.recreate;
        self.write_parsed |= o.write_parsed;
        if let Some(dir) = &o.parsed_dir {
            self.parsed_dir = Some(dir.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        chunk::validate(self.max_chars, self.overlap).context("invalid chunking parameters")?;
        if self.batch_size == 0 || self.upsert_batch_size == 0 {
            bail!("batch sizes must be >= 1");
        }
        if self.workers == 0 || self.embed_workers == 0 {
            bail!("worker counts must be >= 1");
        }
        if self.collection.trim().is_empty() {
            bail!("collection name must not be empty");
        }
        Ok(())
    }

    /// Next to the root folder unless configured.
    pub fn cache_dir_for(&self, root: &Path) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| root.parent().unwrap_or(root).join(".ingest_cache"))
    }

    pub fn parsed_dir_for(&self, root: &Path) -> PathBuf {
        self.parsed_dir
            .clone()
            .unwrap_or_else(|| root.parent().unwrap_or(root).join("parsed_corpus"))
    }
}

// ============ Report ============

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub stage: IngestStage,
    pub dry_run: bool,
    pub root: PathBuf,
    pub collection: String,
    pub backend: String,
    pub model: String,

    pub files_found: usize,
    pub files_parsed: usize,
    pub files_skipped: usize,
    pub parse_failures: Vec<ParseFailure>,
    pub sidecar_failures: usize,

    pub chunks_total: usize,
    pub chunks_cached: usize,
    pub chunks_pending: usize,
    pub chunks_embedded: usize,
    /// Chunks of batches that exhausted retries or whose task died.
    pub chunks_failed: usize,
    /// Chunks embedded but rejected by the store.
    pub chunks_upsert_failed: usize,

    pub batches_total: usize,
    pub batches_failed: usize,
    pub upserts_failed: usize,

    pub batch_size: usize,
    pub upsert_batch_size: usize,
    pub workers: usize,
    pub embed_workers: usize,

    pub tuning: Option<TuningDecision>,
    pub cache_status: CacheStatus,
    pub cache_ids: usize,
    pub cache_error: Option<String>,

    /// Dry runs: chunk count per file, in path order.
    pub projected: Vec<(String, usize)>,
    pub elapsed: Duration,
}

impl IngestReport {
    fn new(options: &IngestOptions) -> Self {
        Self {
            stage: IngestStage::Scanning,
            dry_run: options.dry_run,
            root: options.root.clone(),
            collection: options.collection.clone(),
            backend: String::new(),
            model: String::new(),
            files_found: 0,
            files_parsed: 0,
            files_skipped: 0,
            parse_failures: Vec::new(),
            sidecar_failures: 0,
            chunks_total: 0,
            chunks_cached: 0,
            chunks_pending: 0,
            chunks_embedded: 0,
            chunks_failed: 0,
            chunks_upsert_failed: 0,
            batches_total: 0,
            batches_failed: 0,
            upserts_failed: 0,
            batch_size: options.batch_size,
            upsert_batch_size: options.upsert_batch_size,
            workers: options.workers,
            embed_workers: options.embed_workers,
            tuning: None,
            cache_status: CacheStatus::Disabled,
            cache_ids: 0,
            cache_error: None,
            projected: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Files and chunks that did not make it. Zero means a clean run.
    pub fn failures(&self) -> usize {
        self.parse_failures.len() + self.chunks_failed + self.chunks_upsert_failed
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.chunks_embedded as f64 / secs
        } else {
            0.0
        }
    }

    fn metrics_fields(&self) -> serde_json::Value {
        json!({
            "collection": self.collection,
            "dry_run": self.dry_run,
            "files": self.files_found,
            "files_failed": self.parse_failures.len(),
            "chunks_total": self.chunks_total,
            "chunks_cached": self.chunks_cached,
            "chunks_embedded": self.chunks_embedded,
            "chunks_failed": self.chunks_failed,
            "chunks_upsert_failed": self.chunks_upsert_failed,
            "batch_size": self.batch_size,
            "embed_workers": self.embed_workers,
            "duration_ms": (self.elapsed.as_secs_f64() * 1000.0).round(),
            "throughput_chunks_per_s": (self.throughput() * 100.0).round() / 100.0,
        })
    }
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dry_run {
            writeln!(
                f,
                "[dry run] {} files, {} chunks ({} new, {} cached)",
                self.files_found, self.chunks_total, self.chunks_pending, self.chunks_cached
            )?;
            for (file, n) in &self.projected {
                writeln!(f, "  - {} :: {} chunks", file, n)?;
            }
            for failure in &self.parse_failures {
                writeln!(f, "  - {} :: parse error: {}", failure.path.display(), failure.error)?;
            }
            return Ok(());
        }

        writeln!(
            f,
            "Ingest complete: collection '{}' ({}, model {})",
            self.collection, self.backend, self.model
        )?;
        writeln!(
            f,
            "  files: {} found, {} parsed, {} skipped, {} failed",
            self.files_found,
            self.files_parsed,
            self.files_skipped,
            self.parse_failures.len()
        )?;
        writeln!(f, "  chunks total: {}", self.chunks_total)?;
        writeln!(f, "  chunks cached: {}", self.chunks_cached)?;
        writeln!(f, "  chunks embedded: {}", self.chunks_embedded)?;
        writeln!(f, "  chunks failed: {}", self.chunks_failed + self.chunks_upsert_failed)?;
        writeln!(
            f,
            "  batches: {} ({} failed, {} upserts failed)",
            self.batches_total, self.batches_failed, self.upserts_failed
        )?;
        writeln!(
            f,
            "  batch size: {}, upsert batch size: {}, parse workers: {}, embed workers: {}",
            self.batch_size, self.upsert_batch_size, self.workers, self.embed_workers
        )?;
        if let Some(tuning) = &self.tuning {
            write!(f, "  tuning: {}", tuning.outcome)?;
            if let Some(drift) = &tuning.drift {
                if drift.retune_suggested() {
                    write!(f, "; retune suggested ({})", drift)?;
                }
            }
            writeln!(f)?;
        }
        write!(f, "  cache: {} -> {} ids", self.cache_status, self.cache_ids)?;
        if let Some(e) = &self.cache_error {
            write!(f, " (not saved: {})", e)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "  elapsed: {:.2}s ({:.1} chunks/s)",
            self.elapsed.as_secs_f64(),
            self.throughput()
        )?;
        for failure in &self.parse_failures {
            writeln!(f, "  parse error: {}: {}", failure.path.display(), failure.error)?;
        }
        Ok(())
    }
}

// ============ Driver ============

pub struct IngestionDriver {
    options: IngestOptions,
    embedding: EmbeddingConfig,
    store_config: VectorStoreConfig,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    store: Option<Arc<dyn VectorStore>>,
    metrics: Arc<dyn MetricsSink>,
    progress: Arc<dyn ProgressReporter>,
    registry: Arc<ExtractorRegistry>,
    stage: IngestStage,
}

impl IngestionDriver {
    pub fn new(options: IngestOptions, config: &Config) -> Self {
        Self {
            options,
            embedding: config.embedding.clone(),
            store_config: config.vector_store.clone(),
            provider: None,
            store: None,
            metrics: Arc::new(NoMetrics),
            progress: Arc::new(NoProgress),
            registry: Arc::new(ExtractorRegistry::with_defaults()),
            stage: IngestStage::Scanning,
        }
    }

    /// Use this provider instead of building one from config.
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use this store instead of connecting to the configured backend.
    pub fn with_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    pub fn stage(&self) -> IngestStage {
        self.stage
    }

    fn enter(&mut self, stage: IngestStage) {
        tracing::debug!(from = %self.stage, to = %stage, "ingest stage");
        self.stage = stage;
        self.progress.report(ProgressEvent::Stage { stage });
    }

    /// Run the pipeline. `Err` only for fatal preconditions; the driver is
    /// then in [`IngestStage::Failed`].
    pub async fn run(&mut self) -> Result<IngestReport> {
        let started = Instant::now();
        match self.run_stages(started).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let failed_in = self.stage;
                self.stage = IngestStage::Failed;
                emit(
                    self.metrics.as_ref(),
                    METRICS_STREAM,
                    "ingest:failed",
                    json!({
                        "stage": failed_in.to_string(),
                        "error": format!("{:#}", e),
                        "duration_ms": (started.elapsed().as_secs_f64() * 1000.0).round(),
                    }),
                );
                Err(e)
            }
        }
    }

    async fn run_stages(&mut self, started: Instant) -> Result<IngestReport> {
        self.enter(IngestStage::Scanning);
        self.options.validate()?;

        let root = &self.options.root;
        if !root.is_dir() {
            bail!("Folder not found: {}", root.display());
        }
        let root = std::fs::canonicalize(root)
            .with_context(|| format!("Failed to resolve {}", root.display()))?;

        let mut report = IngestReport::new(&self.options);
        report.root = root.clone();

        // Fatal preconditions come before any work.
        let services = if self.options.dry_run {
            None
        } else {
            Some(self.connect().await?)
        };
        if let Some((provider, store)) = &services {
            report.model = provider.model_name().to_string();
            report.backend = store.backend().to_string();
        }

        emit(
            self.metrics.as_ref(),
            METRICS_STREAM,
            "ingest:start",
            json!({
                "root": root.display().to_string(),
                "collection": self.options.collection,
                "dry_run": self.options.dry_run,
            }),
        );

        let files = gather_files(&root, &self.registry, &self.options.scan)?;
        report.files_found = files.len();
        tracing::info!(files = files.len(), root = %root.display(), "scan complete");

        let advisor = TuningAdvisor::new(self.options.drift_threshold);
        let decision = advisor.advise(&TuningRequest {
            enabled: self.options.tuning_enabled,
            tuning_file: &self.options.tuning_file,
            files: &files,
            chunk_size: self.options.max_chars,
            overlap: self.options.overlap,
            batch_size: self.options.batch_size,
            workers: self.options.embed_workers,
            batch_size_pinned: self.options.batch_size_pinned,
            workers_pinned: self.options.embed_workers_pinned,
        });
        report.batch_size = decision.batch_size;
        report.embed_workers = decision.workers;
        report.tuning = Some(decision);

        let use_cache = self.options.use_cache;
        let (mut cache, cache_status) = DedupCache::load(
            &self.options.cache_dir_for(&root),
            &self.options.collection,
            use_cache,
        );
        report.cache_status = cache_status;

        // Parsing
        self.enter(IngestStage::Parsing);
        let parsed = parse_all(
            files,
            Arc::clone(&self.registry),
            self.options.workers,
            self.options.min_content_chars,
            self.progress.as_ref(),
        )
        .await;
        for failure in &parsed.failures {
            emit(
                self.metrics.as_ref(),
                METRICS_STREAM,
                "file_failed",
                json!({ "path": failure.path.display().to_string(), "error": failure.error }),
            );
        }
        report.files_parsed = parsed.documents.len();
        report.files_skipped = parsed.skipped.len();
        report.parse_failures = parsed.failures;

        // Chunking
        self.enter(IngestStage::Chunking);
        let parsed_dir = self
            .options
            .write_parsed
            .then(|| self.options.parsed_dir_for(&root));
        if let Some(dir) = &parsed_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot create parsed-text dir");
            }
        }

        let mut pending = Vec::new();
        for doc in &parsed.documents {
            if let Some(dir) = &parsed_dir {
                if let Err(e) = write_sidecar(dir, &doc.source_path, &doc.text) {
                    tracing::warn!(path = %doc.source_path.display(), error = %e, "failed to write parsed text");
                    report.sidecar_failures += 1;
                }
            }

            let chunks = chunk::chunk_document(doc, self.options.max_chars, self.options.overlap)?;
            report.chunks_total += chunks.len();
            if self.options.dry_run {
                report.projected.push((doc.rel_path.clone(), chunks.len()));
            }

            for c in &chunks {
                if cache.contains(&c.id) {
                    report.chunks_cached += 1;
                    continue;
                }
                pending.push(PendingChunk {
                    id: c.id.clone(),
                    text: c.text.clone(),
                    payload: serde_json::to_value(ChunkPayload::new(doc, c))?,
                });
            }
        }
        drop(parsed.documents);
        report.chunks_pending = pending.len();
        tracing::info!(
            total = report.chunks_total,
            cached = report.chunks_cached,
            pending = report.chunks_pending,
            "chunking complete"
        );

        let Some((provider, store)) = services else {
            self.enter(IngestStage::Done);
            report.stage = IngestStage::Done;
            report.elapsed = started.elapsed();
            emit(
                self.metrics.as_ref(),
                METRICS_STREAM,
                "ingest:end",
                report.metrics_fields(),
            );
            return Ok(report);
        };

        // Embedding + upserting
        self.enter(IngestStage::Embedding);
        let embedder = Embedder::new(provider, RetryPolicy::from_config(&self.embedding))
            .with_metrics(Arc::clone(&self.metrics));
        let batches = make_batches(pending, report.batch_size);
        report.batches_total = batches.len();
        let mut pool = EmbedPool::spawn(batches, embedder, report.embed_workers);

        let upsert_size = self.options.upsert_batch_size;
        let total_pending = report.chunks_pending as u64;
        let mut done = 0u64;
        while let Some(outcome) = pool.next().await {
            let batch = outcome.batch;
            let vectors = match outcome.result {
                Ok(vectors) => vectors,
                Err(e) => {
                    tracing::error!(batch = batch.seq, chunks = batch.len(), error = %e, "embedding batch failed");
                    report.batches_failed += 1;
                    report.chunks_failed += batch.len();
                    emit(
                        self.metrics.as_ref(),
                        METRICS_STREAM,
                        "batch_failed",
                        json!({ "batch": batch.seq, "chunks": batch.len(), "error": e.to_string() }),
                    );
                    done += batch.len() as u64;
                    continue;
                }
            };
            if self.stage != IngestStage::Upserting {
                self.enter(IngestStage::Upserting);
            }

            let points: Vec<Point> = batch
                .ids
                .into_iter()
                .zip(vectors)
                .zip(batch.payloads)
                .map(|((id, vector), payload)| Point {
                    id,
                    vector,
                    payload,
                })
                .collect();

            for slice in points.chunks(upsert_size) {
                match store.upsert(&self.options.collection, slice).await {
                    Ok(()) => {
                        cache.mark(slice.iter().map(|p| p.id.clone()));
                        report.chunks_embedded += slice.len();
                    }
                    Err(e) => {
                        tracing::error!(batch = batch.seq, points = slice.len(), error = %format!("{:#}", e), "upsert failed");
                        report.upserts_failed += 1;
                        report.chunks_upsert_failed += slice.len();
                        emit(
                            self.metrics.as_ref(),
                            METRICS_STREAM,
                            "upsert_failed",
                            json!({ "batch": batch.seq, "points": slice.len(), "error": format!("{:#}", e) }),
                        );
                    }
                }
                done += slice.len() as u64;
                if is_milestone(done, total_pending) {
                    self.progress.report(ProgressEvent::Advance {
                        stage: IngestStage::Upserting,
                        n: done,
                        total: total_pending,
                    });
                }
            }
        }

        let lost = pool.lost_chunks();
        if lost > 0 {
            tracing::error!(chunks = lost, tasks = pool.lost_tasks(), "embed tasks died without reporting");
            report.chunks_failed += lost;
            report.batches_failed += pool.lost_tasks();
        }

        // Persisting
        self.enter(IngestStage::Persisting);
        if let Err(e) = cache.flush() {
            tracing::warn!(path = %cache.path().display(), error = %format!("{:#}", e), "dedup cache not saved");
            report.cache_error = Some(format!("{:#}", e));
        }
        report.cache_ids = cache.len();

        self.enter(IngestStage::Done);
        report.stage = IngestStage::Done;
        report.elapsed = started.elapsed();
        emit(
            self.metrics.as_ref(),
            METRICS_STREAM,
            "ingest:end",
            report.metrics_fields(),
        );
        tracing::info!(
            embedded = report.chunks_embedded,
            failed = report.failures(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "ingest complete"
        );
        Ok(report)
    }

    /// Build (or take) the provider and store and prepare the collection.
    async fn connect(&mut self) -> Result<(Arc<dyn EmbeddingProvider>, Arc<dyn VectorStore>)> {
        let provider = match &self.provider {
            Some(p) => Arc::clone(p),
            None => {
                if !self.embedding.is_enabled() {
                    bail!("Embedding provider is disabled; set [embedding].provider or use --dry-run");
                }
                create_provider(&self.embedding).context("embedding provider unavailable")?
            }
        };
        let store = match &self.store {
            Some(s) => Arc::clone(s),
            None => create_store(&self.store_config)
                .await
                .context("vector store unavailable")?,
        };

        let collection = &self.options.collection;
        let dims = provider.dims();
        if self.options.recreate {
            tracing::info!(collection = %collection, dims, "recreating collection");
            store
                .recreate_collection(collection, dims)
                .await
                .context("vector store unavailable")?;
        } else {
            store
                .ensure_collection(collection, dims)
                .await
                .context("vector store unavailable")?;
        }
        Ok((provider, store))
    }
}

/// `<dir>/<file-stem>.txt`
fn write_sidecar(dir: &Path, source: &Path, text: &str) -> Result<()> {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let path = dir.join(format!("{}.txt", stem));
    std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))
}
