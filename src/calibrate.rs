//! Embedding batch-size calibration.
//!
//! `vfold calibrate <folder>` samples chunks from the folder, embeds them
//! once per candidate batch size through the same bounded pool ingestion
//! uses, and writes the best candidate as a [`TuningRecommendation`].
//! Nothing is upserted.
//!
//! Selection: highest throughput, ties broken by the lowest batch latency
//! standard deviation (`throughput_then_stability`).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::json;

use crate::chunk;
use crate::chunk_id::sha256_hex;
use crate::coordinator::{make_batches, parse_all, EmbedPool, PendingChunk};
use crate::embedder::Embedder;
use crate::extract::ExtractorRegistry;
use crate::metrics::{emit, MetricsSink};
use crate::models::Document;
use crate::progress::NoProgress;
use crate::scanner::{gather_files, ScanOptions};
use crate::tuning::{dataset_signature, load_recommendation, write_recommendation, TuningRecommendation};

pub const METRICS_STREAM: &str = "calibrate";
pub const STRATEGY: &str = "throughput_then_stability";

#[derive(Debug, Clone)]
pub struct CalibrateOptions {
    pub root: PathBuf,
    /// Chunks to embed per candidate.
    pub sample: usize,
    pub max_chars: usize,
    pub overlap: usize,
    pub min_content_chars: usize,
    pub batch_sizes: Vec<usize>,
    pub workers: usize,
    /// Parse pool size.
    pub parse_workers: usize,
    pub tuning_file: PathBuf,
    pub force_retune: bool,
    pub scan: ScanOptions,
}

/// Measurements for one batch size.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkResult {
    pub batch_size: usize,
    pub workers: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub total_ms: f64,
    pub mean_batch_ms: f64,
    pub median_batch_ms: f64,
    pub p95_batch_ms: f64,
    pub stddev_batch_ms: f64,
    pub throughput_chunks_per_s: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub sample: usize,
    pub results: Vec<BenchmarkResult>,
    pub recommendation: Option<TuningRecommendation>,
    pub tuning_file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_error: Option<String>,
}

impl fmt::Display for CalibrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Calibration results ({} sampled chunks):", self.sample)?;
        writeln!(
            f,
            "{:>6} {:>8} {:>8} {:>7} {:>10} {:>9} {:>9} {:>9} {:>9} {:>12}",
            "batch", "workers", "batches", "failed", "total_ms", "mean_ms", "median_ms", "p95_ms", "stddev", "chunks/s"
        )?;
        for r in &self.results {
            writeln!(
                f,
                "{:>6} {:>8} {:>8} {:>7} {:>10.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>12.2}",
                r.batch_size,
                r.workers,
                r.batches,
                r.failed_batches,
                r.total_ms,
                r.mean_batch_ms,
                r.median_batch_ms,
                r.p95_batch_ms,
                r.stddev_batch_ms,
                r.throughput_chunks_per_s
            )?;
        }
        match (&self.recommendation, &self.write_error) {
            (Some(rec), None) => writeln!(
                f,
                "Wrote recommendation to {}: batch_size={} workers={}",
                self.tuning_file.display(),
                rec.batch_size,
                rec.workers
            ),
            (Some(_), Some(e)) => writeln!(f, "Recommendation not written: {}", e),
            (None, _) => writeln!(f, "No usable calibration result."),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Up to `limit` chunk texts, taken round-robin across documents.
pub fn sample_chunks(
    docs: &[Document],
    max_chars: usize,
    overlap: usize,
    limit: usize,
) -> Result<Vec<String>> {
    let mut per_doc = Vec::with_capacity(docs.len());
    for doc in docs {
        let texts: Vec<String> = chunk::chunk_document(doc, max_chars, overlap)?
            .into_iter()
            .map(|c| c.text)
            .collect();
        per_doc.push(texts.into_iter());
    }

    // Round-robin: the i-th chunk of every document before any (i+1)-th.
    let mut sample = Vec::new();
    while sample.len() < limit {
        let before = sample.len();
        for chunks in per_doc.iter_mut() {
            if sample.len() >= limit {
                break;
            }
            if let Some(text) = chunks.next() {
                sample.push(text);
            }
        }
        if sample.len() == before {
            break;
        }
    }
    Ok(sample)
}

/// Summarise per-batch latencies. `embedded` counts chunks of successful
/// batches only; `total` is wall-clock for the whole candidate.
pub fn batch_stats(
    batch_size: usize,
    workers: usize,
    latencies_ms: &[f64],
    failed_batches: usize,
    embedded: usize,
    total: Duration,
) -> BenchmarkResult {
    let total_ms = total.as_secs_f64() * 1000.0;
    let mut sorted = latencies_ms.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    let (mean, median, p95, stddev) = if n == 0 {
        (0.0, 0.0, 0.0, 0.0)
    } else {
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let var = sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        let p95_idx = ((0.95 * (n - 1) as f64) as usize).min(n - 1);
        (mean, sorted[n / 2], sorted[p95_idx], var.sqrt())
    };
    let throughput = if total_ms > 0.0 {
        embedded as f64 / (total_ms / 1000.0)
    } else {
        0.0
    };

    BenchmarkResult {
        batch_size,
        workers,
        batches: n + failed_batches,
        failed_batches,
        total_ms: round2(total_ms),
        mean_batch_ms: round2(mean),
        median_batch_ms: round2(median),
        p95_batch_ms: round2(p95),
        stddev_batch_ms: round2(stddev),
        throughput_chunks_per_s: round2(throughput),
    }
}

/// Highest throughput, then lowest stddev. Candidates that embedded
/// nothing are never picked.
pub fn pick_best(results: &[BenchmarkResult]) -> Option<&BenchmarkResult> {
    results
        .iter()
        .filter(|r| r.throughput_chunks_per_s > 0.0)
        .max_by(|a, b| {
            a.throughput_chunks_per_s
                .partial_cmp(&b.throughput_chunks_per_s)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.stddev_batch_ms
                        .partial_cmp(&a.stddev_batch_ms)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        })
}

/// Embed `texts` in batches of `batch_size` with `workers` concurrent calls.
pub async fn benchmark(
    embedder: &Embedder,
    texts: &[String],
    batch_size: usize,
    workers: usize,
    metrics: &dyn MetricsSink,
) -> BenchmarkResult {
    let pending = texts
        .iter()
        .enumerate()
        .map(|(i, t)| PendingChunk {
            id: i.to_string(),
            text: t.clone(),
            payload: serde_json::Value::Null,
        })
        .collect();
    let batches = make_batches(pending, batch_size);

    let started = Instant::now();
    let mut pool = EmbedPool::spawn(batches, embedder.clone(), workers);
    let mut latencies = Vec::new();
    let mut failed = 0usize;
    let mut embedded = 0usize;
    while let Some(outcome) = pool.next().await {
        let ms = outcome.latency.as_secs_f64() * 1000.0;
        match &outcome.result {
            Ok(_) => {
                latencies.push(ms);
                embedded += outcome.batch.len();
            }
            Err(e) => {
                tracing::warn!(batch_size, error = %e, "calibration batch failed");
                failed += 1;
            }
        }
        emit(
            metrics,
            METRICS_STREAM,
            "embed_batch",
            json!({
                "batch_size": outcome.batch.len(),
                "duration_ms": round2(ms),
                "ok": outcome.result.is_ok(),
            }),
        );
    }
    failed += pool.lost_tasks();

    batch_stats(batch_size, workers, &latencies, failed, embedded, started.elapsed())
}

/// Sample, benchmark every candidate and write the tuning file.
pub async fn run_calibration(
    options: &CalibrateOptions,
    embedder: &Embedder,
    metrics: Arc<dyn MetricsSink>,
) -> Result<CalibrationReport> {
    if !options.root.is_dir() {
        bail!("Folder not found: {}", options.root.display());
    }
    if options.batch_sizes.is_empty() || options.batch_sizes.contains(&0) {
        bail!("batch sizes must be >= 1");
    }
    chunk::validate(options.max_chars, options.overlap).context("invalid chunking parameters")?;

    let root = std::fs::canonicalize(&options.root)
        .with_context(|| format!("Failed to resolve {}", options.root.display()))?;
    let registry = Arc::new(ExtractorRegistry::with_defaults());
    let files = gather_files(&root, &registry, &options.scan)?;
    let parsed = parse_all(
        files.clone(),
        registry,
        options.parse_workers,
        options.min_content_chars,
        &NoProgress,
    )
    .await;

    let mut sample = sample_chunks(&parsed.documents, options.max_chars, options.overlap, options.sample)?;
    if sample.is_empty() {
        bail!("No chunks sampled from {}", root.display());
    }
    // Shuffle deterministically so batches mix documents.
    sample.sort_by_cached_key(|t| sha256_hex(t));

    emit(
        metrics.as_ref(),
        METRICS_STREAM,
        "start",
        json!({ "sample": sample.len(), "folder": root.display().to_string() }),
    );

    let mut results = Vec::new();
    for &batch_size in &options.batch_sizes {
        tracing::info!(batch_size, workers = options.workers, "benchmarking");
        let r = benchmark(embedder, &sample, batch_size, options.workers, metrics.as_ref()).await;
        emit(
            metrics.as_ref(),
            METRICS_STREAM,
            "result",
            serde_json::to_value(&r)?,
        );
        results.push(r);
    }
    emit(metrics.as_ref(), METRICS_STREAM, "end", json!({}));

    let mut report = CalibrationReport {
        sample: sample.len(),
        results,
        recommendation: None,
        tuning_file: options.tuning_file.clone(),
        write_error: None,
    };
    let Some(best) = pick_best(&report.results) else {
        return Ok(report);
    };

    let now = chrono::Utc::now();
    let age_days_previous = if options.force_retune {
        None
    } else {
        load_recommendation(&options.tuning_file)
            .ok()
            .flatten()
            .and_then(|prev| prev.age_days(now))
            .map(round2)
    };

    let rec = TuningRecommendation {
        batch_size: best.batch_size,
        workers: best.workers,
        chunk_size: options.max_chars,
        overlap: options.overlap,
        dataset_hash: dataset_signature(&files, options.max_chars, options.overlap),
        generated_at: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        throughput_chunks_per_s: best.throughput_chunks_per_s,
        mean_batch_ms: Some(best.mean_batch_ms),
        median_batch_ms: Some(best.median_batch_ms),
        p95_batch_ms: Some(best.p95_batch_ms),
        stddev_batch_ms: Some(best.stddev_batch_ms),
        sample: Some(report.sample),
        strategy: Some(STRATEGY.to_string()),
        run_id: Some(uuid::Uuid::new_v4().simple().to_string()[..12].to_string()),
        age_days_previous,
        force_retune: Some(options.force_retune),
    };

    match write_recommendation(&options.tuning_file, &rec) {
        Ok(()) => emit(
            metrics.as_ref(),
            METRICS_STREAM,
            "recommendation",
            serde_json::to_value(&rec)?,
        ),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "failed to write tuning file");
            emit(
                metrics.as_ref(),
                METRICS_STREAM,
                "recommendation:error",
                json!({ "error": format!("{:#}", e) }),
            );
            report.write_error = Some(format!("{:#}", e));
        }
    }
    report.recommendation = Some(rec);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(batch_size: usize, throughput: f64, stddev: f64) -> BenchmarkResult {
        BenchmarkResult {
            batch_size,
            workers: 2,
            batches: 4,
            failed_batches: 0,
            total_ms: 100.0,
            mean_batch_ms: 10.0,
            median_batch_ms: 10.0,
            p95_batch_ms: 12.0,
            stddev_batch_ms: stddev,
            throughput_chunks_per_s: throughput,
        }
    }

    #[test]
    fn stats_use_lower_median_and_floor_p95() {
        let r = batch_stats(
            8,
            2,
            &[40.0, 10.0, 30.0, 20.0],
            1,
            24,
            Duration::from_secs(2),
        );
        assert_eq!(r.batches, 5);
        assert_eq!(r.failed_batches, 1);
        assert_eq!(r.mean_batch_ms, 25.0);
        assert_eq!(r.median_batch_ms, 30.0);
        // floor(0.95 * 3) = 2
        assert_eq!(r.p95_batch_ms, 30.0);
        assert_eq!(r.stddev_batch_ms, 11.18);
        assert_eq!(r.throughput_chunks_per_s, 12.0);
    }

    #[test]
    fn empty_latencies_give_zeros() {
        let r = batch_stats(8, 2, &[], 3, 0, Duration::from_millis(5));
        assert_eq!(r.mean_batch_ms, 0.0);
        assert_eq!(r.throughput_chunks_per_s, 0.0);
        assert_eq!(r.batches, 3);
    }

    #[test]
    fn best_is_fastest_then_steadiest() {
        let results = vec![
            result(4, 100.0, 1.0),
            result(8, 150.0, 9.0),
            result(16, 150.0, 3.0),
            result(32, 0.0, 0.0),
        ];
        assert_eq!(pick_best(&results).map(|r| r.batch_size), Some(16));
        assert!(pick_best(&[result(4, 0.0, 0.0)]).is_none());
    }

    #[test]
    fn sample_stops_at_limit() {
        let doc = Document {
            source_path: PathBuf::from("/x/a.txt"),
            rel_path: "a.txt".into(),
            extension: ".txt".into(),
            text: "word ".repeat(200),
            title: None,
            author: None,
        };
        let all = sample_chunks(std::slice::from_ref(&doc), 100, 10, usize::MAX).unwrap();
        assert!(all.len() > 3);
        let three = sample_chunks(&[doc.clone(), doc], 100, 10, 3).unwrap();
        assert_eq!(three.len(), 3);
    }

    #[test]
    fn sample_takes_from_every_document() {
        let doc = |name: &str, word: &str| Document {
            source_path: PathBuf::from(format!("/x/{}", name)),
            rel_path: name.into(),
            extension: ".txt".into(),
            text: format!("{} ", word).repeat(100),
            title: None,
            author: None,
        };
        let docs = vec![doc("a.txt", "alpha"), doc("b.txt", "bravo"), doc("c.txt", "charlie")];
        let sample = sample_chunks(&docs, 100, 10, 4).unwrap();
        assert_eq!(sample.len(), 4);
        assert!(sample[0].contains("alpha"));
        assert!(sample[1].contains("bravo"));
        assert!(sample[2].contains("charlie"));
        assert!(sample[3].contains("alpha"));
    }
}
