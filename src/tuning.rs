//! Tuning recommendations from calibration runs.
//!
//! `vfold calibrate` benchmarks embedding batch sizes and writes the best
//! one to a JSON tuning file. Ingestion consults that file through the
//! [`TuningAdvisor`], which makes two independent checks:
//!
//! 1. **Applicability.** The recommendation records a dataset signature
//!    (see [`dataset_signature`]). If the current run's signature differs,
//!    the recommendation was measured on something else and the defaults
//!    are kept. If it matches, batch size and embed workers are adopted
//!    unless the caller pinned them.
//! 2. **Drift.** The current `chunk_size`/`overlap` are compared with the
//!    recorded ones. A relative change above the threshold suggests
//!    re-running calibration. This never blocks ingestion.
//!
//! The signature covers file paths and byte lengths only, so rewriting a
//! file without changing its length is not noticed.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::SourceFile;

/// Contents of the tuning file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningRecommendation {
    pub batch_size: usize,
    pub workers: usize,
    pub chunk_size: usize,
    pub overlap: usize,
    pub dataset_hash: String,
    /// ISO-8601 UTC.
    pub generated_at: String,
    #[serde(default)]
    pub throughput_chunks_per_s: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_batch_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median_batch_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95_batch_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stddev_batch_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_days_previous: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_retune: Option<bool>,
}

impl TuningRecommendation {
    /// Days since `generated_at`, if it parses.
    pub fn age_days(&self, now: chrono::DateTime<chrono::Utc>) -> Option<f64> {
        let generated = chrono::DateTime::parse_from_rfc3339(&self.generated_at).ok()?;
        let secs = (now - generated.with_timezone(&chrono::Utc)).num_seconds();
        Some(secs as f64 / 86_400.0)
    }

    /// One-paragraph human description for `vfold metrics`.
    pub fn describe(&self, now: chrono::DateTime<chrono::Utc>) -> String {
        let age = self
            .age_days(now)
            .map(|d| format!("{:.2}", d))
            .unwrap_or_else(|| "n/a".to_string());
        let mut out = format!(
            "Tuning recommendation:\n  batch_size={} workers={} chunk_size={} overlap={} generated_at={} age_days={}\n",
            self.batch_size, self.workers, self.chunk_size, self.overlap, self.generated_at, age
        );
        let mut details = vec![
            format!("throughput_chunks_per_s={}", self.throughput_chunks_per_s),
            format!("dataset_hash={}", self.dataset_hash),
        ];
        if let Some(s) = self.sample {
            details.push(format!("sample={}", s));
        }
        if let Some(s) = &self.strategy {
            details.push(format!("strategy={}", s));
        }
        if let Some(r) = &self.run_id {
            details.push(format!("run_id={}", r));
        }
        if let Some(a) = self.age_days_previous {
            details.push(format!("age_days_previous={}", a));
        }
        if let Some(f) = self.force_retune {
            details.push(format!("force_retune={}", f));
        }
        out.push_str(&format!("  details: {}\n", details.join(" ")));
        out
    }
}

/// SHA-256 over each file's path and decimal byte length (in path
/// order), then `chunk_size={c};overlap={o}`. Lower-case hex.
pub fn dataset_signature(files: &[SourceFile], chunk_size: usize, overlap: usize) -> String {
    let mut ordered: Vec<&SourceFile> = files.iter().collect();
    ordered.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for file in ordered {
        hasher.update(file.path.display().to_string().as_bytes());
        hasher.update(file.byte_len.to_string().as_bytes());
    }
    hasher.update(format!("chunk_size={};overlap={}", chunk_size, overlap).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `Ok(None)` when the file does not exist.
pub fn load_recommendation(path: &Path) -> Result<Option<TuningRecommendation>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read tuning file: {}", path.display()))
        }
    };
    let rec = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse tuning file: {}", path.display()))?;
    Ok(Some(rec))
}

pub fn write_recommendation(path: &Path, rec: &TuningRecommendation) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let body = serde_json::to_string_pretty(rec)?;
    std::fs::write(path, body)
        .with_context(|| format!("Failed to write tuning file: {}", path.display()))
}

// ============ Advisor ============

/// What the caller wants to run with, and which values it insists on.
#[derive(Debug, Clone)]
pub struct TuningRequest<'a> {
    pub enabled: bool,
    pub tuning_file: &'a Path,
    pub files: &'a [SourceFile],
    pub chunk_size: usize,
    pub overlap: usize,
    pub batch_size: usize,
    pub workers: usize,
    pub batch_size_pinned: bool,
    pub workers_pinned: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TuningOutcome {
    /// Tuning disabled, or every tunable value pinned.
    Skipped,
    /// No tuning file.
    Missing,
    /// The tuning file could not be read or parsed.
    Invalid(String),
    HashMismatch { recorded: String, current: String },
    Applied,
}

impl fmt::Display for TuningOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuningOutcome::Skipped => write!(f, "skipped"),
            TuningOutcome::Missing => write!(f, "no tuning file"),
            TuningOutcome::Invalid(e) => write!(f, "invalid tuning file ({})", e),
            TuningOutcome::HashMismatch { .. } => write!(f, "dataset changed; defaults kept"),
            TuningOutcome::Applied => write!(f, "applied"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDrift {
    pub name: &'static str,
    pub recorded: usize,
    pub current: usize,
    /// `|current - recorded| / recorded`; infinite when recorded is 0.
    pub relative: f64,
    pub exceeded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    pub threshold: f64,
    pub params: Vec<ParamDrift>,
}

impl DriftReport {
    pub fn retune_suggested(&self) -> bool {
        self.params.iter().any(|p| p.exceeded)
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                format!(
                    "{} {} -> {} ({:+.1}%)",
                    p.name,
                    p.recorded,
                    p.current,
                    signed_pct(p.recorded, p.current)
                )
            })
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

fn signed_pct(recorded: usize, current: usize) -> f64 {
    if recorded == 0 {
        return if current == 0 { 0.0 } else { f64::INFINITY };
    }
    (current as f64 - recorded as f64) / recorded as f64 * 100.0
}

fn relative_change(recorded: usize, current: usize) -> f64 {
    if recorded == 0 {
        return if current == 0 { 0.0 } else { f64::INFINITY };
    }
    (current as f64 - recorded as f64).abs() / recorded as f64
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuningDecision {
    pub batch_size: usize,
    pub workers: usize,
    pub outcome: TuningOutcome,
    /// Present whenever a recommendation was loaded.
    pub drift: Option<DriftReport>,
}

impl TuningDecision {
    pub fn retune_suggested(&self) -> bool {
        self.drift.as_ref().is_some_and(|d| d.retune_suggested())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TuningAdvisor {
    pub threshold: f64,
}

impl Default for TuningAdvisor {
    fn default() -> Self {
        Self { threshold: 0.10 }
    }
}

impl TuningAdvisor {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn drift(&self, rec: &TuningRecommendation, chunk_size: usize, overlap: usize) -> DriftReport {
        let params = [
            ("chunk_size", rec.chunk_size, chunk_size),
            ("overlap", rec.overlap, overlap),
        ]
        .into_iter()
        .map(|(name, recorded, current)| {
            let relative = relative_change(recorded, current);
            ParamDrift {
                name,
                recorded,
                current,
                relative,
                exceeded: relative > self.threshold,
            }
        })
        .collect();
        DriftReport {
            threshold: self.threshold,
            params,
        }
    }

    pub fn advise(&self, req: &TuningRequest<'_>) -> TuningDecision {
        let mut decision = TuningDecision {
            batch_size: req.batch_size,
            workers: req.workers,
            outcome: TuningOutcome::Skipped,
            drift: None,
        };

        if !req.enabled {
            return decision;
        }

        let rec = match load_recommendation(req.tuning_file) {
            Ok(Some(rec)) => rec,
            Ok(None) => {
                if !(req.batch_size_pinned && req.workers_pinned) {
                    decision.outcome = TuningOutcome::Missing;
                }
                return decision;
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "ignoring tuning file");
                if !(req.batch_size_pinned && req.workers_pinned) {
                    decision.outcome = TuningOutcome::Invalid(format!("{:#}", e));
                }
                return decision;
            }
        };

        let drift = self.drift(&rec, req.chunk_size, req.overlap);
        if drift.retune_suggested() {
            tracing::warn!(
                drift = %drift,
                threshold = self.threshold,
                "chunking parameters drifted from calibration; consider `vfold calibrate`"
            );
        }
        decision.drift = Some(drift);

        if req.batch_size_pinned && req.workers_pinned {
            return decision;
        }

        let current = dataset_signature(req.files, req.chunk_size, req.overlap);
        if current != rec.dataset_hash {
            tracing::info!(
                recorded = %rec.dataset_hash,
                current = %current,
                "tuning recommendation does not match this dataset"
            );
            decision.outcome = TuningOutcome::HashMismatch {
                recorded: rec.dataset_hash,
                current,
            };
            return decision;
        }

        if !req.batch_size_pinned && rec.batch_size > 0 {
            decision.batch_size = rec.batch_size;
        }
        if !req.workers_pinned && rec.workers > 0 {
            decision.workers = rec.workers;
        }
        tracing::info!(
            batch_size = decision.batch_size,
            workers = decision.workers,
            "applied tuning recommendation"
        );
        decision.outcome = TuningOutcome::Applied;
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn files() -> Vec<SourceFile> {
        vec![
            SourceFile {
                path: PathBuf::from("/lib/b.txt"),
                rel_path: "b.txt".into(),
                extension: ".txt".into(),
                byte_len: 10,
            },
            SourceFile {
                path: PathBuf::from("/lib/a.txt"),
                rel_path: "a.txt".into(),
                extension: ".txt".into(),
                byte_len: 2048,
            },
        ]
    }

    fn rec(files: &[SourceFile], chunk_size: usize, overlap: usize) -> TuningRecommendation {
        TuningRecommendation {
            batch_size: 16,
            workers: 6,
            chunk_size,
            overlap,
            dataset_hash: dataset_signature(files, chunk_size, overlap),
            generated_at: "2026-01-01T00:00:00Z".into(),
            throughput_chunks_per_s: 42.0,
            mean_batch_ms: None,
            median_batch_ms: None,
            p95_batch_ms: None,
            stddev_batch_ms: None,
            sample: Some(100),
            strategy: Some("throughput_then_stability".into()),
            run_id: None,
            age_days_previous: None,
            force_retune: None,
        }
    }

    fn request<'a>(path: &'a Path, files: &'a [SourceFile], chunk_size: usize) -> TuningRequest<'a> {
        TuningRequest {
            enabled: true,
            tuning_file: path,
            files,
            chunk_size,
            overlap: 200,
            batch_size: 32,
            workers: 4,
            batch_size_pinned: false,
            workers_pinned: false,
        }
    }

    #[test]
    fn signature_is_order_independent_and_parameter_sensitive() {
        let f = files();
        let mut reversed = f.clone();
        reversed.reverse();
        assert_eq!(dataset_signature(&f, 2000, 200), dataset_signature(&reversed, 2000, 200));
        assert_ne!(dataset_signature(&f, 2000, 200), dataset_signature(&f, 2000, 201));

        let mut grown = f.clone();
        grown[0].byte_len += 1;
        assert_ne!(dataset_signature(&f, 2000, 200), dataset_signature(&grown, 2000, 200));
    }

    #[test]
    fn drift_threshold_boundaries() {
        let advisor = TuningAdvisor::default();
        let r = rec(&files(), 2000, 200);
        assert!(advisor.drift(&r, 2400, 200).retune_suggested());
        assert!(!advisor.drift(&r, 2100, 200).retune_suggested());
        assert!(!advisor.drift(&r, 2000, 200).retune_suggested());
        assert!(advisor.drift(&r, 2000, 230).retune_suggested());
    }

    #[test]
    fn applies_matching_recommendation() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tuning.json");
        let f = files();
        write_recommendation(&path, &rec(&f, 2000, 200)).unwrap();

        let decision = TuningAdvisor::default().advise(&request(&path, &f, 2000));
        assert_eq!(decision.outcome, TuningOutcome::Applied);
        assert_eq!((decision.batch_size, decision.workers), (16, 6));
        assert!(!decision.retune_suggested());
    }

    #[test]
    fn pinned_values_survive() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tuning.json");
        let f = files();
        write_recommendation(&path, &rec(&f, 2000, 200)).unwrap();

        let mut req = request(&path, &f, 2000);
        req.batch_size_pinned = true;
        let decision = TuningAdvisor::default().advise(&req);
        assert_eq!(decision.outcome, TuningOutcome::Applied);
        assert_eq!((decision.batch_size, decision.workers), (32, 6));

        req.workers_pinned = true;
        let decision = TuningAdvisor::default().advise(&req);
        assert_eq!(decision.outcome, TuningOutcome::Skipped);
        assert_eq!((decision.batch_size, decision.workers), (32, 4));
        assert!(decision.drift.is_some());
    }

    #[test]
    fn changed_chunking_is_mismatch_and_drift() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tuning.json");
        let f = files();
        write_recommendation(&path, &rec(&f, 2000, 200)).unwrap();

        let decision = TuningAdvisor::default().advise(&request(&path, &f, 2400));
        assert!(matches!(decision.outcome, TuningOutcome::HashMismatch { .. }));
        assert_eq!((decision.batch_size, decision.workers), (32, 4));
        assert!(decision.retune_suggested());

        let decision = TuningAdvisor::default().advise(&request(&path, &f, 2100));
        assert!(matches!(decision.outcome, TuningOutcome::HashMismatch { .. }));
        assert!(!decision.retune_suggested());
    }

    #[test]
    fn missing_and_invalid_files() {
        let tmp = TempDir::new().unwrap();
        let f = files();
        let missing = tmp.path().join("none.json");
        let d = TuningAdvisor::default().advise(&request(&missing, &f, 2000));
        assert_eq!(d.outcome, TuningOutcome::Missing);

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, "{\"batch_size\": \"lots\"}").unwrap();
        let d = TuningAdvisor::default().advise(&request(&bad, &f, 2000));
        assert!(matches!(d.outcome, TuningOutcome::Invalid(_)));
        assert_eq!(d.batch_size, 32);
    }

    #[test]
    fn disabled_never_reads() {
        let f = files();
        let mut req = request(Path::new("/nonexistent/tuning.json"), &f, 2000);
        req.enabled = false;
        let d = TuningAdvisor::default().advise(&req);
        assert_eq!(d.outcome, TuningOutcome::Skipped);
        assert!(d.drift.is_none());
    }

    #[test]
    fn reads_files_with_unknown_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.json");
        std::fs::write(
            &path,
            r#"{"batch_size":8,"workers":2,"chunk_size":2500,"overlap":200,
                "dataset_hash":"abc","generated_at":"2026-01-01T00:00:00Z",
                "throughput_chunks_per_s":3.5,"success":true,"median_batch_ms":120.0}"#,
        )
        .unwrap();
        let r = load_recommendation(&path).unwrap().unwrap();
        assert_eq!(r.batch_size, 8);
        assert_eq!(r.median_batch_ms, Some(120.0));

        let now = chrono::DateTime::parse_from_rfc3339("2026-01-03T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(r.age_days(now), Some(2.0));
        assert!(r.describe(now).contains("batch_size=8"));
    }
}
