//! JSONL metrics streams and their summary report.
//!
//! Each stream is an append-only file of JSON objects under the metrics
//! directory, `<stream>.jsonl` (or `<stream>-YYYYMMDD.jsonl` with daily
//! rotation). Every record carries `ts` (RFC 3339, UTC) and `event`; timed
//! events add `duration_ms`, counters add `value`.
//!
//! Writes report errors to the caller. The pipeline logs them and keeps
//! going, so a full disk degrades observability rather than the run.
//!
//! # Streams
//!
//! | Stream | Events |
//! |--------|--------|
//! | `ingest` | `ingest:start`, `ingest:end`, `ingest:failed`, `file_failed`, `batch_failed`, `upsert_failed` |
//! | `embed` | `embed_batch` (`duration_ms`, `status`, `attempts`, `size`) |
//! | `calibrate` | `start`, `embed_batch`, `result`, `end`, `recommendation` |

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Destination for metric records.
pub trait MetricsSink: Send + Sync {
    /// Append one record. `fields` should be a JSON object; anything else
    /// is stored under a `value` key.
    fn record(&self, stream: &str, event: &str, fields: Value) -> Result<()>;
}

/// Discards everything. Used when metrics are disabled and in tests.
pub struct NoMetrics;

impl MetricsSink for NoMetrics {
    fn record(&self, _stream: &str, _event: &str, _fields: Value) -> Result<()> {
        Ok(())
    }
}

/// Appends records to per-stream JSONL files.
pub struct JsonlMetrics {
    dir: PathBuf,
    rotate_daily: bool,
    lock: Mutex<()>,
}

impl JsonlMetrics {
    pub fn new(dir: impl Into<PathBuf>, rotate_daily: bool) -> Self {
        Self {
            dir: dir.into(),
            rotate_daily,
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, stream: &str) -> PathBuf {
        let safe = stream.replace('/', "_");
        if self.rotate_daily {
            let date = Utc::now().format("%Y%m%d");
            self.dir.join(format!("{}-{}.jsonl", safe, date))
        } else {
            self.dir.join(format!("{}.jsonl", safe))
        }
    }
}

impl MetricsSink for JsonlMetrics {
    fn record(&self, stream: &str, event: &str, fields: Value) -> Result<()> {
        let mut record = Map::new();
        record.insert("ts".to_string(), Value::String(Utc::now().to_rfc3339()));
        record.insert("event".to_string(), Value::String(event.to_string()));
        match fields {
            Value::Object(map) => record.extend(map),
            Value::Null => {}
            other => {
                record.insert("value".to_string(), other);
            }
        }
        let line = serde_json::to_string(&Value::Object(record))?;

        let path = self.file_for(stream);
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("metrics lock poisoned"))?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create metrics dir: {}", self.dir.display()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open metrics file: {}", path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// Record and log-on-failure. Metrics never interrupt the caller.
pub fn emit(sink: &dyn MetricsSink, stream: &str, event: &str, fields: Value) {
    if let Err(e) = sink.record(stream, event, fields) {
        tracing::warn!(stream, event, error = %e, "metrics write failed");
    }
}

/// Record a timed event with `duration_ms` rounded to microseconds.
pub fn emit_latency(
    sink: &dyn MetricsSink,
    stream: &str,
    event: &str,
    elapsed: Duration,
    fields: Value,
) {
    let mut fields = match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let ms = (elapsed.as_secs_f64() * 1_000_000.0).round() / 1000.0;
    fields.insert("duration_ms".to_string(), serde_json::json!(ms));
    emit(sink, stream, event, Value::Object(fields));
}

// ============ Summary ============

/// Collected durations for one event name.
#[derive(Debug, Default, Clone)]
pub struct StatBucket {
    values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatSummary {
    pub count: usize,
    pub min: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub max: f64,
    pub mean: f64,
}

impl StatBucket {
    pub fn add(&mut self, v: f64) {
        self.values.push(v);
    }

    /// Nearest-rank percentiles (index `floor(p * (n - 1))`), rounded to
    /// two decimals. `None` when empty.
    pub fn summary(&self) -> Option<StatSummary> {
        if self.values.is_empty() {
            return None;
        }
        let mut data = self.values.clone();
        data.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = data.len();
        let pct = |p: f64| data[((p * (n - 1) as f64) as usize).min(n - 1)];
        let mean = data.iter().sum::<f64>() / n as f64;
        Some(StatSummary {
            count: n,
            min: round2(data[0]),
            p50: round2(pct(0.5)),
            p90: round2(pct(0.9)),
            p95: round2(pct(0.95)),
            max: round2(data[n - 1]),
            mean: round2(mean),
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub stream: String,
    pub files: Vec<PathBuf>,
    pub records: usize,
    pub timed: BTreeMap<String, StatSummary>,
    pub counters: BTreeMap<String, i64>,
    pub recent: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SummaryOptions {
    pub since: Option<DateTime<Utc>>,
    /// Number of recent events listed (default 25).
    pub last: Option<usize>,
}

/// Files belonging to `stream`: the plain file and any rotated ones, oldest first.
pub fn stream_files(dir: &Path, stream: &str) -> Vec<PathBuf> {
    let safe = stream.replace('/', "_");
    let rotated_prefix = format!("{}-", safe);
    let mut files: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                let Some(name) = p.file_name().and_then(|n| n.to_str()) else {
                    return false;
                };
                let Some(stem) = name.strip_suffix(".jsonl") else {
                    return false;
                };
                stem == safe
                    || stem
                        .strip_prefix(&rotated_prefix)
                        .is_some_and(|d| d.len() == 8 && d.chars().all(|c| c.is_ascii_digit()))
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    // Rotated files sort by date; the unrotated file goes last.
    files.sort_by_key(|p| {
        let unrotated = p
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s == safe);
        (unrotated, p.clone())
    });
    files
}

/// Parse JSONL records, skipping blank and malformed lines.
pub fn read_records(path: &Path) -> Vec<Value> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .filter(|v| v.is_object())
        .collect()
}

fn record_ts(rec: &Value) -> Option<DateTime<Utc>> {
    rec.get("ts")
        .and_then(|t| t.as_str())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Load and filter the records of one stream.
pub fn load_stream(dir: &Path, stream: &str, since: Option<DateTime<Utc>>) -> Vec<Value> {
    let mut records: Vec<Value> = stream_files(dir, stream)
        .iter()
        .flat_map(|p| read_records(p))
        .collect();
    if let Some(since) = since {
        records.retain(|r| record_ts(r).is_some_and(|ts| ts >= since));
    }
    records
}

pub fn summarize_stream(dir: &Path, stream: &str, options: &SummaryOptions) -> StreamSummary {
    let files = stream_files(dir, stream);
    let records = load_stream(dir, stream, options.since);

    let mut buckets: BTreeMap<String, StatBucket> = BTreeMap::new();
    let mut counters: BTreeMap<String, i64> = BTreeMap::new();

    for rec in &records {
        let Some(event) = rec.get("event").and_then(|e| e.as_str()) else {
            continue;
        };
        if let Some(ms) = rec.get("duration_ms").and_then(|d| d.as_f64()) {
            buckets.entry(event.to_string()).or_default().add(ms);
        }
        if let Some(v) = rec.get("value").and_then(|v| v.as_i64()) {
            *counters.entry(event.to_string()).or_insert(0) += v;
        }
    }

    let tail = options.last.unwrap_or(25);
    let recent = records[records.len().saturating_sub(tail)..].to_vec();

    StreamSummary {
        stream: stream.to_string(),
        files,
        records: records.len(),
        timed: buckets
            .into_iter()
            .filter_map(|(k, b)| b.summary().map(|s| (k, s)))
            .collect(),
        counters,
        recent,
    }
}

impl fmt::Display for StreamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stream: {}", self.stream)?;
        if self.records == 0 {
            return writeln!(f, "  (no data)");
        }
        let files: Vec<String> = self.files.iter().map(|p| p.display().to_string()).collect();
        writeln!(f, "  Records: {}  Files: {}", self.records, files.join(", "))?;

        if !self.timed.is_empty() {
            writeln!(f, "  Timed events:")?;
            for (event, s) in &self.timed {
                writeln!(
                    f,
                    "    - {}: count={} min={} p50={} p90={} p95={} max={} mean={}",
                    event, s.count, s.min, s.p50, s.p90, s.p95, s.max, s.mean
                )?;
            }
        }
        if !self.counters.is_empty() {
            writeln!(f, "  Counter events:")?;
            for (event, total) in &self.counters {
                writeln!(f, "    - {}: total={}", event, total)?;
            }
        }
        if !self.recent.is_empty() {
            writeln!(f, "  Recent events:")?;
            for rec in &self.recent {
                let ts = rec.get("ts").and_then(|v| v.as_str()).unwrap_or("?");
                let event = rec.get("event").and_then(|v| v.as_str()).unwrap_or("?");
                write!(f, "    - {} {}", ts, event)?;
                if let Some(ms) = rec.get("duration_ms").and_then(|v| v.as_f64()) {
                    write!(f, " {:.1}ms", ms)?;
                }
                if let Some(status) = rec.get("status").and_then(|v| v.as_str()) {
                    write!(f, " status={}", status)?;
                }
                if let Some(err) = rec.get("error").and_then(|v| v.as_str()) {
                    write!(f, " error={}", err)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn writes_jsonl_records() {
        let tmp = TempDir::new().unwrap();
        let sink = JsonlMetrics::new(tmp.path().join("m"), false);
        sink.record("ingest", "ingest:start", json!({"files": 3}))
            .unwrap();
        sink.record("ingest", "tick", json!(5)).unwrap();

        let records = read_records(&tmp.path().join("m/ingest.jsonl"));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["event"], "ingest:start");
        assert_eq!(records[0]["files"], 3);
        assert!(records[0]["ts"].as_str().is_some());
        assert_eq!(records[1]["value"], 5);
    }

    #[test]
    fn rotated_file_names() {
        let tmp = TempDir::new().unwrap();
        let sink = JsonlMetrics::new(tmp.path(), true);
        sink.record("embed", "embed_batch", json!({})).unwrap();
        let files = stream_files(tmp.path(), "embed");
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("embed-") && name.ends_with(".jsonl"));
    }

    #[test]
    fn stat_bucket_percentiles() {
        let mut b = StatBucket::default();
        for v in 1..=10 {
            b.add(v as f64);
        }
        let s = b.summary().unwrap();
        assert_eq!(s.count, 10);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.p50, 5.0);
        assert_eq!(s.p90, 9.0);
        assert_eq!(s.p95, 9.0);
        assert_eq!(s.max, 10.0);
        assert_eq!(s.mean, 5.5);
        assert!(StatBucket::default().summary().is_none());
    }

    #[test]
    fn summary_aggregates_timed_and_counters() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("embed.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"ts\":\"2026-01-01T00:00:00+00:00\",\"event\":\"embed_batch\",\"duration_ms\":10.0,\"status\":\"ok\"}\n",
                "not json\n",
                "\n",
                "{\"ts\":\"2026-01-02T00:00:00+00:00\",\"event\":\"embed_batch\",\"duration_ms\":30.0,\"status\":\"error\"}\n",
                "{\"ts\":\"2026-01-03T00:00:00+00:00\",\"event\":\"retry\",\"value\":2}\n",
                "{\"ts\":\"2026-01-04T00:00:00+00:00\",\"event\":\"retry\",\"value\":3}\n",
            ),
        )
        .unwrap();

        let summary = summarize_stream(tmp.path(), "embed", &SummaryOptions::default());
        assert_eq!(summary.records, 4);
        let timed = &summary.timed["embed_batch"];
        assert_eq!(timed.count, 2);
        assert_eq!(timed.mean, 20.0);
        assert_eq!(summary.counters["retry"], 5);
        assert!(summary.to_string().contains("status=error"));

        let since = DateTime::parse_from_rfc3339("2026-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let opts = SummaryOptions {
            since: Some(since),
            last: Some(1),
        };
        let summary = summarize_stream(tmp.path(), "embed", &opts);
        assert_eq!(summary.records, 3);
        assert_eq!(summary.recent.len(), 1);
        assert_eq!(summary.recent[0]["value"], 3);
    }

    #[test]
    fn missing_stream_is_empty() {
        let tmp = TempDir::new().unwrap();
        let summary = summarize_stream(tmp.path(), "nothing", &SummaryOptions::default());
        assert_eq!(summary.records, 0);
        assert!(summary.to_string().contains("(no data)"));
    }
}
