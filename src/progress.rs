//! Ingest progress reporting.
//!
//! Reports observable progress during `vfold ingest` so users see which
//! stage the run is in and how much is left. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use crate::ingest::IngestStage;

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The driver entered a new stage.
    Stage { stage: IngestStage },
    /// `n` of `total` units of the stage's work are done.
    Advance {
        stage: IngestStage,
        n: u64,
        total: u64,
    },
}

/// Reports ingest progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the ingest pipeline.
    fn report(&self, event: ProgressEvent);
}

/// Unit of work counted in [`ProgressEvent::Advance`] for a stage.
fn unit(stage: IngestStage) -> &'static str {
    match stage {
        IngestStage::Parsing => "files",
        IngestStage::Upserting => "points",
        _ => "chunks",
    }
}

/// Human-friendly progress on stderr: "ingest  embedding  1,234 / 5,000 chunks".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Stage { stage } => format!("ingest  {}...\n", stage),
            ProgressEvent::Advance { stage, n, total } => format!(
                "ingest  {}  {} / {} {}\n",
                stage,
                format_number(*n),
                format_number(*total),
                unit(*stage)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Stage { stage } => serde_json::json!({
                "event": "progress",
                "stage": stage.to_string(),
            }),
            ProgressEvent::Advance { stage, n, total } => serde_json::json!({
                "event": "progress",
                "stage": stage.to_string(),
                "n": n,
                "total": total,
                "unit": unit(*stage),
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Whether the `n`-th of `total` items is worth a progress line
/// (roughly every 5%, plus the last one).
pub fn is_milestone(n: u64, total: u64) -> bool {
    let step = (total / 20).max(1);
    n == total || n % step == 0
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
