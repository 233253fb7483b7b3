//! # vectorfold CLI (`vfold`)
//!
//! Ingests a folder of documents into a vector collection, calibrates the
//! embedding batch size, searches the result and summarises run metrics.
//!
//! ## Usage
//!
//! ```bash
//! vfold --config ./config/vfold.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vfold ingest <folder>` | Scan, chunk, embed and upsert a folder |
//! | `vfold calibrate <folder>` | Benchmark batch sizes and write the tuning file |
//! | `vfold search "<query>"` | Nearest chunks for a query |
//! | `vfold metrics` | Summarise JSONL metrics streams and the tuning file |
//!
//! ## Examples
//!
//! ```bash
//! # Preview chunk counts without calling any service
//! vfold ingest ./library --dry-run
//!
//! # Book-sized chunks, fresh collection
//! vfold ingest ./library --profile books --recreate
//!
//! # Benchmark four batch sizes with 4 concurrent calls
//! vfold calibrate ./library --batch-sizes 4 8 16 32 --workers 4
//!
//! # Embedding latency percentiles since a date
//! vfold metrics --streams embed --since 2026-01-01
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};

use vectorfold::calibrate::{run_calibration, CalibrateOptions};
use vectorfold::config::{self, Config, Profile};
use vectorfold::embedder::{Embedder, RetryPolicy};
use vectorfold::embedding::create_provider;
use vectorfold::ingest::{IngestOptions, IngestOverrides, IngestionDriver};
use vectorfold::metrics::{
    load_stream, summarize_stream, JsonlMetrics, MetricsSink, NoMetrics, SummaryOptions,
};
use vectorfold::progress::ProgressMode;
use vectorfold::scanner::ScanOptions;
use vectorfold::search::{format_results, search};
use vectorfold::tuning::load_recommendation;
use vectorfold::vector_store::create_store;

/// vectorfold: folder-to-vector-index ingestion.
///
/// All commands accept a `--config` flag pointing to a TOML file. Without
/// it, `./config/vfold.toml` is used if present, otherwise built-in
/// defaults.
#[derive(Parser)]
#[command(
    name = "vfold",
    about = "vectorfold: chunk, embed and index a folder of documents",
    version,
    long_about = "vectorfold walks a folder, extracts text from txt/md/pdf/docx/epub files, \
    splits it into overlapping chunks with deterministic ids, embeds new chunks in concurrent \
    batches and upserts them into Qdrant or a local SQLite index."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a folder into a vector collection.
    ///
    /// Chunks already recorded in the dedup cache are skipped, so re-running
    /// over an unchanged folder embeds nothing. Failed files and batches are
    /// counted in the summary; the command still succeeds.
    Ingest {
        /// Folder to ingest (recursively).
        folder: PathBuf,

        /// Target collection.
        #[arg(long)]
        collection: Option<String>,

        /// Chunk length in characters.
        #[arg(long)]
        max_chars: Option<usize>,

        /// Characters shared by consecutive chunks.
        #[arg(long)]
        overlap: Option<usize>,

        /// Texts per embedding call. Overrides the tuning file.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Points per upsert request.
        #[arg(long)]
        upsert_batch_size: Option<usize>,

        /// Concurrent file parsers.
        #[arg(long)]
        workers: Option<usize>,

        /// Concurrent embedding calls. Overrides the tuning file.
        #[arg(long)]
        embed_workers: Option<usize>,

        /// Preset chunking and concurrency values.
        #[arg(long, value_enum)]
        profile: Option<Profile>,

        /// Show per-file chunk counts without embedding or upserting.
        #[arg(long)]
        dry_run: bool,

        /// Ignore and do not update the dedup cache.
        #[arg(long)]
        no_cache: bool,

        /// Do not consult the tuning file.
        #[arg(long)]
        no_tuning: bool,

        /// Drop and recreate the collection first.
        #[arg(long)]
        recreate: bool,

        /// Write each document's extracted text to `<parsed-dir>/<stem>.txt`.
        #[arg(long)]
        write_parsed: bool,

        /// Sidecar directory (default `<folder>/../parsed_corpus`).
        #[arg(long)]
        parsed_dir: Option<PathBuf>,
    },

    /// Benchmark embedding batch sizes and write a tuning recommendation.
    ///
    /// Nothing is upserted. The best batch size (throughput first, then
    /// latency stability) is written to the tuning file together with the
    /// dataset signature it was measured on.
    Calibrate {
        /// Folder to sample chunks from.
        folder: PathBuf,

        /// Total chunks to embed per candidate.
        #[arg(long, default_value_t = 200)]
        sample: usize,

        #[arg(long)]
        max_chars: Option<usize>,

        #[arg(long)]
        overlap: Option<usize>,

        /// Candidate batch sizes.
        #[arg(long, num_args = 1.., default_values_t = vec![4, 8, 16, 32])]
        batch_sizes: Vec<usize>,

        /// Concurrent embedding calls during the benchmark.
        #[arg(long)]
        workers: Option<usize>,

        /// Where to write the recommendation (default from config).
        #[arg(long)]
        tuning_file: Option<PathBuf>,

        /// Do not read the existing tuning file before overwriting it.
        #[arg(long)]
        force_retune: bool,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search a collection.
    Search {
        /// The search query string.
        query: String,

        #[arg(long)]
        collection: Option<String>,

        /// Number of results.
        #[arg(short, long, default_value_t = 5)]
        k: usize,
    },

    /// Summarise metrics streams and the current tuning recommendation.
    Metrics {
        /// Metrics directory (default from config).
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Streams to summarise.
        #[arg(long, num_args = 1.., default_values_t = vec!["ingest".to_string(), "embed".to_string(), "calibrate".to_string()])]
        streams: Vec<String>,

        /// Only records at or after this time (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        since: Option<String>,

        /// Recent events listed per stream.
        #[arg(long)]
        last: Option<usize>,

        /// Print the filtered records as JSONL instead of a summary.
        #[arg(long)]
        raw: bool,

        /// Only show the tuning recommendation.
        #[arg(long)]
        tuning_only: bool,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn metrics_sink(cfg: &Config) -> Arc<dyn MetricsSink> {
    if cfg.metrics.enabled {
        Arc::new(JsonlMetrics::new(&cfg.metrics.dir, cfg.metrics.rotate_daily))
    } else {
        Arc::new(NoMetrics)
    }
}

fn parse_since(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN).and_utc());
    }
    let ts = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid --since value: {} (expected YYYY-MM-DD or RFC 3339)", s))?;
    Ok(ts.with_timezone(&Utc))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_or_default(cli.config.as_deref())?;
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Ingest {
            folder,
            collection,
            max_chars,
            overlap,
            batch_size,
            upsert_batch_size,
            workers,
            embed_workers,
            profile,
            dry_run,
            no_cache,
            no_tuning,
            recreate,
            write_parsed,
            parsed_dir,
        } => {
            let mut options = IngestOptions::from_config(folder, &cfg);
            options.apply_overrides(&IngestOverrides {
                collection,
                max_chars,
                overlap,
                batch_size,
                upsert_batch_size,
                workers,
                embed_workers,
                profile,
                dry_run,
                no_cache,
                no_tuning,
                recreate,
                write_parsed,
                parsed_dir,
            });

            let mut driver = IngestionDriver::new(options, &cfg)
                .with_metrics(metrics_sink(&cfg))
                .with_progress(progress.reporter());
            let report = driver.run().await?;
            print!("{}", report);
        }

        Commands::Calibrate {
            folder,
            sample,
            max_chars,
            overlap,
            batch_sizes,
            workers,
            tuning_file,
            force_retune,
            json,
        } => {
            if !cfg.embedding.is_enabled() {
                bail!("Calibration requires an embedding provider. Set [embedding].provider in config.");
            }
            let provider = create_provider(&cfg.embedding)?;
            let metrics = metrics_sink(&cfg);
            let embedder = Embedder::new(provider, RetryPolicy::from_config(&cfg.embedding))
                .with_metrics(Arc::clone(&metrics));

            let options = CalibrateOptions {
                root: folder,
                sample,
                max_chars: max_chars.unwrap_or(cfg.chunking.max_chars),
                overlap: overlap.unwrap_or(cfg.chunking.overlap),
                min_content_chars: cfg.chunking.min_content_chars,
                batch_sizes,
                workers: workers.unwrap_or(cfg.ingest.embed_workers),
                parse_workers: cfg.ingest.workers,
                tuning_file: tuning_file.unwrap_or_else(|| cfg.tuning.file.clone()),
                force_retune,
                scan: ScanOptions {
                    exclude_globs: cfg.ingest.exclude_globs.clone(),
                    follow_symlinks: cfg.ingest.follow_symlinks,
                },
            };
            let report = run_calibration(&options, &embedder, metrics).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }
        }

        Commands::Search {
            query,
            collection,
            k,
        } => {
            if !cfg.embedding.is_enabled() {
                bail!("Search requires an embedding provider. Set [embedding].provider in config.");
            }
            let provider = create_provider(&cfg.embedding)?;
            let embedder = Embedder::new(provider, RetryPolicy::from_config(&cfg.embedding))
                .with_metrics(metrics_sink(&cfg));
            let store = create_store(&cfg.vector_store)
                .await
                .context("vector store unavailable")?;
            let collection = collection.unwrap_or_else(|| cfg.ingest.collection.clone());
            let hits = search(&embedder, store.as_ref(), &collection, &query, k).await?;
            print!("{}", format_results(&hits));
        }

        Commands::Metrics {
            dir,
            streams,
            since,
            last,
            raw,
            tuning_only,
        } => {
            let dir = dir.unwrap_or_else(|| cfg.metrics.dir.clone());
            let since = since.as_deref().map(parse_since).transpose()?;

            if !tuning_only {
                for stream in &streams {
                    if raw {
                        for rec in load_stream(&dir, stream, since) {
                            println!("{}", rec);
                        }
                    } else {
                        let summary =
                            summarize_stream(&dir, stream, &SummaryOptions { since, last });
                        print!("{}", summary);
                    }
                }
            }

            if !raw {
                match load_recommendation(&cfg.tuning.file) {
                    Ok(Some(rec)) => print!("{}", rec.describe(Utc::now())),
                    Ok(None) => println!("No tuning file at {}", cfg.tuning.file.display()),
                    Err(e) => println!("Tuning file unreadable: {:#}", e),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_accepts_dates_and_timestamps() {
        let d = parse_since("2026-03-01").unwrap();
        assert_eq!(d.to_rfc3339(), "2026-03-01T00:00:00+00:00");
        let t = parse_since("2026-03-01T12:30:00Z").unwrap();
        assert_eq!(t.to_rfc3339(), "2026-03-01T12:30:00+00:00");
        assert!(parse_since("yesterday").is_err());
    }

    #[test]
    fn cli_parses_ingest_flags() {
        let cli = Cli::parse_from([
            "vfold",
            "ingest",
            "./lib",
            "--profile",
            "books",
            "--dry-run",
            "--batch-size",
            "16",
        ]);
        match cli.command {
            Commands::Ingest {
                profile,
                dry_run,
                batch_size,
                ..
            } => {
                assert_eq!(profile, Some(Profile::Books));
                assert!(dry_run);
                assert_eq!(batch_size, Some(16));
            }
            _ => panic!("expected ingest"),
        }
    }

    #[test]
    fn cli_parses_calibrate_defaults() {
        let cli = Cli::parse_from(["vfold", "calibrate", "./lib"]);
        match cli.command {
            Commands::Calibrate {
                sample,
                batch_sizes,
                ..
            } => {
                assert_eq!(sample, 200);
                assert_eq!(batch_sizes, vec![4, 8, 16, 32]);
            }
            _ => panic!("expected calibrate"),
        }
    }
}
