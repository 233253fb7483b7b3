//! # vectorfold
//!
//! Turns a folder of documents into a searchable vector collection.
//!
//! Files are discovered, parsed into plain text, split into overlapping
//! character windows, embedded in batches by a remote (or offline) model,
//! and upserted into a vector store. Every chunk gets a deterministic UUID,
//! so re-running over an unchanged folder embeds nothing new: a per-
//! collection dedup cache skips known chunks and the store overwrites by id.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ Scanner  │──▶│  Parse   │──▶│  Chunk   │──▶│  Embed   │──▶│  Vector  │
//! │ walkdir  │   │  pool    │   │ + dedup  │   │  pool    │   │  store   │
//! └──────────┘   └──────────┘   └──────────┘   └──────────┘   └──────────┘
//!                                     ▲              │
//!                               tuning file    JSONL metrics
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vfold calibrate ./library --batch-sizes 8 16 32
//! vfold ingest ./library --collection library_v1
//! vfold search "how are chunk ids derived"
//! vfold metrics --streams ingest embed
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and profiles |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors for the embedding, extraction and chunking seams |
//! | [`scanner`] | File discovery and parsing |
//! | [`extract`] | Per-format text extraction (txt/md, pdf, docx, epub) |
//! | [`chunk`] | Overlapping character windows |
//! | [`chunk_id`] | Deterministic chunk UUIDs |
//! | [`cache`] | Per-collection dedup manifest |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embedder`] | Retry, backoff and validation around a provider |
//! | [`coordinator`] | Bounded parse and embed pools |
//! | [`tuning`] | Tuning file, dataset signature, drift detection |
//! | [`calibrate`] | Batch-size benchmarking |
//! | [`vector_store`] | Vector store abstraction (Qdrant, SQLite, memory) |
//! | [`ingest`] | Pipeline driver and run report |
//! | [`search`] | Query embedding and nearest-neighbour search |
//! | [`metrics`] | JSONL metrics streams and summaries |
//! | [`progress`] | Stage and progress reporting on stderr |

pub mod cache;
pub mod calibrate;
pub mod chunk;
pub mod chunk_id;
pub mod config;
pub mod coordinator;
pub mod embedder;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod progress;
pub mod scanner;
pub mod search;
pub mod tuning;
pub mod vector_store;
