use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use vectorfold::cache::{CacheStatus, DedupCache};
use vectorfold::config::Config;
use vectorfold::embedding::EmbeddingProvider;
use vectorfold::error::EmbedError;
use vectorfold::ingest::{IngestOptions, IngestStage, IngestionDriver};
use vectorfold::models::{Point, ScoredPoint};
use vectorfold::progress::{ProgressEvent, ProgressReporter};
use vectorfold::vector_store::{InMemoryStore, VectorStore};

const DIMS: usize = 4;

/// Deterministic provider that rejects any batch containing `FAIL`.
#[derive(Default)]
struct ScriptedProvider {
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if texts.iter().any(|t| t.contains("FAIL")) {
            return Err(EmbedError::Rejected {
                status: 400,
                body: "input rejected".to_string(),
            });
        }
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, 1.0, 0.0, 0.5])
            .collect())
    }
}

/// Answers every batch containing `FAIL` with a retryable 503.
#[derive(Default)]
struct UnavailableProvider {
    ok_calls: AtomicUsize,
    failing_calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for UnavailableProvider {
    fn model_name(&self) -> &str {
        "unavailable"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.iter().any(|t| t.contains("FAIL")) {
            self.failing_calls.fetch_add(1, Ordering::SeqCst);
            return Err(EmbedError::from_status(503, "overloaded".to_string()));
        }
        self.ok_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
    }
}

/// Fails the first `fail_first` upserts, then delegates.
struct FlakyStore {
    inner: InMemoryStore,
    fail_first: AtomicUsize,
}

#[async_trait]
impl VectorStore for FlakyStore {
    fn backend(&self) -> &str {
        "flaky"
    }

    async fn ensure_collection(&self, name: &str, dim: usize) -> anyhow::Result<()> {
        self.inner.ensure_collection(name, dim).await
    }

    async fn recreate_collection(&self, name: &str, dim: usize) -> anyhow::Result<()> {
        self.inner.recreate_collection(name, dim).await
    }

    async fn upsert(&self, collection: &str, points: &[Point]) -> anyhow::Result<()> {
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("store unavailable");
        }
        self.inner.upsert(collection, points).await
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
    ) -> anyhow::Result<Vec<ScoredPoint>> {
        self.inner.search(collection, vector, k).await
    }

    async fn count(&self, collection: &str) -> anyhow::Result<u64> {
        self.inner.count(collection).await
    }
}

#[derive(Default)]
struct RecordingProgress {
    stages: Mutex<Vec<IngestStage>>,
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        if let ProgressEvent::Stage { stage } = event {
            self.stages.lock().unwrap().push(stage);
        }
    }
}

struct Env {
    _tmp: TempDir,
    root: PathBuf,
    work: PathBuf,
}

fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let work = tmp.path().to_path_buf();
    let root = work.join("library");
    fs::create_dir_all(&root).unwrap();
    Env {
        _tmp: tmp,
        root,
        work,
    }
}

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.embedding.retry_backoff_ms = 1;
    cfg.embedding.max_retries = 1;
    cfg.tuning.enabled = false;
    cfg.ingest.collection = "test_lib".to_string();
    cfg
}

fn options(env: &Env, cfg: &Config) -> IngestOptions {
    let mut o = IngestOptions::from_config(&env.root, cfg);
    o.cache_dir = Some(env.work.join("cache"));
    o.batch_size = 2;
    o.batch_size_pinned = true;
    o.embed_workers = 3;
    o
}

fn driver(
    options: IngestOptions,
    cfg: &Config,
    provider: &Arc<ScriptedProvider>,
    store: Arc<dyn VectorStore>,
) -> IngestionDriver {
    IngestionDriver::new(options, cfg)
        .with_provider(provider.clone())
        .with_store(store)
}

fn book_text() -> String {
    // 4500 chars: windows at 0, 1800 and 3600 with the default 2000/200.
    "lorem ipsum ".repeat(375)
}

#[tokio::test]
async fn failed_batch_is_counted_and_others_are_stored() {
    let env = setup();
    for i in 0..10 {
        let body = if i == 4 {
            "this one will FAIL to embed".to_string()
        } else {
            format!("document number {} with enough words", i)
        };
        fs::write(env.root.join(format!("f{:02}.txt", i)), body).unwrap();
    }

    let cfg = config();
    let provider = Arc::new(ScriptedProvider::default());
    let store = Arc::new(InMemoryStore::new());

    let mut d = driver(options(&env, &cfg), &cfg, &provider, store.clone());
    let report = d.run().await.unwrap();

    assert_eq!(d.stage(), IngestStage::Done);
    assert_eq!(report.stage, IngestStage::Done);
    assert_eq!(report.files_found, 10);
    assert_eq!(report.chunks_total, 10);
    assert_eq!(report.batches_total, 5);
    assert_eq!(report.batches_failed, 1);
    // The third batch holds f04 and f05.
    assert_eq!(report.chunks_failed, 2);
    assert_eq!(report.chunks_embedded, 8);
    assert_eq!(store.count("test_lib").await.unwrap(), 8);

    // Only the failed chunks are attempted again.
    let retry_provider = Arc::new(ScriptedProvider::default());
    let mut d = driver(options(&env, &cfg), &cfg, &retry_provider, store.clone());
    let report = d.run().await.unwrap();
    assert_eq!(report.chunks_cached, 8);
    assert_eq!(report.chunks_pending, 2);
    assert_eq!(report.chunks_failed, 2);
    assert_eq!(retry_provider.calls(), 1);
}

#[tokio::test]
async fn batch_that_exhausts_retries_fails_alone() {
    let env = setup();
    for i in 0..10 {
        let body = if i == 4 {
            "the service will FAIL on this one".to_string()
        } else {
            format!("document number {} with enough words", i)
        };
        fs::write(env.root.join(format!("f{:02}.txt", i)), body).unwrap();
    }

    let mut cfg = config();
    cfg.embedding.max_retries = 2;
    cfg.embedding.retry_backoff_ms = 1;
    let provider = Arc::new(UnavailableProvider::default());
    let store = Arc::new(InMemoryStore::new());

    let report = IngestionDriver::new(options(&env, &cfg), &cfg)
        .with_provider(provider.clone())
        .with_store(store.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.stage, IngestStage::Done);
    assert_eq!(report.batches_total, 5);
    assert_eq!(report.batches_failed, 1);
    // The third batch holds f04 and f05.
    assert_eq!(report.chunks_failed, 2);
    assert_eq!(report.chunks_embedded, 8);
    assert_eq!(provider.failing_calls.load(Ordering::SeqCst), 3);
    assert_eq!(provider.ok_calls.load(Ordering::SeqCst), 4);

    let mut stored: Vec<String> = store
        .ids("test_lib")
        .iter()
        .filter_map(|id| store.payload("test_lib", id))
        .map(|p| p["rel_path"].as_str().unwrap_or_default().to_string())
        .collect();
    stored.sort();
    let expected: Vec<String> = [0, 1, 2, 3, 6, 7, 8, 9]
        .iter()
        .map(|i| format!("f{:02}.txt", i))
        .collect();
    assert_eq!(stored, expected);
    assert_eq!(report.cache_ids, 8);
}

#[tokio::test]
async fn rerun_over_unchanged_folder_embeds_nothing() {
    let env = setup();
    fs::write(env.root.join("book.txt"), book_text()).unwrap();

    let cfg = config();
    let store = Arc::new(InMemoryStore::new());
    let progress = Arc::new(RecordingProgress::default());

    let first = Arc::new(ScriptedProvider::default());
    let mut d = driver(options(&env, &cfg), &cfg, &first, store.clone())
        .with_progress(progress.clone());
    let report = d.run().await.unwrap();
    assert_eq!(report.chunks_total, 3);
    assert_eq!(report.chunks_embedded, 3);
    assert_eq!(report.failures(), 0);
    assert_eq!(report.cache_ids, 3);
    assert_eq!(
        *progress.stages.lock().unwrap(),
        vec![
            IngestStage::Scanning,
            IngestStage::Parsing,
            IngestStage::Chunking,
            IngestStage::Embedding,
            IngestStage::Upserting,
            IngestStage::Persisting,
            IngestStage::Done,
        ]
    );

    let second = Arc::new(ScriptedProvider::default());
    let mut d = driver(options(&env, &cfg), &cfg, &second, store.clone());
    let report = d.run().await.unwrap();
    assert_eq!(report.chunks_cached, 3);
    assert_eq!(report.chunks_embedded, 0);
    assert_eq!(second.calls(), 0);
    assert_eq!(store.count("test_lib").await.unwrap(), 3);
}

#[tokio::test]
async fn without_cache_upserts_overwrite_by_id() {
    let env = setup();
    fs::write(env.root.join("book.txt"), book_text()).unwrap();

    let cfg = config();
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(ScriptedProvider::default());

    for _ in 0..2 {
        let mut o = options(&env, &cfg);
        o.use_cache = false;
        let report = driver(o, &cfg, &provider, store.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(report.chunks_embedded, 3);
        assert_eq!(report.cache_status, CacheStatus::Disabled);
    }
    let ids = store.ids("test_lib");
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| uuid::Uuid::parse_str(id).is_ok()));

    let payload = store.payload("test_lib", &ids[0]).unwrap();
    assert_eq!(payload["rel_path"], "book.txt");
    assert_eq!(payload["ext"], ".txt");
}

#[tokio::test]
async fn corrupt_cache_is_treated_as_empty_and_rewritten() {
    let env = setup();
    fs::write(env.root.join("book.txt"), book_text()).unwrap();

    let cfg = config();
    let manifest = DedupCache::manifest_path(&env.work.join("cache"), "test_lib");
    fs::create_dir_all(manifest.parent().unwrap()).unwrap();
    fs::write(&manifest, "{ not json").unwrap();

    let provider = Arc::new(ScriptedProvider::default());
    let store = Arc::new(InMemoryStore::new());
    let report = driver(options(&env, &cfg), &cfg, &provider, store)
        .run()
        .await
        .unwrap();

    assert_eq!(report.cache_status, CacheStatus::Corrupt);
    assert_eq!(report.chunks_embedded, 3);
    let saved: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&manifest).unwrap()).unwrap();
    assert_eq!(saved["ids"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn failed_upsert_slice_is_not_cached() {
    let env = setup();
    fs::write(env.root.join("book.txt"), book_text()).unwrap();

    let cfg = config();
    let provider = Arc::new(ScriptedProvider::default());
    let store = Arc::new(FlakyStore {
        inner: InMemoryStore::new(),
        fail_first: AtomicUsize::new(1),
    });

    let mut o = options(&env, &cfg);
    o.batch_size = 4;
    o.upsert_batch_size = 1;
    let report = driver(o, &cfg, &provider, store.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(report.upserts_failed, 1);
    assert_eq!(report.chunks_upsert_failed, 1);
    assert_eq!(report.chunks_embedded, 2);
    assert_eq!(report.cache_ids, 2);

    let mut o = options(&env, &cfg);
    o.upsert_batch_size = 1;
    let report = driver(o, &cfg, &provider, store.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(report.chunks_cached, 2);
    assert_eq!(report.chunks_embedded, 1);
    assert_eq!(store.count("test_lib").await.unwrap(), 3);
}

#[tokio::test]
async fn dry_run_projects_counts_without_services() {
    let env = setup();
    fs::write(env.root.join("book.txt"), book_text()).unwrap();
    fs::write(env.root.join("notes.md"), "# Notes\n\nShort but long enough.").unwrap();

    // No provider or store injected and no credentials: a live run would fail.
    let mut cfg = config();
    cfg.embedding.provider = "gemini".to_string();
    let mut o = options(&env, &cfg);
    o.dry_run = true;

    let mut d = IngestionDriver::new(o, &cfg);
    let report = d.run().await.unwrap();
    assert_eq!(d.stage(), IngestStage::Done);
    assert_eq!(
        report.projected,
        vec![("book.txt".to_string(), 3), ("notes.md".to_string(), 1)]
    );
    assert_eq!(report.chunks_pending, 4);
    assert_eq!(report.chunks_embedded, 0);
    assert!(!DedupCache::manifest_path(&env.work.join("cache"), "test_lib").exists());
    assert!(report.to_string().starts_with("[dry run] 2 files, 4 chunks"));
}

#[tokio::test]
async fn parsed_text_sidecars_are_written() {
    let env = setup();
    fs::write(env.root.join("notes.md"), "# Notes\n\nShort but long enough.").unwrap();
    fs::create_dir_all(env.root.join("sub")).unwrap();
    fs::write(env.root.join("sub/plan.txt"), "The plan has several steps.").unwrap();

    let cfg = config();
    let provider = Arc::new(ScriptedProvider::default());
    let mut o = options(&env, &cfg);
    o.write_parsed = true;
    o.parsed_dir = Some(env.work.join("parsed"));

    let report = driver(o, &cfg, &provider, Arc::new(InMemoryStore::new()))
        .run()
        .await
        .unwrap();
    assert_eq!(report.sidecar_failures, 0);
    assert_eq!(
        fs::read_to_string(env.work.join("parsed/notes.txt")).unwrap(),
        "# Notes\n\nShort but long enough."
    );
    assert!(env.work.join("parsed/plan.txt").exists());
}

#[tokio::test]
async fn unparseable_file_is_reported_not_fatal() {
    let env = setup();
    fs::write(env.root.join("good.txt"), "A perfectly readable document.").unwrap();
    fs::write(env.root.join("broken.pdf"), "this is not a pdf at all").unwrap();

    let cfg = config();
    let provider = Arc::new(ScriptedProvider::default());
    let report = driver(
        options(&env, &cfg),
        &cfg,
        &provider,
        Arc::new(InMemoryStore::new()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.stage, IngestStage::Done);
    assert_eq!(report.files_found, 2);
    assert_eq!(report.parse_failures.len(), 1);
    assert!(report.parse_failures[0].path.ends_with("broken.pdf"));
    assert_eq!(report.chunks_embedded, 1);
}

#[tokio::test]
async fn disabled_provider_is_a_fatal_precondition() {
    let env = setup();
    fs::write(env.root.join("book.txt"), book_text()).unwrap();

    let mut cfg = config();
    cfg.embedding.provider = "disabled".to_string();
    let mut d = IngestionDriver::new(options(&env, &cfg), &cfg)
        .with_store(Arc::new(InMemoryStore::new()));
    let err = d.run().await.unwrap_err();
    assert!(err.to_string().contains("disabled"));
    assert_eq!(d.stage(), IngestStage::Failed);
}

#[tokio::test]
async fn tuning_file_sets_batch_size_when_unpinned() {
    let env = setup();
    fs::write(env.root.join("book.txt"), book_text()).unwrap();

    let mut cfg = config();
    cfg.tuning.enabled = true;
    cfg.tuning.file = env.work.join("tuning.json");

    // Signature over the canonical paths the driver will see.
    let root = fs::canonicalize(&env.root).unwrap();
    let files = vectorfold::scanner::gather_files(
        &root,
        &vectorfold::extract::ExtractorRegistry::with_defaults(),
        &Default::default(),
    )
    .unwrap();
    let rec = vectorfold::tuning::TuningRecommendation {
        batch_size: 1,
        workers: 2,
        chunk_size: 2000,
        overlap: 200,
        dataset_hash: vectorfold::tuning::dataset_signature(&files, 2000, 200),
        generated_at: "2026-01-01T00:00:00Z".to_string(),
        throughput_chunks_per_s: 10.0,
        mean_batch_ms: None,
        median_batch_ms: None,
        p95_batch_ms: None,
        stddev_batch_ms: None,
        sample: None,
        strategy: None,
        run_id: None,
        age_days_previous: None,
        force_retune: None,
    };
    vectorfold::tuning::write_recommendation(&cfg.tuning.file, &rec).unwrap();

    let provider = Arc::new(ScriptedProvider::default());
    let mut o = options(&env, &cfg);
    o.batch_size_pinned = false;
    let report = driver(o, &cfg, &provider, Arc::new(InMemoryStore::new()))
        .run()
        .await
        .unwrap();
    assert_eq!(report.batch_size, 1);
    assert_eq!(report.embed_workers, 2);
    assert_eq!(report.batches_total, 3);
    assert_eq!(provider.calls(), 3);
}
