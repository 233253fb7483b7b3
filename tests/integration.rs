use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    // 4500 characters: three chunks at 2000/200.
    fs::write(files_dir.join("book.txt"), "lorem ipsum ".repeat(375)).unwrap();

    let config_content = format!(
        r#"[embedding]
provider = "hash"
dims = 64
batch_size = 2
retry_backoff_ms = 1

[vector_store]
backend = "sqlite"
path = "{root}/data/vectors.sqlite"

[ingest]
collection = "test_lib"
cache_dir = "{root}/cache"

[tuning]
file = "{root}/config/tuning.json"

[metrics]
dir = "{root}/metrics"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("vfold.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_vfold(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = env!("CARGO_BIN_EXE_vfold");
    let workdir = config_path.parent().and_then(Path::parent).unwrap();
    let output = Command::new(binary)
        .current_dir(workdir)
        .env("RUST_LOG", "warn")
        .arg("--config")
        .arg(config_path)
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run vfold binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files_dir(config_path: &Path) -> String {
    config_path
        .parent()
        .and_then(Path::parent)
        .unwrap()
        .join("files")
        .display()
        .to_string()
}

#[test]
fn test_ingest_embeds_all_chunks() {
    let (_tmp, config_path) = setup_test_env();
    let folder = files_dir(&config_path);

    let (stdout, stderr, success) = run_vfold(&config_path, &["ingest", &folder]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("chunks embedded: 3"), "stdout={}", stdout);
    assert!(stdout.contains("chunks failed: 0"));
    assert!(stdout.contains("collection 'test_lib' (sqlite, model fnv1a-64)"));
}

#[test]
fn test_ingest_rerun_uses_cache() {
    let (tmp, config_path) = setup_test_env();
    let folder = files_dir(&config_path);

    let (_, _, success) = run_vfold(&config_path, &["ingest", &folder]);
    assert!(success);
    assert!(tmp.path().join("cache/test_lib.json").exists());

    let (stdout, stderr, success) = run_vfold(&config_path, &["ingest", &folder]);
    assert!(success, "rerun failed: {}", stderr);
    assert!(stdout.contains("chunks cached: 3"), "stdout={}", stdout);
    assert!(stdout.contains("chunks embedded: 0"));
}

#[test]
fn test_ingest_dry_run_writes_nothing() {
    let (tmp, config_path) = setup_test_env();
    let folder = files_dir(&config_path);

    let (stdout, stderr, success) = run_vfold(&config_path, &["ingest", &folder, "--dry-run"]);
    assert!(success, "dry run failed: {}", stderr);
    assert!(stdout.contains("[dry run] 1 files, 3 chunks"), "stdout={}", stdout);
    assert!(stdout.contains("book.txt :: 3 chunks"));
    assert!(!tmp.path().join("data/vectors.sqlite").exists());
    assert!(!tmp.path().join("cache/test_lib.json").exists());
}

#[test]
fn test_ingest_missing_folder_fails() {
    let (tmp, config_path) = setup_test_env();
    let missing = tmp.path().join("nope").display().to_string();

    let (_, stderr, success) = run_vfold(&config_path, &["ingest", &missing]);
    assert!(!success);
    assert!(stderr.contains("Folder not found"), "stderr={}", stderr);
}

#[test]
fn test_search_after_ingest() {
    let (_tmp, config_path) = setup_test_env();
    let folder = files_dir(&config_path);

    run_vfold(&config_path, &["ingest", &folder]);
    let (stdout, stderr, success) = run_vfold(&config_path, &["search", "lorem ipsum", "-k", "2"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("1. ["), "stdout={}", stdout);
    assert!(stdout.contains("book.txt"));
    assert!(!stdout.contains("3. ["));
}

#[test]
fn test_calibrate_writes_tuning_file() {
    let (tmp, config_path) = setup_test_env();
    let folder = files_dir(&config_path);

    let (stdout, stderr, success) = run_vfold(
        &config_path,
        &["calibrate", &folder, "--sample", "3", "--batch-sizes", "1", "2", "--json"],
    );
    assert!(success, "calibrate failed: {}", stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["sample"], 3);
    assert_eq!(report["results"].as_array().unwrap().len(), 2);

    let tuning: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(tmp.path().join("config/tuning.json")).unwrap())
            .unwrap();
    assert_eq!(tuning["chunk_size"], 2000);
    assert_eq!(tuning["overlap"], 200);
    assert_eq!(tuning["strategy"], "throughput_then_stability");
    assert_eq!(tuning["dataset_hash"].as_str().unwrap().len(), 64);

    // The next ingest over the same folder applies it.
    let (stdout, _, success) = run_vfold(&config_path, &["ingest", &folder]);
    assert!(success);
    assert!(stdout.contains("tuning: applied"), "stdout={}", stdout);
}

#[test]
fn test_metrics_summarises_ingest() {
    let (_tmp, config_path) = setup_test_env();
    let folder = files_dir(&config_path);

    run_vfold(&config_path, &["ingest", &folder]);
    let (stdout, stderr, success) = run_vfold(&config_path, &["metrics", "--streams", "ingest", "embed"]);
    assert!(success, "metrics failed: {}", stderr);
    assert!(stdout.contains("Stream: ingest"));
    assert!(stdout.contains("ingest:end"));
    assert!(stdout.contains("embed_batch: count=2"), "stdout={}", stdout);
    assert!(stdout.contains("No tuning file"));
}
