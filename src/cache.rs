//! Per-collection dedup cache.
//!
//! A JSON manifest `{"ids": [...]}` at `<cache_dir>/<collection>.json`
//! listing the chunk ids that already reached the vector store. Loading
//! never fails the run: a missing file starts fresh, a corrupt one starts
//! empty, and an unreadable one disables the cache until the run ends.
//!
//! Only the ingestion driver mutates the cache, and only after the upsert
//! carrying those ids succeeded.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How the cache came to be in its current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    Disabled,
    /// No manifest on disk yet.
    Fresh,
    Loaded(usize),
    /// The manifest did not parse; it will be overwritten at flush.
    Corrupt,
    /// The manifest could not be read; caching is off for this run.
    Unavailable(String),
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Disabled => write!(f, "disabled"),
            CacheStatus::Fresh => write!(f, "fresh"),
            CacheStatus::Loaded(n) => write!(f, "loaded ({} ids)", n),
            CacheStatus::Corrupt => write!(f, "corrupt (reset)"),
            CacheStatus::Unavailable(e) => write!(f, "unavailable ({})", e),
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct Manifest {
    ids: Vec<String>,
}

#[derive(Debug)]
pub struct DedupCache {
    path: PathBuf,
    ids: HashSet<String>,
    enabled: bool,
    dirty: bool,
}

impl DedupCache {
    /// Manifest location for `collection` inside `cache_dir`.
    pub fn manifest_path(cache_dir: &Path, collection: &str) -> PathBuf {
        cache_dir.join(format!("{}.json", collection))
    }

    pub fn load(cache_dir: &Path, collection: &str, enabled: bool) -> (Self, CacheStatus) {
        let path = Self::manifest_path(cache_dir, collection);
        let mut cache = Self {
            path,
            ids: HashSet::new(),
            enabled,
            dirty: false,
        };

        if !enabled {
            return (cache, CacheStatus::Disabled);
        }

        let raw = match std::fs::read_to_string(&cache.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return (cache, CacheStatus::Fresh);
            }
            Err(e) => {
                tracing::warn!(path = %cache.path.display(), error = %e, "dedup cache unreadable; caching disabled for this run");
                cache.enabled = false;
                return (cache, CacheStatus::Unavailable(e.to_string()));
            }
        };

        match serde_json::from_str::<Manifest>(&raw) {
            Ok(manifest) => {
                cache.ids = manifest.ids.into_iter().collect();
                let n = cache.ids.len();
                (cache, CacheStatus::Loaded(n))
            }
            Err(e) => {
                tracing::warn!(path = %cache.path.display(), error = %e, "dedup cache corrupt; starting empty");
                // Rewrite at flush even if nothing new is marked.
                cache.dirty = true;
                (cache, CacheStatus::Corrupt)
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A disabled cache contains nothing.
    pub fn contains(&self, id: &str) -> bool {
        self.enabled && self.ids.contains(id)
    }

    pub fn mark<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.enabled {
            return;
        }
        for id in ids {
            if self.ids.insert(id.into()) {
                self.dirty = true;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Write the manifest if anything changed. Writes to a sibling temp
    /// file and renames it into place.
    pub fn flush(&mut self) -> Result<()> {
        if !self.enabled || !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache dir: {}", parent.display()))?;
        }

        let mut ids: Vec<&String> = self.ids.iter().collect();
        ids.sort();
        let body = serde_json::to_string(&serde_json::json!({ "ids": ids }))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .with_context(|| format!("Failed to write cache: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace cache: {}", self.path.display()))?;

        self.dirty = false;
        Ok(())
    }
}
