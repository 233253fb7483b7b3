//! Folder scanner.
//!
//! Walks a root directory and lists every file whose extension the
//! [`ExtractorRegistry`] supports. Listing is separate from parsing so the
//! file set (path + byte length) is known before any content is read; the
//! tuning advisor signs the dataset from that list alone.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::error::ExtractError;
use crate::extract::{extension_of, ExtractorRegistry};
use crate::models::{Document, SourceFile};

/// Directory names that are never worth ingesting.
const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
}

/// List supported files under `root`, sorted by path.
///
/// A missing root is an error. Unreadable entries below the root are
/// logged and skipped.
pub fn gather_files(
    root: &Path,
    registry: &ExtractorRegistry,
    options: &ScanOptions,
) -> Result<Vec<SourceFile>> {
    if !root.is_dir() {
        bail!("Folder not found: {}", root.display());
    }

    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(options.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(options.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) {
            continue;
        }

        let Some(extension) = extension_of(path) else {
            continue;
        };
        if !registry.supports(&extension) {
            continue;
        }

        let byte_len = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping file without metadata");
                continue;
            }
        };

        files.push(SourceFile {
            path: path.to_path_buf(),
            rel_path: rel_str,
            extension,
            byte_len,
        });
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(files)
}

/// Extract one file. `Ok(None)` means the text was too short to keep.
pub fn parse_file(
    file: &SourceFile,
    registry: &ExtractorRegistry,
    min_content_chars: usize,
) -> Result<Option<Document>, ExtractError> {
    let extracted = registry.extract(&file.path, &file.extension)?;

    if extracted.text.trim().chars().count() < min_content_chars {
        return Ok(None);
    }

    Ok(Some(Document {
        source_path: file.path.clone(),
        rel_path: file.rel_path.clone(),
        extension: file.extension.clone(),
        text: extracted.text,
        title: extracted.title,
        author: extracted.author,
    }))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
