use chrono::{DateTime, Utc};
use glob::Pattern;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::core::fingerprint::FingerprintExtractor;
use crate::core::image::{ImageKind, IndexedImage, IndexedRoot};
use crate::core::store::{FingerprintStore, StoreError, UpsertOutcome};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Invalid exclude pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexProgress {
    pub root: String,
    pub files_processed: usize,
    pub total_files: usize,
    pub current_file: String,
    pub estimated_time_remaining: Option<u64>, // seconds
    pub phase: IndexPhase,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IndexPhase {
    Discovery,
    Fingerprinting,
    Pruning,
    Complete,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub exclude_patterns: Vec<String>,
    pub max_depth: Option<usize>,
}

/// Aggregate counts for one index operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub new_count: usize,
    pub updated_count: usize,
    pub removed_count: usize,
    pub unchanged_count: usize,
    pub failed_count: usize,
    /// Store cardinality once the pass finished.
    pub total_indexed: usize,
    /// Requested roots that could not be accessed.
    pub skipped_roots: Vec<PathBuf>,
}

impl IndexSummary {
    fn absorb(&mut self, root: &RootSummary) {
        self.new_count += root.new_count;
        self.updated_count += root.updated_count;
        self.removed_count += root.removed_count;
        self.unchanged_count += root.unchanged_count;
        self.failed_count += root.failed_count;
    }
}

#[derive(Debug, Default)]
struct RootSummary {
    new_count: usize,
    updated_count: usize,
    removed_count: usize,
    unchanged_count: usize,
    failed_count: usize,
}

enum FileOutcome {
    New,
    Updated,
    Unchanged,
    Failed,
    /// Failed, and the record it left behind was dropped.
    FailedAndEvicted,
}

struct Discovery {
    files: Vec<PathBuf>,
    /// Paths the walk could not read; entries beneath them are never pruned.
    unreadable: Vec<PathBuf>,
    /// Image files skipped because their path is not valid UTF-8.
    non_utf8: usize,
}

pub struct Indexer {
    store: Arc<FingerprintStore>,
    extractor: Arc<FingerprintExtractor>,
    pool: Arc<ThreadPool>,
    exclude_patterns: Vec<Pattern>,
    max_depth: Option<usize>,
    progress_sender: Option<mpsc::UnboundedSender<IndexProgress>>,
    cancellation_token: Arc<AtomicBool>,
}

impl Indexer {
    pub fn new(
        store: Arc<FingerprintStore>,
        extractor: Arc<FingerprintExtractor>,
        pool: Arc<ThreadPool>,
        options: &IndexOptions,
    ) -> Result<Self, IndexError> {
        let exclude_patterns = options
            .exclude_patterns
            .iter()
            .map(|pattern| Pattern::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            store,
            extractor,
            pool,
            exclude_patterns,
            max_depth: options.max_depth,
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<IndexProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    /// Brings the store in line with the files under `roots`.
    ///
    /// Fails as a whole only when no root is accessible, when the store
    /// fails, or when cancelled. Upserts committed before a failure stay.
    pub fn index_directories(&self, roots: &[PathBuf]) -> Result<IndexSummary, IndexError> {
        if self.is_cancelled() {
            return Err(IndexError::Cancelled);
        }

        let (roots, skipped_roots) = self.resolve_roots(roots)?;
        log::info!("Indexing {} root(s)", roots.len());

        let results: Vec<Result<RootSummary, IndexError>> = self.pool.install(|| {
            roots
                .par_iter()
                .map(|root| self.index_root(root))
                .collect()
        });

        let mut summary = IndexSummary {
            skipped_roots,
            ..IndexSummary::default()
        };
        let mut first_error = None;
        for result in results {
            match result {
                Ok(root_summary) => summary.absorb(&root_summary),
                Err(e) => {
                    if first_error.is_none() || matches!(e, IndexError::Store(_)) {
                        first_error = Some(e);
                    }
                }
            }
        }

        self.store.flush()?;
        if let Some(e) = first_error {
            log::warn!(
                "Index pass stopped early ({}): {} new, {} updated so far",
                e,
                summary.new_count,
                summary.updated_count
            );
            return Err(e);
        }

        summary.total_indexed = self.store.len();
        log::info!(
            "Index pass complete: {} new, {} updated, {} removed, {} unchanged, {} failed",
            summary.new_count,
            summary.updated_count,
            summary.removed_count,
            summary.unchanged_count,
            summary.failed_count
        );
        Ok(summary)
    }

    /// Canonicalizes the accessible roots and folds nested ones into their
    /// parent. Errors only when none are accessible.
    fn resolve_roots(&self, roots: &[PathBuf]) -> Result<(Vec<PathBuf>, Vec<PathBuf>), IndexError> {
        let mut accessible = Vec::new();
        let mut skipped = Vec::new();
        let mut first_error = None;

        for root in roots {
            match check_root(root) {
                Ok(canonical) => accessible.push(canonical),
                Err(e) => {
                    log::warn!("Skipping root {}: {}", root.display(), e);
                    skipped.push(root.clone());
                    first_error.get_or_insert(e);
                }
            }
        }

        if accessible.is_empty() {
            return Err(first_error.unwrap_or(IndexError::PathNotFound {
                path: "no directories given".to_string(),
            }));
        }

        accessible.sort();
        accessible.dedup();
        let folded: Vec<PathBuf> = accessible
            .iter()
            .filter(|root| {
                !accessible
                    .iter()
                    .any(|other| other != *root && root.starts_with(other))
            })
            .cloned()
            .collect();
        if folded.len() < accessible.len() {
            log::debug!(
                "Folded {} nested root(s) into their parents",
                accessible.len() - folded.len()
            );
        }

        Ok((folded, skipped))
    }

    fn index_root(&self, root: &Path) -> Result<RootSummary, IndexError> {
        let root_label = root.to_string_lossy().to_string();

        self.send_progress(IndexProgress {
            root: root_label.clone(),
            files_processed: 0,
            total_files: 0,
            current_file: "Discovering files...".to_string(),
            estimated_time_remaining: None,
            phase: IndexPhase::Discovery,
        });
        let discovery = self.discover_files(root)?;
        let total_files = discovery.files.len();
        log::debug!("Found {} image file(s) under {}", total_files, root.display());

        let processed_count = AtomicUsize::new(0);
        let start_time = Instant::now();

        let outcomes: Vec<FileOutcome> = discovery
            .files
            .par_iter()
            .map(|file_path| {
                let outcome = self.process_file(root, file_path)?;

                let current_count = processed_count.fetch_add(1, Ordering::Relaxed) + 1;
                let elapsed = start_time.elapsed().as_secs();
                let estimated_remaining = if elapsed > 0 {
                    let rate = current_count as f64 / elapsed as f64;
                    Some(((total_files - current_count) as f64 / rate) as u64)
                } else {
                    None
                };
                self.send_progress(IndexProgress {
                    root: root_label.clone(),
                    files_processed: current_count,
                    total_files,
                    current_file: file_path.to_string_lossy().to_string(),
                    estimated_time_remaining: estimated_remaining,
                    phase: IndexPhase::Fingerprinting,
                });

                Ok(outcome)
            })
            .collect::<Result<_, IndexError>>()?;

        let mut summary = RootSummary {
            failed_count: discovery.non_utf8,
            ..RootSummary::default()
        };
        for outcome in outcomes {
            match outcome {
                FileOutcome::New => summary.new_count += 1,
                FileOutcome::Updated => summary.updated_count += 1,
                FileOutcome::Unchanged => summary.unchanged_count += 1,
                FileOutcome::Failed => summary.failed_count += 1,
                FileOutcome::FailedAndEvicted => {
                    summary.failed_count += 1;
                    summary.removed_count += 1;
                }
            }
        }

        self.send_progress(IndexProgress {
            root: root_label.clone(),
            files_processed: total_files,
            total_files,
            current_file: "Removing deleted files...".to_string(),
            estimated_time_remaining: None,
            phase: IndexPhase::Pruning,
        });
        summary.removed_count = self.prune_missing(root, &discovery)?;

        let image_count = self
            .store
            .iter_under(root)
            .filter(|entry| entry.is_ok())
            .count();
        self.store.record_root(&IndexedRoot {
            path: root.to_path_buf(),
            last_indexed_at: Utc::now(),
            image_count,
        })?;

        self.send_progress(IndexProgress {
            root: root_label,
            files_processed: total_files,
            total_files,
            current_file: "Index complete".to_string(),
            estimated_time_remaining: Some(0),
            phase: IndexPhase::Complete,
        });

        Ok(summary)
    }

    fn discover_files(&self, root: &Path) -> Result<Discovery, IndexError> {
        let mut walker = WalkDir::new(root).follow_links(false);
        if let Some(max_depth) = self.max_depth {
            walker = walker.max_depth(max_depth);
        }

        let mut files = Vec::new();
        let mut unreadable = Vec::new();
        let mut non_utf8 = 0;
        for entry in walker {
            if self.is_cancelled() {
                return Err(IndexError::Cancelled);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Walk error under {}: {}", root.display(), e);
                    if let Some(path) = e.path() {
                        unreadable.push(path.to_path_buf());
                    }
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let path_str = path.to_string_lossy();
            if self
                .exclude_patterns
                .iter()
                .any(|pattern| pattern.matches(&path_str))
            {
                continue;
            }

            if !ImageKind::has_supported_extension(path) {
                continue;
            }
            if path.to_str().is_none() {
                log::warn!("Skipping {}: path is not valid UTF-8", path.display());
                non_utf8 += 1;
                continue;
            }
            files.push(path.to_path_buf());
        }

        Ok(Discovery {
            files,
            unreadable,
            non_utf8,
        })
    }

    /// Per-file failures are logged and reported as `Failed`; only store
    /// errors and cancellation propagate.
    fn process_file(&self, root: &Path, file_path: &Path) -> Result<FileOutcome, IndexError> {
        if self.is_cancelled() {
            return Err(IndexError::Cancelled);
        }

        let metadata = match fs::metadata(file_path) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::warn!("Failed to stat {}: {}", file_path.display(), e);
                return Ok(FileOutcome::Failed);
            }
        };
        let file_size_bytes = metadata.len();
        let modified_at: DateTime<Utc> = match metadata.modified() {
            Ok(modified) => modified.into(),
            Err(e) => {
                log::warn!("No modification time for {}: {}", file_path.display(), e);
                return Ok(FileOutcome::Failed);
            }
        };

        let (existing, has_record) = match self.store.get(file_path) {
            Ok(existing) => {
                let has_record = existing.is_some();
                (existing, has_record)
            }
            Err(StoreError::Corrupt { key, source }) => {
                log::warn!("Replacing unreadable record for {}: {}", key, source);
                (None, true)
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(existing) = &existing {
            if existing.is_current(file_size_bytes, modified_at)
                && existing.fingerprint.config == *self.extractor.config()
            {
                return Ok(FileOutcome::Unchanged);
            }
        }

        let extracted = match self.extractor.extract_file(file_path) {
            Ok(extracted) => extracted,
            Err(e) => {
                log::warn!("Failed to fingerprint {}: {}", file_path.display(), e);
                return self.fail(file_path, has_record);
            }
        };

        let (camera, taken_at) = match &extracted.metadata {
            Some(metadata) => (metadata.camera.clone(), metadata.taken_at),
            None => (None, None),
        };
        let image = IndexedImage {
            path: file_path.to_path_buf(),
            root: root.to_path_buf(),
            metadata_signature: extracted.metadata_signature().map(str::to_string),
            fingerprint: extracted.fingerprint,
            resolution: extracted.resolution,
            format: extracted.format,
            file_size_bytes,
            modified_at,
            camera,
            taken_at,
        };

        match self.store.upsert(&image) {
            Ok(UpsertOutcome::Inserted) => Ok(FileOutcome::New),
            Ok(UpsertOutcome::Updated) => Ok(FileOutcome::Updated),
            Ok(UpsertOutcome::Unchanged) => Ok(FileOutcome::Unchanged),
            Err(StoreError::Serialization(e)) => {
                log::warn!("Cannot encode record for {}: {}", file_path.display(), e);
                self.fail(file_path, has_record)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Counts a per-file failure, dropping any record left from earlier content.
    fn fail(&self, file_path: &Path, has_record: bool) -> Result<FileOutcome, IndexError> {
        if has_record && self.store.remove(file_path)? {
            log::debug!("Dropped stale record for {}", file_path.display());
            return Ok(FileOutcome::FailedAndEvicted);
        }
        Ok(FileOutcome::Failed)
    }

    /// Removes stored entries under `root` the walk no longer saw.
    fn prune_missing(&self, root: &Path, discovery: &Discovery) -> Result<usize, IndexError> {
        let seen: HashSet<&Path> = discovery.files.iter().map(PathBuf::as_path).collect();

        let mut stale = Vec::new();
        for entry in self.store.iter_under(root) {
            if self.is_cancelled() {
                return Err(IndexError::Cancelled);
            }
            let path = match entry {
                Ok(image) => image.path,
                Err(StoreError::Corrupt { key, .. }) => PathBuf::from(key),
                Err(e) => return Err(e.into()),
            };
            if seen.contains(path.as_path()) {
                continue;
            }
            if discovery
                .unreadable
                .iter()
                .any(|unreadable| path.starts_with(unreadable))
            {
                continue;
            }
            stale.push(path);
        }

        let mut removed = 0;
        for path in stale {
            if self.store.remove(&path)? {
                log::debug!("Removed missing file {}", path.display());
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn send_progress(&self, progress: IndexProgress) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(progress);
        }
    }
}

fn check_root(root: &Path) -> Result<PathBuf, IndexError> {
    let path = root.to_string_lossy().to_string();
    let io_to_index_error = |e: std::io::Error, path: String| match e.kind() {
        ErrorKind::PermissionDenied => IndexError::PermissionDenied { path },
        _ => IndexError::PathNotFound { path },
    };

    let canonical = fs::canonicalize(root).map_err(|e| io_to_index_error(e, path.clone()))?;
    if !canonical.is_dir() {
        return Err(IndexError::PathNotFound {
            path: format!("{} is not a directory", path),
        });
    }
    fs::read_dir(&canonical).map_err(|e| io_to_index_error(e, path))?;
    Ok(canonical)
}
