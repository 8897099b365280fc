use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::fingerprint::{ExtractedImage, FingerprintExtractor};
use crate::core::image::{IndexedRoot, SearchResult};
use crate::core::indexer::{IndexProgress, IndexSummary, Indexer};
use crate::core::matcher::{SearchError, SearchQuery, SearchScope, SimilarityMatcher};
use crate::core::store::FingerprintStore;
use crate::error::{Error, Result};

/// Per-request search options. Unset fields fall back to the configuration.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub threshold: Option<f64>,
    pub ignore_resolution: bool,
    pub ignore_metadata: bool,
    /// Restrict matches to these directories; empty means the whole index.
    pub directories: Vec<PathBuf>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
    /// Base64 of the query's perceptual hash.
    pub query_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub total_indexed_images: usize,
    pub roots: Vec<IndexedRoot>,
    pub store_path: PathBuf,
}

/// Index, search and maintenance operations over one fingerprint store.
///
/// All methods take `&self` and may run concurrently; blocking work is moved
/// off the async runtime and parallel work shares one bounded pool.
pub struct ImageTwin {
    config: AppConfig,
    store: Arc<FingerprintStore>,
    extractor: Arc<FingerprintExtractor>,
    matcher: Arc<SimilarityMatcher>,
    pool: Arc<ThreadPool>,
    search_timeout: Duration,
}

impl ImageTwin {
    /// Opens (or creates) the store at `config.store_path`.
    pub fn open(config: AppConfig) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = config.store_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let store = FingerprintStore::open(&config.store_path)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: AppConfig, store: FingerprintStore) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.parallel_workers)
            .thread_name(|i| format!("imagetwin-worker-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("cannot start worker pool: {}", e)))?;

        log::debug!(
            "Engine ready: {} worker(s), fingerprint {}",
            config.parallel_workers,
            config.fingerprint
        );
        Ok(Self {
            store: Arc::new(store),
            extractor: Arc::new(FingerprintExtractor::new(config.fingerprint.clone())),
            matcher: Arc::new(SimilarityMatcher::new(config.penalties.clone())),
            pool: Arc::new(pool),
            search_timeout: Duration::from_secs(config.search_timeout_secs),
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn index(&self, roots: Vec<PathBuf>) -> Result<IndexSummary> {
        self.index_with(roots, Arc::new(AtomicBool::new(false)), None)
            .await
    }

    /// Index with a caller-owned cancellation flag and optional progress feed.
    pub async fn index_with(
        &self,
        roots: Vec<PathBuf>,
        cancel: Arc<AtomicBool>,
        progress: Option<mpsc::UnboundedSender<IndexProgress>>,
    ) -> Result<IndexSummary> {
        let mut indexer = Indexer::new(
            self.store.clone(),
            self.extractor.clone(),
            self.pool.clone(),
            &self.config.index_options(),
        )?
        .with_cancellation_token(cancel);
        if let Some(sender) = progress {
            indexer = indexer.with_progress_sender(sender);
        }

        let summary =
            tokio::task::spawn_blocking(move || indexer.index_directories(&roots)).await??;
        Ok(summary)
    }

    /// Ranked matches for the query image. Fails with `Timeout` when the
    /// configured budget runs out; partial results are discarded.
    pub async fn search(&self, bytes: Vec<u8>, params: SearchParams) -> Result<SearchResponse> {
        let threshold = params.threshold.unwrap_or(self.config.similarity_threshold);
        if threshold.is_nan() || threshold <= 0.0 || threshold > 1.0 {
            return Err(Error::InvalidThreshold(threshold));
        }

        let scope = if params.directories.is_empty() {
            SearchScope::All
        } else {
            SearchScope::Directories(
                params
                    .directories
                    .iter()
                    .map(|dir| dir.canonicalize().unwrap_or_else(|_| dir.clone()))
                    .collect(),
            )
        };
        let limit = params.limit.or(self.config.max_results);

        let budget = self.search_timeout;
        let deadline = Instant::now() + budget;
        let store = self.store.clone();
        let extractor = self.extractor.clone();
        let matcher = self.matcher.clone();
        let pool = self.pool.clone();

        let task = tokio::task::spawn_blocking(move || -> Result<SearchResponse> {
            let extracted = extractor.extract(&bytes)?;
            let query = SearchQuery {
                ignore_resolution: params.ignore_resolution,
                ignore_metadata: params.ignore_metadata,
                scope,
                limit,
                ..SearchQuery::from_extracted(&extracted, threshold)
            };
            let results = pool
                .install(|| matcher.search(&store, &query, Some(deadline)))
                .map_err(|e| match e {
                    SearchError::Timeout(_) => Error::Timeout(budget),
                    other => other.into(),
                })?;
            Ok(SearchResponse {
                total: results.len(),
                results,
                query_fingerprint: extracted.fingerprint.to_base64(),
            })
        });

        match tokio::time::timeout(budget, task).await {
            Ok(joined) => joined?,
            Err(_) => {
                log::warn!("Search exceeded {:?} budget", budget);
                Err(Error::Timeout(budget))
            }
        }
    }

    pub async fn status(&self) -> Result<Status> {
        let store = self.store.clone();
        let store_path = self.config.store_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Status> {
            Ok(Status {
                total_indexed_images: store.len(),
                roots: store.roots()?,
                store_path,
            })
        })
        .await?
    }

    /// Pairwise score of two images under the configured penalty policy.
    pub async fn compare(
        &self,
        first: Vec<u8>,
        second: Vec<u8>,
        ignore_resolution: bool,
        ignore_metadata: bool,
    ) -> Result<f64> {
        let extractor = self.extractor.clone();
        let matcher = self.matcher.clone();
        tokio::task::spawn_blocking(move || -> Result<f64> {
            let a = extractor.extract(&first)?;
            let b = extractor.extract(&second)?;
            pairwise_score(&matcher, &a, &b, ignore_resolution, ignore_metadata)
        })
        .await?
    }

    /// Drops every indexed image and root. Returns how many images were removed.
    pub async fn clear(&self) -> Result<usize> {
        let store = self.store.clone();
        let removed = tokio::task::spawn_blocking(move || store.clear()).await??;
        log::info!("Cleared {} indexed image(s)", removed);
        Ok(removed)
    }
}

/// Both sides come from one extractor, so a `None` here is a broken invariant.
fn pairwise_score(
    matcher: &SimilarityMatcher,
    a: &ExtractedImage,
    b: &ExtractedImage,
    ignore_resolution: bool,
    ignore_metadata: bool,
) -> Result<f64> {
    matcher
        .compare(a, b, ignore_resolution, ignore_metadata)
        .ok_or_else(|| {
            Error::Task(format!(
                "fingerprints not comparable ({} vs {})",
                a.fingerprint.config, b.fingerprint.config
            ))
        })
}
