use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::core::fingerprint::{ExtractedImage, Fingerprint};
use crate::core::image::{IndexedImage, Resolution, SearchResult};
use crate::core::store::{FingerprintStore, StoreError};

/// Deadline is checked once per this many store entries during the scan.
const DEADLINE_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Similarity threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f64),

    /// Carries how long the search ran before giving up.
    #[error("Search timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// How much resolution and metadata differences cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyPolicy {
    /// Slope of the resolution penalty over the relative area difference.
    pub resolution_weight: f64,
    /// Relative area differences up to this value are not penalized.
    pub resolution_tolerance: f64,
    /// Score fraction lost when metadata signatures differ.
    pub metadata_weight: f64,
}

impl Default for PenaltyPolicy {
    fn default() -> Self {
        Self {
            resolution_weight: 0.5,
            resolution_tolerance: 0.02,
            metadata_weight: 0.1,
        }
    }
}

impl PenaltyPolicy {
    /// 1 within tolerance, then `1 - weight * rel` clamped to [0, 1], where
    /// `rel = 1 - min(area) / max(area)`.
    pub fn resolution_factor(&self, a: Resolution, b: Resolution) -> f64 {
        let (area_a, area_b) = (a.area(), b.area());
        let larger = area_a.max(area_b);
        if larger == 0 {
            return 1.0;
        }
        let relative = 1.0 - area_a.min(area_b) as f64 / larger as f64;
        if relative <= self.resolution_tolerance {
            1.0
        } else {
            (1.0 - self.resolution_weight * relative).clamp(0.0, 1.0)
        }
    }

    pub fn metadata_factor(&self, a: Option<&str>, b: Option<&str>) -> f64 {
        if a == b {
            1.0
        } else {
            (1.0 - self.metadata_weight).clamp(0.0, 1.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SearchScope {
    #[default]
    All,
    /// Only entries under one of these directories.
    Directories(Vec<PathBuf>),
}

impl SearchScope {
    pub fn contains(&self, image: &IndexedImage) -> bool {
        match self {
            SearchScope::All => true,
            SearchScope::Directories(dirs) => dirs.iter().any(|dir| image.path.starts_with(dir)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub fingerprint: Fingerprint,
    pub resolution: Resolution,
    pub metadata_signature: Option<String>,
    pub threshold: f64,
    pub ignore_resolution: bool,
    pub ignore_metadata: bool,
    pub scope: SearchScope,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn from_extracted(extracted: &ExtractedImage, threshold: f64) -> Self {
        Self {
            fingerprint: extracted.fingerprint.clone(),
            resolution: extracted.resolution,
            metadata_signature: extracted.metadata_signature().map(str::to_string),
            threshold,
            ignore_resolution: false,
            ignore_metadata: false,
            scope: SearchScope::All,
            limit: None,
        }
    }

    fn validate(&self) -> Result<(), SearchError> {
        if self.threshold.is_nan() || self.threshold <= 0.0 || self.threshold > 1.0 {
            return Err(SearchError::InvalidThreshold(self.threshold));
        }
        Ok(())
    }
}

pub struct SimilarityMatcher {
    policy: PenaltyPolicy,
}

impl SimilarityMatcher {
    pub fn new(policy: PenaltyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PenaltyPolicy {
        &self.policy
    }

    /// Score of one stored entry against the query, or `None` when the
    /// fingerprints come from different hash configurations.
    pub fn score(&self, query: &SearchQuery, entry: &IndexedImage) -> Option<f64> {
        self.score_parts(
            &query.fingerprint,
            query.resolution,
            query.metadata_signature.as_deref(),
            &entry.fingerprint,
            entry.resolution,
            entry.metadata_signature.as_deref(),
            query.ignore_resolution,
            query.ignore_metadata,
        )
    }

    /// Pairwise score between two extracted images.
    pub fn compare(
        &self,
        a: &ExtractedImage,
        b: &ExtractedImage,
        ignore_resolution: bool,
        ignore_metadata: bool,
    ) -> Option<f64> {
        self.score_parts(
            &a.fingerprint,
            a.resolution,
            a.metadata_signature(),
            &b.fingerprint,
            b.resolution,
            b.metadata_signature(),
            ignore_resolution,
            ignore_metadata,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn score_parts(
        &self,
        fingerprint_a: &Fingerprint,
        resolution_a: Resolution,
        signature_a: Option<&str>,
        fingerprint_b: &Fingerprint,
        resolution_b: Resolution,
        signature_b: Option<&str>,
        ignore_resolution: bool,
        ignore_metadata: bool,
    ) -> Option<f64> {
        let base = fingerprint_a.similarity(fingerprint_b)?;
        let resolution_factor = if ignore_resolution {
            1.0
        } else {
            self.policy.resolution_factor(resolution_a, resolution_b)
        };
        let metadata_factor = if ignore_metadata {
            1.0
        } else {
            self.policy.metadata_factor(signature_a, signature_b)
        };
        Some((base * resolution_factor * metadata_factor).clamp(0.0, 1.0))
    }

    /// Ranked entries scoring at or above the threshold.
    ///
    /// Fails with `Timeout` once `deadline` passes; a partial ranking is
    /// never returned.
    pub fn search(
        &self,
        store: &FingerprintStore,
        query: &SearchQuery,
        deadline: Option<Instant>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        query.validate()?;
        let started = Instant::now();
        let expired = || deadline.is_some_and(|deadline| Instant::now() >= deadline);

        let mut candidates = Vec::new();
        for (i, entry) in store.iter().enumerate() {
            if i % DEADLINE_CHECK_INTERVAL == 0 && expired() {
                return Err(SearchError::Timeout(started.elapsed()));
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(StoreError::Corrupt { key, source }) => {
                    log::warn!("Skipping unreadable record {}: {}", key, source);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if query.scope.contains(&entry) {
                candidates.push(entry);
            }
        }

        let scored: Vec<Option<SearchResult>> = candidates
            .par_iter()
            .map(|entry| {
                if expired() {
                    return Err(SearchError::Timeout(started.elapsed()));
                }
                Ok(self
                    .score(query, entry)
                    .filter(|similarity| *similarity >= query.threshold)
                    .map(|similarity| SearchResult {
                        path: entry.path.clone(),
                        similarity,
                    }))
            })
            .collect::<Result<_, SearchError>>()?;

        let mut results: Vec<SearchResult> = scored.into_iter().flatten().collect();
        rank(&mut results);
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }

        if expired() {
            return Err(SearchError::Timeout(started.elapsed()));
        }
        log::debug!(
            "Search scored {} candidate(s), {} above {}",
            candidates.len(),
            results.len(),
            query.threshold
        );
        Ok(results)
    }
}

impl Default for SimilarityMatcher {
    fn default() -> Self {
        Self::new(PenaltyPolicy::default())
    }
}

/// Similarity descending, then path ascending.
pub fn rank(results: &mut [SearchResult]) {
    results.sort_by(|a, b| match b.similarity.total_cmp(&a.similarity) {
        Ordering::Equal => a.path.cmp(&b.path),
        other => other,
    });
}
