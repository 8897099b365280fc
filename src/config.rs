use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::fingerprint::FingerprintConfig;
use crate::core::indexer::IndexOptions;
use crate::core::matcher::PenaltyPolicy;
use crate::error::{Error, Result};

pub const CONFIG_ENV_VAR: &str = "IMAGETWIN_CONFIG";
const APP_DIR: &str = "imagetwin";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store_path: PathBuf,
    pub similarity_threshold: f64,
    pub fingerprint: FingerprintConfig,
    pub penalties: PenaltyPolicy,
    pub parallel_workers: usize,
    pub exclude_patterns: Vec<String>,
    pub max_scan_depth: Option<usize>,
    pub search_timeout_secs: u64,
    pub max_results: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            similarity_threshold: 0.8,
            fingerprint: FingerprintConfig::default(),
            penalties: PenaltyPolicy::default(),
            parallel_workers: num_cpus::get(),
            exclude_patterns: Vec::new(),
            max_scan_depth: None,
            search_timeout_secs: 30,
            max_results: None,
        }
    }
}

impl AppConfig {
    /// Loads from `explicit`, else `$IMAGETWIN_CONFIG`, else the per-user
    /// config file if present, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
        match resolve_source(explicit, env_path, default_config_path()) {
            Some(path) => {
                log::debug!("Loading config from {}", path.display());
                Self::from_file(&path)
            }
            None => {
                log::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = self.similarity_threshold;
        if t.is_nan() || t <= 0.0 || t > 1.0 {
            return Err(Error::Config(format!(
                "similarity_threshold must be in (0, 1], got {}",
                t
            )));
        }
        if !FingerprintConfig::HASH_SIZES.contains(&self.fingerprint.hash_size) {
            return Err(Error::Config(format!(
                "fingerprint.hash_size must be one of {:?}, got {}",
                FingerprintConfig::HASH_SIZES,
                self.fingerprint.hash_size
            )));
        }
        if self.parallel_workers == 0 {
            return Err(Error::Config("parallel_workers must be at least 1".into()));
        }
        if self.search_timeout_secs == 0 {
            return Err(Error::Config("search_timeout_secs must be at least 1".into()));
        }
        let p = &self.penalties;
        for (name, value) in [
            ("resolution_weight", p.resolution_weight),
            ("resolution_tolerance", p.resolution_tolerance),
            ("metadata_weight", p.metadata_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "penalties.{} must be in [0, 1], got {}",
                    name, value
                )));
            }
        }
        for pattern in &self.exclude_patterns {
            glob::Pattern::new(pattern)
                .map_err(|e| Error::Config(format!("exclude pattern {:?}: {}", pattern, e)))?;
        }
        Ok(())
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions {
            exclude_patterns: self.exclude_patterns.clone(),
            max_depth: self.max_scan_depth,
        }
    }
}

fn resolve_source(
    explicit: Option<&Path>,
    env_path: Option<PathBuf>,
    default_path: Option<PathBuf>,
) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or(env_path)
        .or_else(|| default_path.filter(|path| path.is_file()))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("store")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.similarity_threshold, 0.8);
        assert_eq!(config.search_timeout_secs, 30);
        assert!(config.store_path.ends_with("imagetwin/store"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"similarity_threshold": 0.9, "exclude_patterns": ["*/thumbs/*"], "fingerprint": {"algorithm": "gradient", "hash_size": 8, "dct": true}}"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.similarity_threshold, 0.9);
        assert_eq!(config.exclude_patterns, vec!["*/thumbs/*".to_string()]);
        assert_eq!(config.fingerprint.hash_size, 8);
        assert!(config.fingerprint.dct);
        assert_eq!(config.penalties, PenaltyPolicy::default());
        assert_eq!(config.search_timeout_secs, 30);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_threshold = AppConfig {
            similarity_threshold: 1.5,
            ..AppConfig::default()
        };
        assert!(matches!(bad_threshold.validate(), Err(Error::Config(_))));

        let mut bad_hash = AppConfig::default();
        bad_hash.fingerprint.hash_size = 12;
        assert!(bad_hash.validate().is_err());

        let mut bad_penalty = AppConfig::default();
        bad_penalty.penalties.metadata_weight = -0.1;
        assert!(bad_penalty.validate().is_err());

        let bad_pattern = AppConfig {
            exclude_patterns: vec!["[".to_string()],
            ..AppConfig::default()
        };
        assert!(bad_pattern.validate().is_err());
    }

    #[test]
    fn test_unparseable_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(AppConfig::from_file(&path), Err(Error::Config(_))));
        assert!(matches!(
            AppConfig::from_file(&temp_dir.path().join("missing.json")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_source_precedence() {
        let temp_dir = TempDir::new().unwrap();
        let existing = temp_dir.path().join("config.json");
        fs::write(&existing, "{}").unwrap();
        let explicit = PathBuf::from("/etc/explicit.json");
        let env = PathBuf::from("/etc/env.json");

        assert_eq!(
            resolve_source(Some(&explicit), Some(env.clone()), Some(existing.clone())),
            Some(explicit)
        );
        assert_eq!(
            resolve_source(None, Some(env.clone()), Some(existing.clone())),
            Some(env)
        );
        assert_eq!(
            resolve_source(None, None, Some(existing.clone())),
            Some(existing)
        );
        assert_eq!(
            resolve_source(None, None, Some(temp_dir.path().join("absent.json"))),
            None
        );
    }
}
