use std::time::Duration;
use thiserror::Error;

use crate::core::fingerprint::ExtractError;
use crate::core::indexer::IndexError;
use crate::core::matcher::SearchError;
use crate::core::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not decode image: {0}")]
    Decode(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Store failure: {0}")]
    StoreIo(#[from] StoreError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Search timed out after {0:?}")]
    Timeout(Duration),

    #[error("Similarity threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<ExtractError> for Error {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Io(io) => match io.kind() {
                std::io::ErrorKind::NotFound => Error::PathNotFound(io.to_string()),
                std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(io.to_string()),
                _ => Error::Decode(io.to_string()),
            },
            ExtractError::Decode { message } => Error::Decode(message),
            ExtractError::UnsupportedFormat { format } => Error::UnsupportedFormat(format),
        }
    }
}

impl From<IndexError> for Error {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::PathNotFound { path } => Error::PathNotFound(path),
            IndexError::PermissionDenied { path } => Error::PermissionDenied(path),
            IndexError::Pattern(e) => Error::Config(format!("exclude pattern: {}", e)),
            IndexError::Store(e) => Error::StoreIo(e),
            IndexError::Cancelled => Error::Cancelled,
        }
    }
}

impl From<SearchError> for Error {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::InvalidThreshold(threshold) => Error::InvalidThreshold(threshold),
            SearchError::Timeout(elapsed) => Error::Timeout(elapsed),
            SearchError::Store(e) => Error::StoreIo(e),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_error_mapping() {
        let err: Error = IndexError::PathNotFound {
            path: "/nope".to_string(),
        }
        .into();
        assert!(matches!(err, Error::PathNotFound(p) if p == "/nope"));
        assert!(matches!(Error::from(IndexError::Cancelled), Error::Cancelled));
    }

    #[test]
    fn test_extract_error_mapping() {
        let err: Error = ExtractError::UnsupportedFormat {
            format: "Ico".to_string(),
        }
        .into();
        assert!(matches!(err, Error::UnsupportedFormat(f) if f == "Ico"));

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            Error::from(ExtractError::Io(missing)),
            Error::PathNotFound(_)
        ));
    }

    #[test]
    fn test_search_error_mapping() {
        assert!(matches!(
            Error::from(SearchError::InvalidThreshold(1.5)),
            Error::InvalidThreshold(t) if t == 1.5
        ));
        let elapsed = Duration::from_millis(1500);
        assert!(matches!(
            Error::from(SearchError::Timeout(elapsed)),
            Error::Timeout(d) if d == elapsed
        ));
        assert_eq!(
            Error::Timeout(elapsed).to_string(),
            "Search timed out after 1.5s"
        );
    }
}
