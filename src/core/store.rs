use sled::{Db, IVec, Tree};
use std::path::Path;
use thiserror::Error;

use crate::core::image::{IndexedImage, IndexedRoot};

const IMAGES_TREE: &str = "images";
const ROOTS_TREE: &str = "roots";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Corrupt record for {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Persistent path -> fingerprint mapping.
///
/// Reads never block: sled serves them lock-free, and each entry is written
/// in a single atomic swap so readers see either the old or the new record.
/// Two writers racing on one path are serialized by compare-and-swap; writers
/// on different paths never touch each other.
pub struct FingerprintStore {
    db: Db,
    images: Tree,
    roots: Tree,
}

impl FingerprintStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store, discarded on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        let images = db.open_tree(IMAGES_TREE)?;
        let roots = db.open_tree(ROOTS_TREE)?;
        Ok(Self { db, images, roots })
    }

    pub fn upsert(&self, image: &IndexedImage) -> Result<UpsertOutcome, StoreError> {
        let key = path_key(&image.path);
        let encoded = serde_json::to_vec(image)?;

        let mut current = self.images.get(&key)?;
        loop {
            if current.as_deref() == Some(encoded.as_slice()) {
                return Ok(UpsertOutcome::Unchanged);
            }
            let outcome = if current.is_some() {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Inserted
            };
            match self
                .images
                .compare_and_swap(&key, current.as_ref(), Some(encoded.as_slice()))?
            {
                Ok(()) => return Ok(outcome),
                Err(conflict) => current = conflict.current,
            }
        }
    }

    pub fn get(&self, path: &Path) -> Result<Option<IndexedImage>, StoreError> {
        let key = path_key(path);
        self.images
            .get(&key)?
            .map(|value| decode(&key, &value))
            .transpose()
    }

    /// Returns whether an entry was present.
    pub fn remove(&self, path: &Path) -> Result<bool, StoreError> {
        Ok(self.images.remove(path_key(path))?.is_some())
    }

    /// Lazy scan over every entry. Each call starts a fresh scan; writes made
    /// by other threads meanwhile may or may not be observed.
    pub fn iter(&self) -> impl Iterator<Item = Result<IndexedImage, StoreError>> + '_ {
        self.images.iter().map(|item| {
            let (key, value) = item?;
            decode(&String::from_utf8_lossy(&key), &value)
        })
    }

    /// Entries whose path lies under `root`, compared component-wise.
    pub fn iter_under<'a>(
        &'a self,
        root: &'a Path,
    ) -> impl Iterator<Item = Result<IndexedImage, StoreError>> + 'a {
        self.images
            .scan_prefix(path_key(root))
            .filter_map(move |item| {
                let (key, value) = match item {
                    Ok(kv) => kv,
                    Err(e) => return Some(Err(StoreError::from(e))),
                };
                let key = String::from_utf8_lossy(&key).into_owned();
                if !Path::new(&key).starts_with(root) {
                    return None;
                }
                Some(decode(&key, &value))
            })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Drops every image and root record.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let removed = self.images.len();
        self.images.clear()?;
        self.roots.clear()?;
        self.flush()?;
        Ok(removed)
    }

    pub fn record_root(&self, root: &IndexedRoot) -> Result<(), StoreError> {
        self.roots
            .insert(path_key(&root.path), serde_json::to_vec(root)?)?;
        Ok(())
    }

    pub fn roots(&self) -> Result<Vec<IndexedRoot>, StoreError> {
        self.roots
            .iter()
            .map(|item| {
                let (key, value) = item?;
                decode(&String::from_utf8_lossy(&key), &value)
            })
            .collect()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, value: &IVec) -> Result<T, StoreError> {
    serde_json::from_slice(value).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}
