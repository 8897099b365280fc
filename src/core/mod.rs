pub mod exif;
pub mod fingerprint;
pub mod image;
pub mod indexer;
pub mod matcher;
pub mod store;
