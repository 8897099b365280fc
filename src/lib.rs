//! Perceptual image-similarity search over local directories.
//!
//! Index directories with [`ImageTwin::index`], then look up visually
//! similar images with [`ImageTwin::search`].

pub mod config;
pub mod core;
pub mod engine;
pub mod error;

pub use config::AppConfig;
pub use engine::{ImageTwin, SearchParams, SearchResponse, Status};
pub use error::{Error, Result};
