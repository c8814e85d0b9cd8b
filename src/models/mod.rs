//! Data models

pub mod book;
pub mod catalog;
pub mod config;
pub mod hints;
pub mod manifest;

pub use book::SourceBook;
pub use catalog::{CatalogCandidate, ScoredCandidate};
pub use config::Config;
pub use hints::HintSet;
pub use manifest::{LastError, Manifest, ResolvedMetadata, RunStatus, StageState};
