//! Audiobook Shepherd - batch audiobook processing into a tagged M4B library
//!
//! This library provides the pipeline core:
//! - Source discovery with stable per-book identities
//! - A resumable stage machine (validate, concat, convert, organize, cleanup)
//!   backed by crash-safe per-book manifests
//! - A CPU-load-aware concurrent batch executor
//! - Metadata resolution fusing path parsing, embedded tags, a catalog
//!   search, and an LLM disambiguator

pub mod audio;
pub mod cli;
pub mod core;
pub mod error;
pub mod metadata;
pub mod models;
pub mod utils;

// Re-export commonly used types
pub use crate::core::{BatchOrchestrator, BatchReport, PipelineMode, Stage};
pub use crate::error::{ErrorCategory, PipelineError};
pub use crate::models::{Config, HintSet, Manifest, SourceBook};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
