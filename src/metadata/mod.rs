//! Metadata resolution: path parsing, embedded tags, catalog, LLM fusion

pub mod catalog;
pub mod llm;
pub mod path_parser;
pub mod resolver;
pub mod tags;

pub use catalog::{CatalogClient, CatalogRegion};
pub use llm::LlmResolver;
pub use resolver::{MetadataResolver, ResolutionOutcome};
