//! Core pipeline: orchestration, stages, manifests, library, organize

pub mod batch;
pub mod library;
pub mod manifest_store;
pub mod organize;
pub mod retry;
pub mod stage;
pub mod stages;

pub use batch::{collect_book_dirs, BatchOrchestrator, BatchReport, BookResult};
pub use library::LibraryIndex;
pub use manifest_store::ManifestStore;
pub use organize::{OrganizeEngine, Plan, PlanAction};
pub use retry::{retry_transient, RetryConfig};
pub use stage::{run_book, PipelineMode, Stage, StageContext};
