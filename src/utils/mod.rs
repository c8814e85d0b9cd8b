//! Utility modules

pub mod config;
pub mod lock;
pub mod sanitize;
pub mod sorting;
pub mod subprocess;
pub mod validation;

pub use config::ConfigManager;
pub use lock::{check_disk_space, dir_size, LoadMonitor, LockAttempt, ProcessLock};
pub use sanitize::{book_hash, sanitize_component, ComponentKind};
pub use sorting::{natural_compare, natural_sort};
pub use validation::DependencyChecker;
