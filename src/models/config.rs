//! Configuration model

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub directories: DirectoryConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub organization: OrganizationConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

impl Config {
    /// Manifest directory, defaulting next to the work directory
    pub fn manifest_dir(&self) -> PathBuf {
        self.directories
            .manifest_dir
            .clone()
            .unwrap_or_else(|| self.work_dir().join("manifests"))
    }

    /// Scratch space; must live on a local filesystem
    pub fn work_dir(&self) -> PathBuf {
        self.directories
            .work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("audiobook-shepherd"))
    }

    /// Batch lock file path
    pub fn lock_path(&self) -> PathBuf {
        self.directories
            .lock_path
            .clone()
            .unwrap_or_else(|| self.work_dir().join("shepherd.lock"))
    }

    /// Worker-pool upper bound: min(cpu count, configured maximum)
    pub fn effective_parallel(&self) -> usize {
        let cpus = num_cpus::get().max(1);
        match self.concurrency.max_parallel {
            Some(max) => cpus.min(max.max(1)),
            None => cpus,
        }
    }
}

/// Directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Directories scanned for input books
    #[serde(default)]
    pub source_roots: Vec<PathBuf>,
    /// Destination library root (Author/[Series/]Title/ lives under here)
    #[serde(default = "default_library_root")]
    pub library_root: PathBuf,
    /// Where per-book manifest JSONs live
    pub manifest_dir: Option<PathBuf>,
    /// Scratch space for concat lists and encoder output
    pub work_dir: Option<PathBuf>,
    /// Process-wide lock file path
    pub lock_path: Option<PathBuf>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            source_roots: Vec::new(),
            library_root: default_library_root(),
            manifest_dir: None,
            work_dir: None,
            lock_path: None,
        }
    }
}

fn default_library_root() -> PathBuf {
    PathBuf::from("/audiobooks")
}

/// Worker pool and host-load configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Upper bound on the worker pool (None = one per CPU)
    pub max_parallel: Option<usize>,
    /// Throttle when loadavg_1m / cpu_count exceeds this
    #[serde(default = "default_cpu_ceiling")]
    pub cpu_ceiling: f64,
    /// Sleep while throttled, in seconds
    #[serde(default = "default_throttle_sleep")]
    pub throttle_sleep_s: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            cpu_ceiling: default_cpu_ceiling(),
            throttle_sleep_s: default_throttle_sleep(),
        }
    }
}

fn default_cpu_ceiling() -> f64 {
    0.85
}

fn default_throttle_sleep() -> u64 {
    30
}

/// Processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Stage subset to run: "convert" (full pipeline) or "organize"
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Delete the manifest before running, forcing every stage
    #[serde(default)]
    pub force: bool,
    /// Compute all decisions; skip all mutations
    #[serde(default)]
    pub dry_run: bool,
    /// Maximum retry attempts per book for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial retry delay in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_s: u64,
    /// Keep per-book scratch directories for debugging
    #[serde(default)]
    pub keep_work_files: bool,
    /// Disk headroom multiple required before processing a book
    #[serde(default = "default_disk_multiple")]
    pub disk_space_multiple: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            force: false,
            dry_run: false,
            max_retries: default_max_retries(),
            retry_delay_s: default_retry_delay(),
            keep_work_files: false,
            disk_space_multiple: default_disk_multiple(),
        }
    }
}

fn default_mode() -> String {
    "convert".to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    1
}

fn default_disk_multiple() -> u64 {
    3
}

/// Catalog search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Enable catalog lookups
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Regional endpoint (us, uk, ca, au, fr, de, jp, it, in, es)
    #[serde(default = "default_region")]
    pub region: String,
    /// Minimum score to accept a catalog match
    #[serde(default = "default_catalog_threshold")]
    pub threshold: f64,
    /// Download and embed catalog cover art
    #[serde(default = "default_true")]
    pub download_covers: bool,
    /// Request timeout in seconds
    #[serde(default = "default_catalog_timeout")]
    pub timeout_s: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            region: default_region(),
            threshold: default_catalog_threshold(),
            download_covers: true,
            timeout_s: default_catalog_timeout(),
        }
    }
}

fn default_region() -> String {
    "us".to_string()
}

fn default_catalog_threshold() -> f64 {
    0.55
}

fn default_catalog_timeout() -> u64 {
    30
}

/// LLM disambiguator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Enable LLM resolution
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// OpenAI-compatible endpoint base URL
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// API key; falls back to SHEPHERD_LLM_API_KEY
    pub api_key: Option<String>,
    /// Model name
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Invoke the LLM on every book, not only conflicts
    #[serde(default)]
    pub resolve_all: bool,
    /// Score margin below which multiple candidates count as ambiguous
    #[serde(default = "default_dominance_margin")]
    pub dominance_margin: f64,
    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_llm_base_url(),
            api_key: None,
            model: default_llm_model(),
            resolve_all: false,
            dominance_margin: default_dominance_margin(),
            timeout_s: default_llm_timeout(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_dominance_margin() -> f64 {
    0.15
}

fn default_llm_timeout() -> u64 {
    60
}

/// Destination layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationConfig {
    /// Mode bits applied to copied files (octal string, e.g. "644")
    #[serde(default = "default_file_mode")]
    pub file_mode: String,
    /// Author folder for books whose author cannot be resolved
    #[serde(default = "default_unknown_author")]
    pub unknown_author: String,
}

impl Default for OrganizationConfig {
    fn default() -> Self {
        Self {
            file_mode: default_file_mode(),
            unknown_author: default_unknown_author(),
        }
    }
}

impl OrganizationConfig {
    /// Parsed file mode, falling back to 0644
    pub fn file_mode_bits(&self) -> u32 {
        u32::from_str_radix(&self.file_mode, 8).unwrap_or(0o644)
    }
}

fn default_file_mode() -> String {
    "644".to_string()
}

fn default_unknown_author() -> String {
    "Unknown Author".to_string()
}

/// Source archival configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Where consumed sources go; None disables archival
    pub archive_dir: Option<PathBuf>,
    /// Prune archived entries older than this many days
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            archive_dir: None,
            retention_days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Enable automatic log file creation
    #[serde(default)]
    pub log_to_file: bool,
    /// Custom log file directory
    pub log_dir: Option<PathBuf>,
    /// Log level ("info", "debug", "warn", "error")
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_dir: None,
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Advanced configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Custom encoder binary path
    pub encoder_path: Option<PathBuf>,
    /// Custom prober binary path
    pub prober_path: Option<PathBuf>,
    /// Custom tagger binary path
    pub tagger_path: Option<PathBuf>,
    /// Tagger subprocess timeout in seconds
    #[serde(default = "default_tagger_timeout")]
    pub tagger_timeout_s: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            encoder_path: None,
            prober_path: None,
            tagger_path: None,
            tagger_timeout_s: default_tagger_timeout(),
        }
    }
}

fn default_tagger_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.concurrency.cpu_ceiling, 0.85);
        assert_eq!(config.processing.max_retries, 2);
        assert_eq!(config.processing.mode, "convert");
        assert_eq!(config.catalog.region, "us");
        assert!(config.archive.archive_dir.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(deserialized.concurrency.cpu_ceiling, 0.85);
        assert_eq!(deserialized.catalog.threshold, 0.55);
    }

    #[test]
    fn test_effective_parallel_bounds() {
        let mut config = Config::default();
        config.concurrency.max_parallel = Some(1);
        assert_eq!(config.effective_parallel(), 1);

        config.concurrency.max_parallel = Some(10_000);
        assert!(config.effective_parallel() <= num_cpus::get());
    }

    #[test]
    fn test_file_mode_bits() {
        let org = OrganizationConfig::default();
        assert_eq!(org.file_mode_bits(), 0o644);

        let org = OrganizationConfig {
            file_mode: "755".to_string(),
            ..Default::default()
        };
        assert_eq!(org.file_mode_bits(), 0o755);

        let org = OrganizationConfig {
            file_mode: "bogus".to_string(),
            ..Default::default()
        };
        assert_eq!(org.file_mode_bits(), 0o644);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "directories:\n  library_root: /srv/books\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.directories.library_root, PathBuf::from("/srv/books"));
        assert_eq!(config.concurrency.throttle_sleep_s, 30);
    }
}
