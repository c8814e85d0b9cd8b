//! CLI commands and arguments

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::VERSION;

/// Audiobook Shepherd - batch audiobook processing into a tagged M4B library
#[derive(Parser)]
#[command(name = "audiobook-shepherd")]
#[command(version = VERSION)]
#[command(about = "Shepherd audiobook folders into a tagged, chaptered M4B library")]
#[command(long_about = "
Audiobook Shepherd walks source directories, discovers audiobooks, and runs
each one through a resumable pipeline: validate, concat, convert, organize,
cleanup. Metadata is resolved by fusing the folder name, embedded tags, an
audiobook catalog, and (optionally) an LLM tiebreaker; output lands under
Author/[Series/]Title folders ready for Plex.
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process source paths through the pipeline
    Run(RunArgs),

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Check external tool dependencies
    Check,

    /// Show version information
    Version,
}

#[derive(Args)]
pub struct RunArgs {
    /// Source directories (or bare audio files) to process
    #[arg(required = false)]
    pub sources: Vec<PathBuf>,

    /// Destination library root
    #[arg(long)]
    pub library_root: Option<PathBuf>,

    /// Manifest directory
    #[arg(long)]
    pub manifest_dir: Option<PathBuf>,

    /// Scratch directory (must be on a local filesystem)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Batch lock file path
    #[arg(long)]
    pub lock_path: Option<PathBuf>,

    /// Stage subset to run
    #[arg(long, value_parser = ["convert", "organize"])]
    pub mode: Option<String>,

    /// Delete each book's manifest first, rerunning every stage
    #[arg(long)]
    pub force: bool,

    /// Compute all decisions but skip all mutations
    #[arg(long)]
    pub dry_run: bool,

    /// Invoke the LLM on every book, not only conflicts
    #[arg(long)]
    pub resolve_all: bool,

    /// Pin the catalog lookup to one ASIN (single-book runs)
    #[arg(long)]
    pub asin: Option<String>,

    /// Upper bound on parallel workers
    #[arg(short = 'j', long)]
    pub max_parallel: Option<usize>,

    /// Throttle when loadavg_1m / cpu_count exceeds this
    #[arg(long)]
    pub cpu_ceiling: Option<f64>,

    /// Sleep this many seconds while throttled
    #[arg(long)]
    pub throttle_sleep: Option<u64>,

    /// Maximum retry attempts per book
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Minimum score to accept a catalog match
    #[arg(long)]
    pub catalog_threshold: Option<f64>,

    /// Catalog region (us, uk, ca, au, fr, de, jp, it, in, es)
    #[arg(long)]
    pub catalog_region: Option<String>,

    /// Disable catalog lookups entirely
    #[arg(long)]
    pub no_catalog: bool,

    /// OpenAI-compatible endpoint base URL
    #[arg(long)]
    pub llm_base_url: Option<String>,

    /// LLM API key (falls back to SHEPHERD_LLM_API_KEY)
    #[arg(long)]
    pub llm_api_key: Option<String>,

    /// LLM model name
    #[arg(long)]
    pub llm_model: Option<String>,

    /// Disable the LLM resolver
    #[arg(long)]
    pub no_llm: bool,

    /// Archive consumed sources here
    #[arg(long)]
    pub archive_dir: Option<PathBuf>,

    /// Prune archived sources older than this many days
    #[arg(long)]
    pub archive_retention_days: Option<u64>,

    /// Keep per-book scratch directories for debugging
    #[arg(long)]
    pub keep_work_files: bool,

    /// Configuration file path
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize config file with defaults
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Show {
        /// Configuration file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show config file path
    Path,
}
