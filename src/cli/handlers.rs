//! Command handlers

use crate::cli::commands::{ConfigCommands, RunArgs};
use crate::core::{BatchOrchestrator, BatchReport, PipelineMode};
use crate::models::Config;
use crate::utils::{ConfigManager, DependencyChecker};
use anyhow::Result;
use console::style;
use tokio_util::sync::CancellationToken;

/// Run the batch; returns the process exit code
pub async fn handle_run(args: RunArgs, mut config: Config) -> Result<i32> {
    apply_overrides(&args, &mut config);

    let mode = PipelineMode::from_str(&config.processing.mode)?;

    if config.processing.dry_run {
        println!("{}", style("Dry run: no files will be written").yellow());
    }

    // Ctrl-C stops new dispatches; in-flight books finish their current
    // stage and resume next run from the manifest.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; cancelling batch");
                cancel.cancel();
            }
        });
    }

    let orchestrator = BatchOrchestrator::new(config, cancel);
    let report = orchestrator
        .run(&args.sources, mode, args.asin.clone())
        .await?;

    print_summary(&report);
    Ok(report.exit_code())
}

/// CLI flags override file-loaded values at construction time
fn apply_overrides(args: &RunArgs, config: &mut Config) {
    if let Some(ref root) = args.library_root {
        config.directories.library_root = root.clone();
    }
    if args.manifest_dir.is_some() {
        config.directories.manifest_dir = args.manifest_dir.clone();
    }
    if args.work_dir.is_some() {
        config.directories.work_dir = args.work_dir.clone();
    }
    if args.lock_path.is_some() {
        config.directories.lock_path = args.lock_path.clone();
    }
    if let Some(ref mode) = args.mode {
        config.processing.mode = mode.clone();
    }
    if args.force {
        config.processing.force = true;
    }
    if args.dry_run {
        config.processing.dry_run = true;
    }
    if args.keep_work_files {
        config.processing.keep_work_files = true;
    }
    if let Some(retries) = args.max_retries {
        config.processing.max_retries = retries;
    }
    if args.max_parallel.is_some() {
        config.concurrency.max_parallel = args.max_parallel;
    }
    if let Some(ceiling) = args.cpu_ceiling {
        config.concurrency.cpu_ceiling = ceiling;
    }
    if let Some(sleep) = args.throttle_sleep {
        config.concurrency.throttle_sleep_s = sleep;
    }
    if let Some(threshold) = args.catalog_threshold {
        config.catalog.threshold = threshold;
    }
    if let Some(ref region) = args.catalog_region {
        config.catalog.region = region.clone();
    }
    if args.no_catalog {
        config.catalog.enabled = false;
    }
    if args.resolve_all {
        config.llm.resolve_all = true;
    }
    if let Some(ref url) = args.llm_base_url {
        config.llm.base_url = url.clone();
    }
    if args.llm_api_key.is_some() {
        config.llm.api_key = args.llm_api_key.clone();
    }
    if let Some(ref model) = args.llm_model {
        config.llm.model = model.clone();
    }
    if args.no_llm {
        config.llm.enabled = false;
    }
    if args.archive_dir.is_some() {
        config.archive.archive_dir = args.archive_dir.clone();
    }
    if let Some(days) = args.archive_retention_days {
        config.archive.retention_days = days;
    }
}

/// Per-book ok/fail summary with counts
fn print_summary(report: &BatchReport) {
    if report.contended {
        println!(
            "{}",
            style("Another batch is already running on this host; nothing to do").yellow()
        );
        return;
    }
    if report.results.is_empty() {
        println!("{}", style("No books found").yellow());
        return;
    }

    println!();
    for result in &report.results {
        if result.success {
            println!(
                "{} {} ({:.1}s)",
                style("✓").green(),
                result.name,
                result.elapsed_s
            );
        } else {
            println!(
                "{} {} ({:.1}s) - {}",
                style("✗").red(),
                result.name,
                result.elapsed_s,
                result.message.as_deref().unwrap_or("unknown error")
            );
        }
    }

    println!();
    let line = format!(
        "{} succeeded, {} failed, {} total",
        report.succeeded(),
        report.failed(),
        report.results.len()
    );
    if report.failed() == 0 {
        println!("{}", style(line).green().bold());
    } else {
        println!("{}", style(line).red().bold());
    }
}

/// Verify the external tools are present
pub fn handle_check() -> Result<i32> {
    println!("Checking external tools...\n");

    let statuses = DependencyChecker::check_all();
    for status in &statuses {
        println!("{}\n", status);
    }

    if statuses.iter().all(|s| s.found) {
        println!("{}", style("All dependencies satisfied").green().bold());
        Ok(0)
    } else {
        println!("{}", style("Missing dependencies").red().bold());
        // Missing tools are a configuration problem.
        Ok(2)
    }
}

/// Config subcommands
pub fn handle_config(command: ConfigCommands) -> Result<i32> {
    match command {
        ConfigCommands::Init { force } => {
            let path = ConfigManager::default_config_path()?;
            if path.exists() && !force {
                println!(
                    "Config already exists at {} (use --force to overwrite)",
                    path.display()
                );
                return Ok(2);
            }
            ConfigManager::save(&Config::default(), &path)?;
            println!("Wrote default config to {}", path.display());
            Ok(0)
        }
        ConfigCommands::Show { config } => {
            let path = match config {
                Some(path) => path,
                None => ConfigManager::default_config_path()?,
            };
            let loaded = if path.exists() {
                ConfigManager::load(&path)?
            } else {
                println!("(no config file; showing defaults)");
                Config::default()
            };
            println!("{}", serde_yaml::to_string(&loaded)?);
            Ok(0)
        }
        ConfigCommands::Path => {
            println!("{}", ConfigManager::default_config_path()?.display());
            Ok(0)
        }
    }
}
