//! Audiobook Shepherd CLI entry point

use anyhow::Result;
use audiobook_shepherd::cli::{handle_check, handle_config, handle_run, Cli, Commands};
use audiobook_shepherd::error;
use audiobook_shepherd::models::Config;
use audiobook_shepherd::utils::ConfigManager;
use audiobook_shepherd::VERSION;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return 2;
        }
    };

    // Keep the file-sink guard alive for the life of the process.
    let _log_guard = match init_logging(cli.verbose, &config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return 2;
        }
    };

    let result = match cli.command {
        Commands::Run(args) => handle_run(args, config).await,

        Commands::Config(command) => handle_config(command),

        Commands::Check => handle_check(),

        Commands::Version => {
            println!("audiobook-shepherd {}", VERSION);
            println!("Batch pipeline for tagged, chaptered M4B libraries");
            Ok(0)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            error::exit_code_of(&e)
        }
    }
}

/// Initialize logging; returns the appender guard when logging to a file
fn init_logging(
    verbose: bool,
    config: &Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_level = if verbose {
        "audiobook_shepherd=debug".to_string()
    } else {
        format!("audiobook_shepherd={}", config.logging.log_level)
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.logging.log_to_file {
        let log_dir = config
            .logging
            .log_dir
            .clone()
            .unwrap_or_else(|| config.work_dir().join("logs"));
        std::fs::create_dir_all(&log_dir)?;

        let appender = tracing_appender::rolling::daily(log_dir, "shepherd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);

        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Ok(Some(guard))
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
        Ok(None)
    }
}

/// Load the configuration file (or use defaults if not found)
fn load_config(cli: &Cli) -> Result<Config> {
    // An explicit --config on the run command wins over the default path.
    let explicit = match &cli.command {
        Commands::Run(args) => args.config.clone(),
        _ => None,
    };

    let config_path = match explicit {
        Some(path) => path,
        None => ConfigManager::default_config_path()?,
    };

    if config_path.exists() {
        ConfigManager::load(&config_path)
    } else {
        tracing::debug!("No config file found, using defaults");
        Ok(Config::default())
    }
}
