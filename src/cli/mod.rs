//! Command-line interface

pub mod commands;
pub mod handlers;

pub use commands::{Cli, Commands, ConfigCommands, RunArgs};
pub use handlers::{handle_check, handle_config, handle_run};
