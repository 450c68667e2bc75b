//! CLI command definitions and subcommands

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Substrate - service container, state store and event bus diagnostics
#[derive(Parser, Debug)]
#[command(name = "sb", author, version, about = "Component runtime substrate diagnostics", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the dependency graph and initialization order of a service manifest
    Graph {
        /// YAML manifest listing `services: [{name, deps}]`
        #[arg(required = true)]
        manifest: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Also initialize and clean up placeholder services in order
        #[arg(long)]
        init: bool,
    },

    /// Inspect or edit the persisted state document
    State {
        #[command(subcommand)]
        command: StateCommand,
    },

    /// Boot the core services with a sample consumer and run a short scenario
    Demo {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

/// Persisted state subcommands
#[derive(Debug, Subcommand)]
pub enum StateCommand {
    /// Print every persisted key
    Show,

    /// Print one persisted value
    Get {
        #[arg(required = true)]
        key: String,
    },

    /// Persist a JSON value under a key
    Set {
        #[arg(required = true)]
        key: String,

        /// JSON value, e.g. '{"zoom": 11}' or '0.5'
        #[arg(required = true)]
        value: String,
    },

    /// Remove the persisted document
    Clear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
