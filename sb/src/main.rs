use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use substrate::cli::{Cli, Command, OutputFormat, StateCommand};
use substrate::config::Config;
use substrate::demo::run_demo;
use substrate::manifest::Manifest;
use substrate::state::{FileStorage, StateManager};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("substrate")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("substrate.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    debug!(?config, "main: config loaded");

    match cli.command {
        Command::Graph { manifest, format, init } => cmd_graph(&manifest, format, init).await,
        Command::State { command } => cmd_state(&config, command),
        Command::Demo { format } => cmd_demo(&config, format).await,
    }
}

async fn cmd_graph(path: &Path, format: OutputFormat, init: bool) -> Result<()> {
    debug!(?path, ?format, init, "cmd_graph: called");
    let manifest = Manifest::load(path)?;
    let container = manifest.container().context("Invalid service manifest")?;
    let graph = container.dependency_graph();
    let order = container.topological_order().context("Invalid service graph")?;

    match format {
        OutputFormat::Json => {
            let output = json!({ "graph": graph, "order": order });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("{} ({} services)", "Dependency graph".bold(), graph.len());
            for node in graph.nodes() {
                if node.deps.is_empty() {
                    println!("  {}", node.name.cyan());
                } else {
                    println!("  {} → {}", node.name.cyan(), node.deps.join(", "));
                }
            }
            println!();
            println!("{}", "Initialization order".bold());
            for (i, name) in order.iter().enumerate() {
                println!("  {}. {}", i + 1, name);
            }
        }
    }

    if init {
        let initialized = container.initialize_all().await?;
        let report = container.cleanup().await;
        println!(
            "{} Initialized {} services, cleaned up {}",
            "✓".green(),
            initialized.len(),
            report.cleaned.len()
        );
    }
    Ok(())
}

fn cmd_state(config: &Config, command: StateCommand) -> Result<()> {
    debug!(?command, "cmd_state: called");
    let storage = FileStorage::open(&config.state.storage_dir).context(format!(
        "Failed to open state storage at {}",
        config.state.storage_dir.display()
    ))?;
    let state = StateManager::builder().config(config.state.clone()).storage(storage).build();

    match command {
        StateCommand::Show => {
            let values = state.persisted_values();
            if values.is_empty() {
                println!("No persisted state");
            } else {
                for (key, value) in &values {
                    println!("{} = {}", key.cyan(), value);
                }
            }
        }
        StateCommand::Get { key } => match state.persisted_values().get(&key) {
            Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
            None => eyre::bail!("Key not persisted: {}", key),
        },
        StateCommand::Set { key, value } => {
            let value: Value = serde_json::from_str(&value).context(format!("Invalid JSON value for '{}'", key))?;
            state.set(&key, value, "cli")?;
            if !state.persist(&[key.as_str()]) {
                eyre::bail!("Failed to persist '{}'", key);
            }
            println!("{} Persisted {}", "✓".green(), key.cyan());
        }
        StateCommand::Clear => {
            if !state.clear_persisted() {
                eyre::bail!("Failed to clear persisted state");
            }
            println!("{} Cleared persisted state", "✓".green());
        }
    }
    Ok(())
}

async fn cmd_demo(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_demo: called");
    let report = run_demo(config).await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "Initialization order".bold());
    for (i, name) in report.init_order.iter().enumerate() {
        println!("  {}. {}", i + 1, name);
    }
    println!();
    println!("{} {}", "Instantiated".bold(), report.instantiated.join(", "));
    println!();
    println!("{}", "Event history".bold());
    for (name, source) in &report.events {
        println!("  {} {}", name.yellow(), source.as_deref().unwrap_or("-").dimmed());
    }
    if !report.unheard.is_empty() {
        println!();
        println!("{}", "Unheard events".bold());
        for name in &report.unheard {
            println!("  {}", name.yellow());
        }
    }
    println!();
    println!("{}", "State history".bold());
    for (source, keys) in &report.state_history {
        println!("  {} {}", source.cyan(), keys.join(", "));
    }
    println!();
    println!("{}", "Final state".bold());
    for (key, value) in &report.final_state {
        println!("  {} = {}", key.cyan(), value);
    }
    println!();
    if report.cleanup.is_clean() {
        println!("{} Cleaned up {} services", "✓".green(), report.cleanup.cleaned.len());
    } else {
        for (service, message) in &report.cleanup.failed {
            println!("{} {} cleanup failed: {}", "✗".red(), service, message);
        }
    }
    Ok(())
}
