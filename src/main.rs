mod access;
mod backup;
mod config;
mod console;
mod error;
mod models;
mod restart;
mod revision;
mod tui;

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use access::{OperatorTable, Role};
use config::KeeperConfig;
use console::Console;
use models::format_bytes;
use restart::{RestartRunner, Restarter, UnavailableRestarter};

// ============================================================================
// CLI Types
// ============================================================================

/// Keeper - edit docker compose files with automatic backups, rollback and restart
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Operator name to act as (defaults to $USER)
    #[arg(long = "as", value_name = "OPERATOR")]
    operator: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config, register the operator as admin, create the root
    Init,

    /// List tracked files under the root
    Files,

    /// List top-level directories under the root
    Dirs,

    /// Print a tracked file
    Cat { path: String },

    /// Create a directory under the root
    Mkdir { dir: String },

    /// Create a new file (fails if it exists)
    Create {
        path: String,
        /// Read content from this file instead of stdin
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Back up a file, then overwrite it
    Save {
        path: String,
        /// Read content from this file instead of stdin
        #[arg(long)]
        from: Option<PathBuf>,
        /// Restart the compose project afterwards
        #[arg(long)]
        restart: bool,
    },

    /// Run `down`, wait, then `up -d` against a compose file
    Restart { path: String },

    /// List backups of a file, oldest first
    Backups {
        path: String,
        #[arg(long)]
        json: bool,
    },

    /// Write the raw bytes of a backup to a file or stdout
    Download {
        path: String,
        identifier: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Restore a backup (current content is backed up first) and restart
    Rollback { path: String, identifier: String },

    /// Interactive terminal console (default)
    Tui,
}

impl Commands {
    fn needs_restart(&self) -> bool {
        matches!(
            self,
            Commands::Save { restart: true, .. } | Commands::Restart { .. } | Commands::Rollback { .. }
        )
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Tui);

    if let Commands::Init = command {
        init_logging(None)?;
        return init(&cli.config, cli.operator);
    }

    let config = KeeperConfig::load(&cli.config)?;
    let interactive = matches!(command, Commands::Tui);
    init_logging(interactive.then_some(config.log_file.as_path()))?;

    let restarter = build_restarter(&config, &command, interactive)?;
    let principals = Box::new(OperatorTable::from_env(
        config.operators.clone(),
        cli.operator,
    ));
    let console = Console::open(&config, restarter, principals)?;

    match command {
        Commands::Init => unreachable!("handled above"),
        Commands::Files => {
            for f in console.list_files()? {
                println!("{f}");
            }
        }
        Commands::Dirs => {
            for d in console.list_directories()? {
                println!("{d}");
            }
        }
        Commands::Cat { path } => {
            io::stdout().write_all(&console.read_file(&path)?)?;
        }
        Commands::Mkdir { dir } => {
            console.create_directory(&dir)?;
            println!("created {dir}");
        }
        Commands::Create { path, from } => {
            console.create_file(&path, &read_input(from.as_deref())?)?;
            println!("created {path}");
        }
        Commands::Save {
            path,
            from,
            restart,
        } => {
            let content = read_input(from.as_deref())?;
            let result = console.save_file(&path, &content, restart)?;
            println!("{} (backup {})", result.message, result.backup);
            if let Some(outcome) = result.restart {
                print!("{}", outcome.output);
                if !outcome.is_ok() {
                    return Ok(ExitCode::from(2));
                }
            }
        }
        Commands::Restart { path } => {
            let outcome = console.restart_file(&path)?;
            print!("{}", outcome.output);
            println!("{}", outcome.summary());
        }
        Commands::Backups { path, json } => {
            let backups = console.list_backups(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&backups)?);
            } else {
                for b in backups {
                    println!(
                        "{}  {}  {:>10}  {}",
                        b.identifier,
                        b.timestamp,
                        format_bytes(b.size),
                        b.sha256.get(..12).unwrap_or("")
                    );
                }
            }
        }
        Commands::Download {
            path,
            identifier,
            output,
        } => {
            let data = console.download_backup(&path, &identifier)?;
            match output {
                Some(out) => {
                    fs::write(&out, &data).with_context(|| format!("writing {}", out.display()))?
                }
                None => io::stdout().write_all(&data)?,
            }
        }
        Commands::Rollback { path, identifier } => {
            let result = console.rollback_file(&identifier, &path)?;
            println!(
                "restored {} from {} (previous content kept as {})",
                path, result.restored_from, result.pre_rollback_backup
            );
            print!("{}", result.restart.output);
            println!("{}", result.restart.summary());
            if !result.restart.is_ok() {
                return Ok(ExitCode::from(2));
            }
        }
        Commands::Tui => {
            let header = format!(
                "{} | retention {} | {}",
                console.root().display(),
                config.retention,
                restarter_label(&config)
            );
            tui::run(Arc::new(console), header)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helpers
// ============================================================================

fn init(config_path: &Path, operator: Option<String>) -> Result<ExitCode> {
    let mut config = KeeperConfig::load(config_path)?;
    let name = operator
        .or_else(|| std::env::var("USER").ok())
        .context("no operator name: pass --as or set $USER")?;
    config.operators.entry(name.clone()).or_insert(Role::Admin);
    config.save(config_path)?;
    fs::create_dir_all(&config.root_dir)
        .with_context(|| format!("creating {}", config.root_dir.display()))?;

    info!(config = %config_path.display(), operator = %name, "initialized");
    println!(
        "wrote {} (root {}, admin {name})",
        config_path.display(),
        config.root_dir.display()
    );
    Ok(ExitCode::SUCCESS)
}

/// Commands that restart resolve the orchestration command up front and fail
/// if none is available; the console degrades to browse/edit instead.
fn build_restarter(
    config: &KeeperConfig,
    command: &Commands,
    interactive: bool,
) -> Result<Arc<dyn Restarter>> {
    if !interactive && !command.needs_restart() {
        return Ok(Arc::new(UnavailableRestarter::new(
            "restart not enabled for this command",
        )));
    }
    match RestartRunner::from_config(&config.restart) {
        Ok(runner) => Ok(Arc::new(runner)),
        Err(e) if interactive => {
            warn!(error = %e, "restart disabled");
            Ok(Arc::new(UnavailableRestarter::new(e.to_string())))
        }
        Err(e) => Err(e.into()),
    }
}

fn restarter_label(config: &KeeperConfig) -> String {
    format!("{:?} restart", config.restart.strategy).to_lowercase()
}

fn read_input(from: Option<&Path>) -> Result<Vec<u8>> {
    match from {
        Some(p) => fs::read(p).with_context(|| format!("reading {}", p.display())),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

/// Stderr for one-shot commands; a log file for the terminal console so log
/// lines never land on the screen.
fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}
