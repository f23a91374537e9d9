// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `mvo` - admin CLI for the microVM task orchestrator.
//!
//! `allow`/`list`/`remove` manage the repository allowlist directly;
//! `serve` runs the HTTP tool server in the foreground.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mvo_core::{registry_path, state_dir, RepoRegistry};
use mvo_engine::{Orchestrator, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "mvo", about = "Run delegated agent tasks in isolated microVMs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a repository for use with tasks
    Allow {
        /// Path to the git repository
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Custom alias for the repo (defaults to the directory name)
        #[arg(short, long)]
        alias: Option<String>,
    },

    /// List registered repositories
    List,

    /// Remove a repository from the allowlist
    Remove {
        /// Repo alias
        alias: String,
    },

    /// Run the tool server in the foreground
    Serve {
        /// Address to bind
        #[arg(long, default_value = mvo_daemon::DEFAULT_BIND)]
        bind: SocketAddr,

        /// Directory containing the declarative VM builder (default.nix)
        #[arg(long, default_value = ".")]
        nix_dir: PathBuf,

        /// Maximum number of concurrent VM slots
        #[arg(long, default_value_t = mvo_core::DEFAULT_MAX_SLOTS)]
        max_slots: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Allow { path, alias } => {
            let registry = open_registry()?;
            let chosen = registry.allow(&path, alias.as_deref())?;
            println!("Registered: {chosen}");
        }
        Command::List => {
            let registry = open_registry()?;
            let repos = registry.list()?;
            if repos.is_empty() {
                println!("No repositories registered.");
                println!("Use 'mvo allow <path>' to register one.");
            } else {
                for (alias, entry) in repos {
                    println!("  {alias}: {}", entry.path.display());
                }
            }
        }
        Command::Remove { alias } => {
            let registry = open_registry()?;
            registry.remove(&alias)?;
            println!("Removed: {alias}");
        }
        Command::Serve { bind, nix_dir, max_slots } => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();

            let state = state_dir()?;
            let nix_dir = nix_dir
                .canonicalize()
                .with_context(|| format!("nix dir not found: {}", nix_dir.display()))?;
            let mut config = OrchestratorConfig::new(state, nix_dir);
            config.max_slots = max_slots;
            let orchestrator = Orchestrator::new(config);
            mvo_daemon::serve(orchestrator, bind).await?;
        }
    }
    Ok(())
}

fn open_registry() -> Result<RepoRegistry> {
    let state = state_dir()?;
    Ok(RepoRegistry::new(registry_path(&state)))
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
